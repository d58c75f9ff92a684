//! Token parsing and claim validation.
//!
//! Everything here works on the untrusted token text. Nothing in this module
//! checks signatures; [`verify_token`](crate::verifier::verify_token) strings
//! these pieces together in the required order.
//!
//! # Example
//!
//! ```
//! use jwks_authn::jwt::{decode_header, split_token, strip_bearer};
//!
//! # fn example() -> Result<(), jwks_authn::error::AuthError> {
//! let raw = "Bearer eyJhbGciOiJSUzI1NiIsImtpZCI6IksxIn0.eyJzdWIiOiJ1c2VyIn0.c2ln";
//! let token = strip_bearer(raw);
//! let parts = split_token(token)?;
//! let header = decode_header(parts.header)?;
//!
//! assert_eq!(header.alg, "RS256");
//! assert_eq!(header.kid.as_deref(), Some("K1"));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{config::ValidationConfig, error::AuthError};

/// Longest token accepted, in bytes.
pub const MAX_TOKEN_LENGTH: usize = 16 * 1024;

/// Strips an optional, case-insensitive `Bearer ` prefix and surrounding
/// whitespace.
#[must_use]
pub fn strip_bearer(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some((scheme, rest)) = trimmed.split_at_checked(7)
        && scheme.eq_ignore_ascii_case("bearer ")
    {
        return rest.trim_start();
    }
    trimmed
}

/// The three base64url segments of a compact JWS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenParts<'a> {
    /// Encoded header.
    pub header: &'a str,
    /// Encoded payload.
    pub payload: &'a str,
    /// Encoded signature.
    pub signature: &'a str,
    /// `header.payload`, the bytes the signature covers.
    pub signing_input: &'a str,
}

/// Splits a compact JWS into its segments.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] unless the token is at most
/// [`MAX_TOKEN_LENGTH`] bytes and consists of exactly three non-empty,
/// dot-separated segments.
pub fn split_token(token: &str) -> Result<TokenParts<'_>, AuthError> {
    if token.len() > MAX_TOKEN_LENGTH {
        return Err(AuthError::malformed(format!(
            "token exceeds {MAX_TOKEN_LENGTH} bytes (got {})",
            token.len()
        )));
    }

    let malformed = || AuthError::malformed("token must have 3 non-empty parts separated by dots");
    let (signing_input, signature) = token.rsplit_once('.').ok_or_else(malformed)?;
    let (header, payload) = signing_input.split_once('.').ok_or_else(malformed)?;
    if header.is_empty() || payload.is_empty() || signature.is_empty() || payload.contains('.') {
        return Err(malformed());
    }

    Ok(TokenParts { header, payload, signature, signing_input })
}

/// JOSE header of a signed token.
///
/// `alg` is kept as text so that values `jsonwebtoken` does not model, such
/// as `none`, reach the algorithm check and fail there.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenHeader {
    /// Declared signing algorithm.
    pub alg: String,
    /// Key identifier.
    #[serde(default)]
    pub kid: Option<String>,
    /// Media type, usually `JWT`.
    #[serde(default)]
    pub typ: Option<String>,
    #[serde(default)]
    crit: Option<Vec<String>>,
}

/// Decodes the header segment.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the segment is not base64url JSON
/// with a string `alg`, or if it lists critical extensions (none are
/// supported).
pub fn decode_header(segment: &str) -> Result<TokenHeader, AuthError> {
    let header: TokenHeader = decode_segment("header", segment)?;
    if header.crit.as_ref().is_some_and(|crit| !crit.is_empty()) {
        return Err(AuthError::malformed("unsupported critical header parameters"));
    }
    Ok(header)
}

/// `aud` claim: a single audience or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// One audience.
    One(String),
    /// Several audiences.
    Many(Vec<String>),
}

impl Audience {
    /// Returns `true` if `audience` is one of the values.
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        self.iter().any(|value| value == audience)
    }

    /// Iterates over the values.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        };
        values.iter().map(String::as_str)
    }
}

/// Claims of a verified token.
///
/// The registered claims are typed; every other claim is kept in a sidecar
/// map and reachable through [`claim`](Self::claim) or the typed accessors
/// for common provider claims.
///
/// Access tokens from some providers omit `aud` and carry `client_id`
/// instead; [`audience`](Self::audience) is `None` for those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    sub: String,
    iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aud: Option<Audience>,
    exp: i64,
    iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jti: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TokenClaims {
    /// Subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.sub
    }

    /// Issuer.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.iss
    }

    /// Audience, if the token carries `aud`.
    #[must_use]
    pub fn audience(&self) -> Option<&Audience> {
        self.aud.as_ref()
    }

    /// Expiry, in seconds since the Unix epoch.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.exp
    }

    /// Issue time, in seconds since the Unix epoch.
    #[must_use]
    pub fn issued_at(&self) -> i64 {
        self.iat
    }

    /// Not-before time, in seconds since the Unix epoch.
    #[must_use]
    pub fn not_before(&self) -> Option<i64> {
        self.nbf
    }

    /// Token identifier.
    #[must_use]
    pub fn jwt_id(&self) -> Option<&str> {
        self.jti.as_deref()
    }

    /// Any claim other than the registered ones above.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    /// All non-registered claims.
    #[must_use]
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// `token_use` (`id` or `access`).
    #[must_use]
    pub fn token_use(&self) -> Option<&str> {
        self.string_claim("token_use")
    }

    /// `client_id`, present on access tokens.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.string_claim("client_id")
    }

    /// User name, from `cognito:username` (ID tokens) or `username` (access
    /// tokens).
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.string_claim("cognito:username").or_else(|| self.string_claim("username"))
    }

    /// Group memberships from `cognito:groups`; empty when absent.
    #[must_use]
    pub fn groups(&self) -> Vec<&str> {
        match self.extra.get("cognito:groups") {
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Space-separated `scope` values; empty when absent.
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        self.string_claim("scope").map(|scope| scope.split_whitespace().collect()).unwrap_or_default()
    }

    /// `email_verified`, accepting both JSON booleans and `"true"`/`"false"`.
    #[must_use]
    pub fn email_verified(&self) -> Option<bool> {
        match self.extra.get("email_verified")? {
            Value::Bool(verified) => Some(*verified),
            Value::String(text) if text.eq_ignore_ascii_case("true") => Some(true),
            Value::String(text) if text.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    fn string_claim(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }
}

/// Decodes the payload segment into claims.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the segment is not base64url JSON
/// or a required claim (`sub`, `iss`, `exp`, `iat`) is absent or mistyped.
pub fn decode_claims(segment: &str) -> Result<TokenClaims, AuthError> {
    decode_segment("payload", segment)
}

/// Checks claims against `config` at `now` (seconds since the Unix epoch).
///
/// Checks run in this order, and the first failure is returned:
///
/// 1. `exp`: rejected once `exp + leeway <= now`
/// 2. `nbf`: rejected while `nbf > now + leeway`
/// 3. `iat`: rejected if later than `now + leeway`, or older than the
///    configured maximum token age
/// 4. `iss`: must equal the expected issuer exactly
/// 5. `aud`: must contain the expected audience; without `aud`, `client_id`
///    must equal it
/// 6. `sub`: must be non-empty
/// 7. `token_use`: must equal the expected value, when one is configured
///
/// # Errors
///
/// Returns [`AuthError::ClaimValidation`] naming the failed claim.
pub fn validate_claims(
    claims: &TokenClaims,
    config: &ValidationConfig,
    now: i64,
) -> Result<(), AuthError> {
    let leeway = i64::try_from(config.leeway().as_secs()).unwrap_or(i64::MAX);

    if claims.exp.saturating_add(leeway) <= now {
        return Err(AuthError::claim("exp", format!("token expired at {}", claims.exp)));
    }

    if let Some(nbf) = claims.nbf
        && nbf > now.saturating_add(leeway)
    {
        return Err(AuthError::claim("nbf", format!("token not valid before {nbf}")));
    }

    if claims.iat > now.saturating_add(leeway) {
        return Err(AuthError::claim("iat", "token issued in the future"));
    }
    if let Some(max_age) = config.max_token_age() {
        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(claims.iat) > max_age {
            return Err(AuthError::claim(
                "iat",
                format!("token older than the maximum age of {max_age}s"),
            ));
        }
    }

    if claims.iss != config.expected_issuer() {
        return Err(AuthError::claim(
            "iss",
            format!("expected '{}', got '{}'", config.expected_issuer(), claims.iss),
        ));
    }

    let expected_audience = config.expected_audience();
    let audience_ok = match (&claims.aud, claims.client_id()) {
        (Some(aud), _) => aud.contains(expected_audience),
        (None, Some(client_id)) => client_id == expected_audience,
        (None, None) => false,
    };
    if !audience_ok {
        return Err(AuthError::claim(
            "aud",
            format!("token is not addressed to '{expected_audience}'"),
        ));
    }

    if claims.sub.trim().is_empty() {
        return Err(AuthError::claim("sub", "subject is empty"));
    }

    if let Some(expected) = config.expected_token_use()
        && claims.token_use() != Some(expected)
    {
        return Err(AuthError::claim(
            "token_use",
            format!("expected '{expected}', got '{}'", claims.token_use().unwrap_or("<none>")),
        ));
    }

    Ok(())
}

fn decode_segment<T: DeserializeOwned>(what: &str, segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::malformed(format!("failed to decode token {what}: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::malformed(format!("failed to parse token {what}: {e}")))
}
