//! Algorithm and key ID checks.
//!
//! These run on the untrusted token header before any key is looked up, so a
//! forged header can never trigger a discovery fetch or reach the signature
//! check.
//!
//! # Security
//!
//! - `none` and the HMAC family are rejected unconditionally, even if a caller
//!   somehow lists them (config construction refuses them as well).
//! - Everything else must appear in the configured allow-list.
//! - Key IDs are bounded and restricted to printable ASCII before they are
//!   used as map keys or log fields.

use std::str::FromStr;

use jsonwebtoken::Algorithm;

use crate::error::AuthError;

/// JWT algorithms that are never accepted.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: symmetric, so anyone holding the published key
///   material could mint tokens
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Maximum accepted key ID length in bytes.
pub const MAX_KID_LENGTH: usize = 256;

/// Returns `true` for algorithms that can never verify against a public key.
#[must_use]
pub fn is_forbidden_algorithm(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

/// Checks a token header's `alg` against the allow-list.
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] if `alg` is forbidden, is not a
/// recognized JWS algorithm, or is not in `allowed`.
///
/// # Examples
///
/// ```
/// use jsonwebtoken::Algorithm;
/// use jwks_authn::validation::validate_algorithm;
///
/// let allowed = [Algorithm::RS256];
/// assert_eq!(validate_algorithm("RS256", &allowed).unwrap(), Algorithm::RS256);
/// assert!(validate_algorithm("ES256", &allowed).is_err());
/// assert!(validate_algorithm("none", &allowed).is_err());
/// ```
pub fn validate_algorithm(alg: &str, allowed: &[Algorithm]) -> Result<Algorithm, AuthError> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(AuthError::unsupported_algorithm(
            alg,
            format!("Algorithm '{alg}' is not allowed for security reasons"),
        ));
    }

    let parsed = Algorithm::from_str(alg).map_err(|_| {
        AuthError::unsupported_algorithm(alg, format!("Algorithm '{alg}' is not recognized"))
    })?;

    if !allowed.contains(&parsed) {
        return Err(AuthError::unsupported_algorithm(
            alg,
            format!("Algorithm '{alg}' is not in the accepted list"),
        ));
    }

    Ok(parsed)
}

/// Checks a key ID taken from a token header or a key set.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the key ID is empty, longer than
/// [`MAX_KID_LENGTH`], or contains anything other than printable,
/// non-whitespace ASCII.
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() {
        return Err(AuthError::malformed("kid cannot be empty"));
    }
    if kid.len() > MAX_KID_LENGTH {
        return Err(AuthError::malformed(format!(
            "kid exceeds {MAX_KID_LENGTH} bytes (got {})",
            kid.len()
        )));
    }
    if !kid.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(AuthError::malformed("kid contains non-printable or non-ASCII characters"));
    }
    Ok(())
}
