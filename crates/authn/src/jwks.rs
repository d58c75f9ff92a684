//! JWKS wire model and decoded signing keys.
//!
//! A discovery endpoint serves a [`JwkSet`]; the key cache turns it into a
//! [`KeySet`] of immutable [`SigningKey`]s indexed by key ID. Descriptors with
//! key types this crate cannot verify with are skipped instead of failing the
//! whole document.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{error::KeyDecodeError, validation::validate_kid};

/// Smallest RSA modulus accepted, in bytes (2048 bits).
pub const MIN_RSA_MODULUS_BYTES: usize = 256;

/// Length of an Ed25519 public key.
const ED25519_KEY_LENGTH: usize = 32;

/// One JSON Web Key as served by a discovery endpoint.
///
/// Only the parameters needed for signature verification are modelled;
/// unknown members are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (`RSA`, `EC`, `OKP`).
    pub kty: String,
    /// Key identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Intended algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Public key use (`sig` or `enc`).
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// RSA modulus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA public exponent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// Curve name for `EC` and `OKP` keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// X coordinate (`EC`) or public key (`OKP`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// Y coordinate (`EC`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// A JSON Web Key Set document: `{ "keys": [ ... ] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Key descriptors.
    pub keys: Vec<Jwk>,
}

/// Elliptic curves supported for `EC` keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    /// NIST P-256, used with ES256.
    P256,
    /// NIST P-384, used with ES384.
    P384,
}

impl EcCurve {
    /// JWK `crv` name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
        }
    }

    /// Byte length of one coordinate.
    #[must_use]
    pub fn coordinate_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
        }
    }

    fn algorithm(self) -> Algorithm {
        match self {
            Self::P256 => Algorithm::ES256,
            Self::P384 => Algorithm::ES384,
        }
    }
}

impl FromStr for EcCurve {
    type Err = KeyDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P-256" => Ok(Self::P256),
            "P-384" => Ok(Self::P384),
            other => Err(KeyDecodeError::UnsupportedCurve { curve: other.to_string() }),
        }
    }
}

/// Public key material decoded from its base64url wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// RSA modulus and exponent, big-endian.
    Rsa {
        /// Modulus bytes.
        n: Vec<u8>,
        /// Exponent bytes.
        e: Vec<u8>,
    },
    /// Elliptic curve point.
    Ec {
        /// Curve.
        curve: EcCurve,
        /// X coordinate bytes.
        x: Vec<u8>,
        /// Y coordinate bytes.
        y: Vec<u8>,
    },
    /// Ed25519 public key.
    Okp {
        /// Public key bytes.
        x: Vec<u8>,
    },
}

impl KeyMaterial {
    /// JWK `kty` for this material.
    #[must_use]
    pub fn key_type(&self) -> &'static str {
        match self {
            Self::Rsa { .. } => "RSA",
            Self::Ec { .. } => "EC",
            Self::Okp { .. } => "OKP",
        }
    }

    /// Returns `true` if `alg` belongs to this key's algorithm family.
    #[must_use]
    pub fn supports(&self, alg: Algorithm) -> bool {
        match self {
            Self::Rsa { .. } => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            Self::Ec { curve, .. } => alg == curve.algorithm(),
            Self::Okp { .. } => alg == Algorithm::EdDSA,
        }
    }

    fn decoding_key(&self) -> Result<DecodingKey, KeyDecodeError> {
        let key = match self {
            Self::Rsa { n, e } => DecodingKey::from_rsa_raw_components(n, e),
            Self::Ec { x, y, .. } => {
                DecodingKey::from_ec_components(&encode(x), &encode(y)).map_err(invalid_key)?
            },
            Self::Okp { x } => DecodingKey::from_ed_components(&encode(x)).map_err(invalid_key)?,
        };
        Ok(key)
    }
}

/// One public verification key.
///
/// Immutable once constructed: there are no setters, and the key cache hands
/// out `Arc<SigningKey>`.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    algorithm: Option<Algorithm>,
    material: KeyMaterial,
    decoding_key: DecodingKey,
}

impl SigningKey {
    /// Decodes a JWK.
    ///
    /// Returns `Ok(None)` for descriptors this crate does not verify with:
    /// unrecognized key types and keys whose `use` is not `sig`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyDecodeError`] when a recognized descriptor is missing a
    /// parameter, carries invalid base64url, names an unsupported curve or
    /// algorithm, or decodes to unusable material.
    pub fn from_jwk(jwk: &Jwk) -> Result<Option<Self>, KeyDecodeError> {
        if jwk.key_use.as_deref().is_some_and(|key_use| key_use != "sig") {
            return Ok(None);
        }

        let material = match jwk.kty.as_str() {
            "RSA" => {
                let n = decode_param("n", jwk.n.as_deref())?;
                let e = decode_param("e", jwk.e.as_deref())?;
                let significant = n.iter().skip_while(|b| **b == 0).count();
                if significant < MIN_RSA_MODULUS_BYTES {
                    return Err(KeyDecodeError::InvalidKey {
                        message: format!(
                            "RSA modulus is {} bits, minimum is {}",
                            significant * 8,
                            MIN_RSA_MODULUS_BYTES * 8
                        ),
                    });
                }
                if e.iter().all(|b| *b == 0) {
                    return Err(KeyDecodeError::InvalidKey {
                        message: "RSA exponent is zero".to_string(),
                    });
                }
                KeyMaterial::Rsa { n, e }
            },
            "EC" => {
                let curve: EcCurve = jwk
                    .crv
                    .as_deref()
                    .ok_or(KeyDecodeError::MissingParameter { param: "crv" })?
                    .parse()?;
                let x = decode_param("x", jwk.x.as_deref())?;
                let y = decode_param("y", jwk.y.as_deref())?;
                if x.len() != curve.coordinate_len() || y.len() != curve.coordinate_len() {
                    return Err(KeyDecodeError::InvalidKey {
                        message: format!(
                            "{} coordinates must be {} bytes",
                            curve.name(),
                            curve.coordinate_len()
                        ),
                    });
                }
                KeyMaterial::Ec { curve, x, y }
            },
            "OKP" => {
                match jwk.crv.as_deref() {
                    Some("Ed25519") => {},
                    Some(other) => {
                        return Err(KeyDecodeError::UnsupportedCurve { curve: other.to_string() });
                    },
                    None => return Err(KeyDecodeError::MissingParameter { param: "crv" }),
                }
                let x = decode_param("x", jwk.x.as_deref())?;
                if x.len() != ED25519_KEY_LENGTH {
                    return Err(KeyDecodeError::InvalidKey {
                        message: format!(
                            "Ed25519 keys must be {ED25519_KEY_LENGTH} bytes, got {}",
                            x.len()
                        ),
                    });
                }
                KeyMaterial::Okp { x }
            },
            _ => return Ok(None),
        };

        let kid = jwk.kid.clone().ok_or(KeyDecodeError::MissingParameter { param: "kid" })?;
        validate_kid(&kid)
            .map_err(|e| KeyDecodeError::InvalidKey { message: format!("bad kid: {e}") })?;

        let algorithm = jwk
            .alg
            .as_deref()
            .map(|alg| {
                Algorithm::from_str(alg)
                    .map_err(|_| KeyDecodeError::UnknownAlgorithm { alg: alg.to_string() })
            })
            .transpose()?;

        Self::new(kid, algorithm, material).map(Some)
    }

    /// Creates a signing key from already-decoded material.
    ///
    /// # Errors
    ///
    /// Returns [`KeyDecodeError::InvalidKey`] if `algorithm` does not belong
    /// to the material's family or the material cannot back a decoding key.
    pub fn new(
        kid: impl Into<String>,
        algorithm: Option<Algorithm>,
        material: KeyMaterial,
    ) -> Result<Self, KeyDecodeError> {
        if let Some(alg) = algorithm
            && !material.supports(alg)
        {
            return Err(KeyDecodeError::InvalidKey {
                message: format!("algorithm {alg:?} does not match key type {}", material.key_type()),
            });
        }
        let decoding_key = material.decoding_key()?;
        Ok(Self { kid: kid.into(), algorithm, material, decoding_key })
    }

    /// Key identifier.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Algorithm the key is pinned to, if the descriptor declared one.
    #[must_use]
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    /// Decoded key material.
    #[must_use]
    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    /// Key prepared for `jsonwebtoken` signature checks.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Returns `true` if this key may verify a signature made with `alg`.
    ///
    /// The algorithm must belong to the key's family and, when the key is
    /// pinned to an algorithm, equal it.
    #[must_use]
    pub fn supports(&self, alg: Algorithm) -> bool {
        self.material.supports(alg) && self.algorithm.is_none_or(|pinned| pinned == alg)
    }

    /// Encodes this key back into its JWK wire form.
    #[must_use]
    pub fn to_jwk(&self) -> Jwk {
        let mut jwk = Jwk {
            kty: self.material.key_type().to_string(),
            kid: Some(self.kid.clone()),
            alg: self.algorithm.map(|alg| format!("{alg:?}")),
            key_use: Some("sig".to_string()),
            ..Jwk::default()
        };
        match &self.material {
            KeyMaterial::Rsa { n, e } => {
                jwk.n = Some(encode(n));
                jwk.e = Some(encode(e));
            },
            KeyMaterial::Ec { curve, x, y } => {
                jwk.crv = Some(curve.name().to_string());
                jwk.x = Some(encode(x));
                jwk.y = Some(encode(y));
            },
            KeyMaterial::Okp { x } => {
                jwk.crv = Some("Ed25519".to_string());
                jwk.x = Some(encode(x));
            },
        }
        jwk
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("kty", &self.material.key_type())
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl PartialEq for SigningKey {
    fn eq(&self, other: &Self) -> bool {
        self.kid == other.kid && self.algorithm == other.algorithm && self.material == other.material
    }
}

impl Eq for SigningKey {}

/// Keys fetched from one discovery document, indexed by key ID.
///
/// A key set is never modified after construction. The key cache replaces
/// the whole set on refresh, and it expires as a unit.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: HashMap<String, Arc<SigningKey>>,
    fetched_at: Instant,
}

impl KeySet {
    /// Builds a key set from a fetched document.
    ///
    /// Unrecognized key types are skipped at debug level; recognized but
    /// undecodable descriptors and duplicate key IDs are skipped with a
    /// warning.
    #[must_use]
    pub fn from_jwk_set(document: &JwkSet, fetched_at: Instant) -> Self {
        let mut keys = HashMap::with_capacity(document.keys.len());
        for jwk in &document.keys {
            match SigningKey::from_jwk(jwk) {
                Ok(Some(key)) => {
                    if keys.contains_key(key.kid()) {
                        tracing::warn!(kid = key.kid(), "duplicate kid in key set, keeping first");
                        continue;
                    }
                    keys.insert(key.kid().to_string(), Arc::new(key));
                },
                Ok(None) => {
                    tracing::debug!(
                        kty = %jwk.kty,
                        kid = jwk.kid.as_deref().unwrap_or_default(),
                        "skipping key descriptor that is not a supported signing key"
                    );
                },
                Err(err) => {
                    tracing::warn!(
                        kty = %jwk.kty,
                        kid = jwk.kid.as_deref().unwrap_or_default(),
                        error = %err,
                        "skipping undecodable key descriptor"
                    );
                },
            }
        }
        Self { keys, fetched_at }
    }

    /// Builds a key set from already-decoded keys.
    #[must_use]
    pub fn from_keys(keys: impl IntoIterator<Item = SigningKey>, fetched_at: Instant) -> Self {
        let keys = keys.into_iter().map(|key| (key.kid().to_string(), Arc::new(key))).collect();
        Self { keys, fetched_at }
    }

    /// Looks up a key by ID.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.keys.get(kid).cloned()
    }

    /// Number of usable keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the document contained no usable keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key IDs in this set, in no particular order.
    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// When the document was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Age of the set at `now`.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }
}

fn decode_param(param: &'static str, value: Option<&str>) -> Result<Vec<u8>, KeyDecodeError> {
    let value = value.ok_or(KeyDecodeError::MissingParameter { param })?;
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| KeyDecodeError::InvalidEncoding { param, message: e.to_string() })?;
    if bytes.is_empty() {
        return Err(KeyDecodeError::MissingParameter { param });
    }
    Ok(bytes)
}

fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn invalid_key(err: jsonwebtoken::errors::Error) -> KeyDecodeError {
    KeyDecodeError::InvalidKey { message: err.to_string() }
}
