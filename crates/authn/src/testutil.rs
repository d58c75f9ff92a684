//! Shared test utilities for token verification.
//!
//! Key pair generation, signed and hand-crafted tokens, and an in-memory
//! [`KeySetFetcher`]. Compiled for this crate's unit tests and, behind the
//! `testutil` feature, for downstream crates that want to exercise a
//! [`TokenValidator`](crate::TokenValidator) without a live discovery
//! endpoint:
//!
//! ```toml
//! [dev-dependencies]
//! jwks-authn = { version = "0.1", features = ["testutil"] }
//! ```
#![allow(clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use rand_core::OsRng;
use rsa::{RsaPrivateKey, pkcs1::EncodeRsaPrivateKey, traits::PublicKeyParts};
use serde_json::{Value, json};
use zeroize::Zeroizing;

use crate::{
    config::KeySource,
    error::FetchError,
    fetcher::KeySetFetcher,
    jwks::{Jwk, JwkSet},
};

/// Issuer used by [`claims_for`] callers in this crate's tests.
pub const TEST_ISSUER: &str = "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_ABC123";

/// Audience used by this crate's tests.
pub const TEST_AUDIENCE: &str = "test-client";

/// Generates an Ed25519 key pair.
///
/// Returns `(pkcs8_der, public_key)`: the private key in PKCS#8 DER form
/// (for [`EncodingKey::from_ed_der`]) wrapped in [`Zeroizing`], and the raw
/// 32-byte public key.
pub fn generate_ed25519_keypair() -> (Zeroizing<Vec<u8>>, [u8; 32]) {
    let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
    let public_key = signing_key.verifying_key().to_bytes();

    let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
    let mut pkcs8_der = Zeroizing::new(vec![
        0x30, 0x2e, // SEQUENCE, 46 bytes
        0x02, 0x01, 0x00, // INTEGER version 0
        0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
        0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
        0x04, 0x22, // OCTET STRING, 34 bytes
        0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
    ]);
    pkcs8_der.extend_from_slice(&*private_bytes);

    (pkcs8_der, public_key)
}

/// Shared 2048-bit RSA key, generated once per test binary.
fn rsa_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("RSA key generation")
    })
}

/// Signs tokens and publishes the matching JWK.
pub struct TestSigner {
    kid: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    jwk: Jwk,
}

impl TestSigner {
    /// Signer with a fresh Ed25519 key (`EdDSA`).
    #[must_use]
    pub fn ed25519(kid: &str) -> Self {
        let (pkcs8_der, public_key) = generate_ed25519_keypair();
        let jwk = Jwk {
            kty: "OKP".into(),
            kid: Some(kid.into()),
            alg: Some("EdDSA".into()),
            key_use: Some("sig".into()),
            crv: Some("Ed25519".into()),
            x: Some(URL_SAFE_NO_PAD.encode(public_key)),
            ..Jwk::default()
        };
        Self {
            kid: kid.into(),
            algorithm: Algorithm::EdDSA,
            encoding_key: EncodingKey::from_ed_der(&pkcs8_der),
            jwk,
        }
    }

    /// Signer with the shared RSA test key (`RS256`).
    ///
    /// Every RSA signer in a test binary uses the same key material; give
    /// them different `kid`s to tell them apart.
    #[must_use]
    pub fn rsa(kid: &str) -> Self {
        let key = rsa_private_key();
        let der = key.to_pkcs1_der().expect("PKCS#1 encoding");
        let jwk = Jwk {
            kty: "RSA".into(),
            kid: Some(kid.into()),
            alg: Some("RS256".into()),
            key_use: Some("sig".into()),
            n: Some(URL_SAFE_NO_PAD.encode(key.n().to_bytes_be())),
            e: Some(URL_SAFE_NO_PAD.encode(key.e().to_bytes_be())),
            ..Jwk::default()
        };
        Self {
            kid: kid.into(),
            algorithm: Algorithm::RS256,
            encoding_key: EncodingKey::from_rsa_der(der.as_bytes()),
            jwk,
        }
    }

    /// Key identifier.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public JWK for this signer.
    #[must_use]
    pub fn jwk(&self) -> Jwk {
        self.jwk.clone()
    }

    /// Signs `claims` with a header naming this signer's `kid` and algorithm.
    ///
    /// # Panics
    ///
    /// Panics if encoding fails.
    #[must_use]
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());
        self.sign_with_header(&header, claims)
    }

    /// Signs `claims` under an arbitrary header.
    ///
    /// # Panics
    ///
    /// Panics if encoding fails, e.g. when the header algorithm does not
    /// match the key type.
    #[must_use]
    pub fn sign_with_header(&self, header: &Header, claims: &Value) -> String {
        jsonwebtoken::encode(header, claims, &self.encoding_key).expect("encode test token")
    }
}

/// Builds a key set document from signers.
#[must_use]
pub fn jwk_set(signers: &[&TestSigner]) -> JwkSet {
    JwkSet { keys: signers.iter().map(|signer| signer.jwk()).collect() }
}

/// Claims valid for one hour from now.
#[must_use]
pub fn claims_for(issuer: &str, audience: &str, subject: &str) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "sub": subject,
        "iss": issuer,
        "aud": audience,
        "exp": now + 3600,
        "iat": now,
        "token_use": "id",
    })
}

/// Builds `{header}.{payload}.{signature}` from raw JSON with a fixed,
/// meaningless signature.
///
/// Useful for attack tokens (`alg: none`, algorithm confusion) that must be
/// rejected before any signature check.
///
/// # Panics
///
/// Panics if JSON serialization fails.
#[must_use]
pub fn craft_raw_jwt(header_json: &Value, payload_json: &Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.c2lnbmF0dXJl")
}

/// In-memory [`KeySetFetcher`] with a swappable response, optional latency
/// and a call counter.
pub struct MockKeySetFetcher {
    response: Mutex<Result<JwkSet, FetchError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockKeySetFetcher {
    /// Fetcher answering immediately.
    #[must_use]
    pub fn new(response: Result<JwkSet, FetchError>) -> Arc<Self> {
        Self::with_delay(response, Duration::ZERO)
    }

    /// Fetcher that sleeps `delay` (on the Tokio clock) before answering.
    #[must_use]
    pub fn with_delay(response: Result<JwkSet, FetchError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { response: Mutex::new(response), delay, calls: AtomicUsize::new(0) })
    }

    /// Replaces the response returned by later calls.
    pub fn respond(&self, response: Result<JwkSet, FetchError>) {
        *self.response.lock() = response;
    }

    /// Number of fetches started.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetFetcher for MockKeySetFetcher {
    async fn fetch(&self, _source: &KeySource) -> Result<JwkSet, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response.lock().clone()
    }
}

/// Asserts that a [`Result<T, AuthError>`](crate::error::AuthError) is an
/// `Err` of the given variant.
///
/// ```
/// use jwks_authn::{assert_auth_error, error::AuthError};
///
/// let result: Result<(), AuthError> = Err(AuthError::unknown_key("K2"));
/// assert_auth_error!(result, UnknownKey);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{error::AuthError, jwks::SigningKey, jwt::split_token};

    #[test]
    fn test_generate_ed25519_keypair_produces_valid_key() {
        let (pkcs8_der, public_key) = generate_ed25519_keypair();
        // 16 header bytes + 32 key bytes
        assert_eq!(pkcs8_der.len(), 48);
        assert_ne!(public_key, [0u8; 32]);
    }

    #[test]
    fn test_signer_jwks_decode() {
        for signer in [TestSigner::ed25519("E1"), TestSigner::rsa("R1")] {
            let key = SigningKey::from_jwk(&signer.jwk()).unwrap().unwrap();
            assert_eq!(key.kid(), signer.kid());
        }
    }

    #[test]
    fn test_sign_produces_three_part_token() {
        let signer = TestSigner::ed25519("E1");
        let token = signer.sign(&claims_for(TEST_ISSUER, TEST_AUDIENCE, "user"));
        assert!(split_token(&token).is_ok());
    }

    #[test]
    fn test_craft_raw_jwt_has_signature() {
        let token = craft_raw_jwt(&json!({ "alg": "none" }), &json!({ "sub": "x" }));
        assert!(split_token(&token).is_ok());
    }

    #[test]
    fn test_assert_auth_error_macro() {
        let result: Result<(), AuthError> = Err(AuthError::signature_invalid("bad"));
        assert_auth_error!(result, SignatureInvalid);
        assert_auth_error!(result, SignatureInvalid, "signature should be rejected");
    }
}
