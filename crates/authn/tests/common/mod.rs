//! Helpers shared by the integration tests.
#![allow(dead_code, clippy::expect_used, clippy::panic)]

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
use jwks_authn::{
    FetchError, KeyCache, KeyCacheConfig, KeySetFetcher, KeySource, ValidationConfig,
    jwks::{Jwk, JwkSet},
};
use parking_lot::Mutex;
use rand_core::OsRng;
use rsa::{RsaPrivateKey, pkcs1::EncodeRsaPrivateKey, traits::PublicKeyParts};
use serde_json::{Value, json};
use zeroize::Zeroizing;

pub const REGION: &str = "us-east-1";
pub const POOL_ID: &str = "us-east-1_ABC123";
pub const ISSUER: &str = "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_ABC123";
pub const AUDIENCE: &str = "integration-client";

pub fn source() -> KeySource {
    KeySource::cognito(REGION, POOL_ID).expect("valid key source")
}

pub fn validation_config(algorithms: Vec<Algorithm>) -> ValidationConfig {
    ValidationConfig::builder()
        .expected_issuer(ISSUER)
        .expected_audience(AUDIENCE)
        .allowed_algorithms(algorithms)
        .build()
        .expect("valid validation config")
}

pub fn cache_with(fetcher: &Arc<ScriptedFetcher>) -> KeyCache {
    KeyCache::new(Arc::clone(fetcher) as Arc<dyn KeySetFetcher>, KeyCacheConfig::default())
}

fn rsa_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("RSA keygen"))
}

/// Signs tokens and publishes the matching public JWK.
pub struct Signer {
    kid: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    pub jwk: Jwk,
}

impl Signer {
    pub fn rsa(kid: &str) -> Self {
        let key = rsa_key();
        let der = key.to_pkcs1_der().expect("PKCS#1 DER");
        Self {
            kid: kid.into(),
            algorithm: Algorithm::RS256,
            encoding_key: EncodingKey::from_rsa_der(der.as_bytes()),
            jwk: Jwk {
                kty: "RSA".into(),
                kid: Some(kid.into()),
                alg: Some("RS256".into()),
                key_use: Some("sig".into()),
                n: Some(URL_SAFE_NO_PAD.encode(key.n().to_bytes_be())),
                e: Some(URL_SAFE_NO_PAD.encode(key.e().to_bytes_be())),
                ..Jwk::default()
            },
        }
    }

    pub fn ed25519(kid: &str) -> Self {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();

        let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
        let mut pkcs8_der = Zeroizing::new(vec![
            0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
            0x04, 0x20,
        ]);
        pkcs8_der.extend_from_slice(&*private_bytes);

        Self {
            kid: kid.into(),
            algorithm: Algorithm::EdDSA,
            encoding_key: EncodingKey::from_ed_der(&pkcs8_der),
            jwk: Jwk {
                kty: "OKP".into(),
                kid: Some(kid.into()),
                alg: Some("EdDSA".into()),
                key_use: Some("sig".into()),
                crv: Some("Ed25519".into()),
                x: Some(URL_SAFE_NO_PAD.encode(public_key)),
                ..Jwk::default()
            },
        }
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key).expect("encode token")
    }
}

pub fn key_set(signers: &[&Signer]) -> JwkSet {
    JwkSet { keys: signers.iter().map(|signer| signer.jwk.clone()).collect() }
}

/// Claims valid for an hour, issued now.
pub fn claims(subject: &str) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "sub": subject,
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": now + 3600,
        "iat": now,
        "token_use": "id",
    })
}

/// `{header}.{payload}.{signature}` with a fixed fake signature.
pub fn craft_raw_jwt(header: &Value, payload: &Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).expect("header json"));
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).expect("payload json"));
    format!("{header_b64}.{payload_b64}.c2lnbmF0dXJl")
}

/// In-memory fetcher with a swappable response and a call counter.
pub struct ScriptedFetcher {
    response: Mutex<Result<JwkSet, FetchError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(response: Result<JwkSet, FetchError>) -> Arc<Self> {
        Self::with_delay(response, Duration::ZERO)
    }

    pub fn with_delay(response: Result<JwkSet, FetchError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { response: Mutex::new(response), delay, calls: AtomicUsize::new(0) })
    }

    pub fn respond(&self, response: Result<JwkSet, FetchError>) {
        *self.response.lock() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetFetcher for ScriptedFetcher {
    async fn fetch(&self, _source: &KeySource) -> Result<JwkSet, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response.lock().clone()
    }
}
