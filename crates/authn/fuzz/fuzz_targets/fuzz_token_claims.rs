//! Structured fuzz target for claim decoding and validation.
//!
//! Uses the `arbitrary` crate to generate structured token-like inputs,
//! assembles them into base64url segments, and feeds them through header
//! and claim validation. This reaches deeper code paths than raw byte
//! fuzzing because the inputs are plausible tokens.

#![no_main]

use arbitrary::Arbitrary;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::Algorithm;
use jwks_authn::{
    ValidationConfig,
    jwt::{decode_claims, decode_header, split_token, validate_claims},
    validation::{validate_algorithm, validate_kid},
};
use libfuzzer_sys::fuzz_target;
use serde_json::{Map, Value, json};

/// Structured input representing a fuzzed token.
#[derive(Debug, Arbitrary)]
struct FuzzedToken {
    alg: FuzzedAlg,
    kid: Option<String>,
    iss: String,
    sub: String,
    aud: FuzzedAudience,
    exp: i64,
    iat: i64,
    nbf: Option<i64>,
    token_use: Option<String>,
    client_id: Option<String>,
    groups: Vec<String>,
    signature_bytes: Vec<u8>,
    now: i64,
}

/// Fuzzed algorithm values covering known attack vectors.
#[derive(Debug, Arbitrary)]
enum FuzzedAlg {
    EdDSA,
    None,
    HS256,
    RS256,
    PS256,
    ES256,
    ES384,
    Other(String),
}

impl FuzzedAlg {
    fn as_str(&self) -> &str {
        match self {
            Self::EdDSA => "EdDSA",
            Self::None => "none",
            Self::HS256 => "HS256",
            Self::RS256 => "RS256",
            Self::PS256 => "PS256",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::Other(s) => s,
        }
    }
}

#[derive(Debug, Arbitrary)]
enum FuzzedAudience {
    Absent,
    One(String),
    Many(Vec<String>),
}

fn build_token(input: &FuzzedToken) -> String {
    let mut header = Map::new();
    header.insert("alg".into(), json!(input.alg.as_str()));
    if let Some(ref kid) = input.kid {
        header.insert("kid".into(), json!(kid));
    }

    let mut payload = Map::new();
    payload.insert("iss".into(), json!(input.iss));
    payload.insert("sub".into(), json!(input.sub));
    payload.insert("exp".into(), json!(input.exp));
    payload.insert("iat".into(), json!(input.iat));
    match &input.aud {
        FuzzedAudience::Absent => {},
        FuzzedAudience::One(aud) => {
            payload.insert("aud".into(), json!(aud));
        },
        FuzzedAudience::Many(auds) => {
            payload.insert("aud".into(), json!(auds));
        },
    }
    if let Some(nbf) = input.nbf {
        payload.insert("nbf".into(), json!(nbf));
    }
    if let Some(ref token_use) = input.token_use {
        payload.insert("token_use".into(), json!(token_use));
    }
    if let Some(ref client_id) = input.client_id {
        payload.insert("client_id".into(), json!(client_id));
    }
    payload.insert("cognito:groups".into(), json!(input.groups));

    let encode = |value: Value| URL_SAFE_NO_PAD.encode(serde_json::to_vec(&value).unwrap_or_default());
    format!(
        "{}.{}.{}",
        encode(Value::Object(header)),
        encode(Value::Object(payload)),
        URL_SAFE_NO_PAD.encode(&input.signature_bytes)
    )
}

fuzz_target!(|input: FuzzedToken| {
    let token = build_token(&input);
    let Ok(parts) = split_token(&token) else {
        return;
    };

    if let Ok(header) = decode_header(parts.header) {
        let _ = validate_algorithm(&header.alg, &[Algorithm::RS256, Algorithm::ES256]);
        if let Some(ref kid) = header.kid {
            let _ = validate_kid(kid);
        }
    }

    let Ok(claims) = decode_claims(parts.payload) else {
        return;
    };
    let _ = claims.groups();
    let _ = claims.scopes();

    let expected_audience = match &input.aud {
        FuzzedAudience::One(aud) if !aud.trim().is_empty() => aud.clone(),
        _ => "fuzz-client".to_owned(),
    };
    let Ok(config) = ValidationConfig::builder()
        .expected_issuer("https://issuer.example/pool")
        .expected_audience(expected_audience)
        .maybe_expected_token_use(input.token_use.clone().filter(|t| !t.trim().is_empty()))
        .build()
    else {
        return;
    };
    let _ = validate_claims(&claims, &config, input.now);
});
