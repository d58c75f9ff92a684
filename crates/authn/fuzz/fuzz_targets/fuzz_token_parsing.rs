//! Fuzz target for token parsing and validation.
//!
//! Feeds arbitrary strings as bearer tokens through the parsing steps that
//! run before any key lookup. Every result must be either `Ok(...)` or
//! `Err(AuthError)`; no input may panic.

#![no_main]

use jsonwebtoken::Algorithm;
use jwks_authn::{
    ValidationConfig,
    jwt::{decode_claims, decode_header, split_token, strip_bearer, validate_claims},
    validation::{validate_algorithm, validate_kid},
};
use libfuzzer_sys::fuzz_target;

const ISSUER: &str = "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_ABC123";

fuzz_target!(|data: &[u8]| {
    // Only process valid UTF-8; tokens arrive as header strings
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(parts) = split_token(strip_bearer(raw)) else {
        return;
    };

    if let Ok(header) = decode_header(parts.header) {
        let _ = validate_algorithm(&header.alg, &[Algorithm::RS256, Algorithm::EdDSA]);
        if let Some(ref kid) = header.kid {
            let _ = validate_kid(kid);
        }
    }

    if let Ok(claims) = decode_claims(parts.payload)
        && let Ok(config) =
            ValidationConfig::builder().expected_issuer(ISSUER).expected_audience("aud").build()
    {
        // Boundary timestamps exercise the saturating arithmetic.
        for now in [0, claims.expires_at(), i64::MIN, i64::MAX] {
            let _ = validate_claims(&claims, &config, now);
        }
    }
});
