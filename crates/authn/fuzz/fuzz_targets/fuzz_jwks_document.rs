//! Fuzz target for key set document decoding.
//!
//! Treats arbitrary bytes as a discovery response body and decodes every
//! descriptor into a signing key. Undecodable keys must surface as
//! `KeyDecodeError`, never as a panic.

#![no_main]

use jwks_authn::{JwkSet, SigningKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(document) = serde_json::from_slice::<JwkSet>(data) else {
        return;
    };

    for jwk in &document.keys {
        if let Ok(Some(key)) = SigningKey::from_jwk(jwk) {
            // Re-encoding a decoded key must yield a descriptor that decodes again.
            let reencoded = key.to_jwk();
            assert!(matches!(SigningKey::from_jwk(&reencoded), Ok(Some(_))));
        }
    }
});
