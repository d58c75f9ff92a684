//! # JWKS Authentication
//!
//! Bearer token verification against signing keys published at a JWKS
//! discovery endpoint.
//!
//! This crate provides:
//! - **Key cache**: Per-source key sets with TTL, coalesced refreshes, explicit invalidation and
//!   an optional stale-while-unavailable fallback
//! - **Token validation**: Header checks, signature verification and claim validation
//! - **Algorithm validation**: Security checks for JWT algorithms
//!
//! ## Features
//!
//! - Only asymmetric algorithms (RS*, PS*, ES256/384, EdDSA) are supported
//! - Symmetric algorithms (HS256, etc.) and `none` are explicitly rejected
//! - At most one discovery fetch per key source is in flight at any time
//! - A token naming an unknown `kid` triggers one rotation refetch after the initial fetch,
//!   shared by every concurrent token naming that `kid`
//!
//! ## Example
//!
//! ```no_run
//! use jwks_authn::{KeyCache, KeyCacheConfig, KeySource, ValidationConfig, verify_token};
//!
//! # async fn example(authorization: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = KeyCache::http(KeyCacheConfig::default())?;
//! let source = KeySource::cognito("us-east-1", "us-east-1_ABC123")?;
//! let config = ValidationConfig::for_source(&source, "7d8c2example")?;
//!
//! let claims = verify_token(authorization, &cache, &source, &config).await?;
//! println!("Verified subject: {}", claims.subject());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Key source and validation settings.
pub mod config;
/// Authentication error types.
pub mod error;
/// Key set retrieval.
pub mod fetcher;
/// JWK parsing and signing keys.
pub mod jwks;
/// JWT parsing and claims.
pub mod jwt;
/// Per-source signing key cache.
pub mod key_cache;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// Algorithm and key id validation.
pub mod validation;
/// Token verification.
pub mod verifier;

// Re-export key types for convenience
pub use config::{
    DEFAULT_CACHE_TTL, DEFAULT_FETCH_TIMEOUT, DEFAULT_LEEWAY, KeyCacheConfig, KeySource,
    ValidationConfig,
};
pub use error::{AuthError, FetchError, Result};
pub use fetcher::{HttpKeySetFetcher, KeySetFetcher, MAX_KEY_SET_BYTES};
pub use jwks::{Jwk, JwkSet, KeySet, SigningKey};
pub use jwt::{Audience, TokenClaims};
pub use key_cache::{Clock, KeyCache, KeyCacheMetricsSnapshot, SystemClock};
pub use validation::{FORBIDDEN_ALGORITHMS, validate_algorithm};
pub use verifier::{TokenValidator, verify_token};
