//! Authentication error types.
//!
//! This module defines the errors produced while validating bearer tokens,
//! fetching key sets from a discovery endpoint, decoding individual JWKs, and
//! building configuration.
//!
//! Every [`AuthError`] is a per-request failure. None of them is retried
//! internally except the single key-rotation retry performed by
//! [`verify_token`](crate::verifier::verify_token).

use std::time::Duration;

use thiserror::Error;

/// Token validation errors.
///
/// Request-handling layers should map every variant to an unauthorized
/// response, except [`AuthError::KeyRetrieval`], which means the token could
/// not be checked at all and maps to a server error (see
/// [`is_server_error`](Self::is_server_error)).
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`: new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The token is not a structurally valid signed JWT, or its header or
    /// payload cannot be decoded.
    #[error("Malformed token: {message}")]
    MalformedToken {
        /// What was wrong with the token.
        message: String,
    },

    /// The declared algorithm is not in the allowed set.
    #[error("Unsupported algorithm: {message}")]
    UnsupportedAlgorithm {
        /// The `alg` value from the token header.
        algorithm: String,
        /// Why the algorithm was rejected.
        message: String,
    },

    /// No signing key with this identifier exists in the current key set,
    /// even after a forced refresh.
    #[error("Unknown signing key: {kid}")]
    UnknownKey {
        /// Key ID taken from the token header.
        kid: String,
    },

    /// The key set could not be fetched from the discovery endpoint.
    #[error("Key retrieval failed: {source}")]
    KeyRetrieval {
        /// The underlying fetch failure.
        #[source]
        source: FetchError,
    },

    /// The signature does not verify against the resolved key.
    #[error("Invalid signature: {message}")]
    SignatureInvalid {
        /// Why verification failed.
        message: String,
    },

    /// A claim failed validation.
    #[error("Invalid {claim} claim: {message}")]
    ClaimValidation {
        /// Name of the offending claim (`exp`, `iss`, `aud`, ...).
        claim: &'static str,
        /// Why the claim was rejected.
        message: String,
    },
}

impl AuthError {
    /// Creates a [`AuthError::MalformedToken`] error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedToken { message: message.into() }
    }

    /// Creates a [`AuthError::UnsupportedAlgorithm`] error.
    #[must_use]
    pub fn unsupported_algorithm(algorithm: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm { algorithm: algorithm.into(), message: message.into() }
    }

    /// Creates a [`AuthError::UnknownKey`] error.
    #[must_use]
    pub fn unknown_key(kid: impl Into<String>) -> Self {
        Self::UnknownKey { kid: kid.into() }
    }

    /// Creates a [`AuthError::SignatureInvalid`] error.
    #[must_use]
    pub fn signature_invalid(message: impl Into<String>) -> Self {
        Self::SignatureInvalid { message: message.into() }
    }

    /// Creates a [`AuthError::ClaimValidation`] error for the named claim.
    #[must_use]
    pub fn claim(claim: &'static str, message: impl Into<String>) -> Self {
        Self::ClaimValidation { claim, message: message.into() }
    }

    /// Returns the name of the failed claim, if this is a claim error.
    #[must_use]
    pub fn failed_claim(&self) -> Option<&'static str> {
        match self {
            Self::ClaimValidation { claim, .. } => Some(claim),
            _ => None,
        }
    }

    /// Returns `true` when the token could not be checked because the key set
    /// was unavailable.
    ///
    /// Callers should answer these with a server error instead of an
    /// unauthorized response, and should not echo the error detail.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::KeyRetrieval { .. })
    }

    /// Returns a message that is safe to put in a response body.
    ///
    /// Retrieval details (hosts, status codes, transport errors) are never
    /// included.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::KeyRetrieval { .. } => "unable to verify token at this time",
            Self::ClaimValidation { claim: "exp", .. } => "token expired",
            _ => "invalid token",
        }
    }
}

impl From<FetchError> for AuthError {
    fn from(source: FetchError) -> Self {
        Self::KeyRetrieval { source }
    }
}

/// Failure to retrieve a key set from a discovery endpoint.
///
/// `Clone` so that one fetch outcome can be handed to every caller that
/// joined the same in-flight refresh.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    /// Transport-level failure (DNS, connect, TLS, reset).
    #[error("Network error: {message}")]
    Network {
        /// Description of the transport failure.
        message: String,
    },

    /// The endpoint answered with a non-success status.
    #[error("Discovery endpoint returned HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The response body is not a key set document.
    #[error("Malformed key set document: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },

    /// The fetch did not complete within the configured timeout.
    #[error("Key set fetch timed out after {timeout:?}")]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Any other failure (task aborted, injected fault).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl FetchError {
    /// Creates a [`FetchError::Network`] error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a [`FetchError::Status`] error.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self::Status { status }
    }

    /// Creates a [`FetchError::Decode`] error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode { message: message.into() }
    }

    /// Creates a [`FetchError::Timeout`] error.
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a [`FetchError::Internal`] error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns `true` for failures that may clear up on their own
    /// (transport errors, timeouts, 5xx and 429 responses).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Status { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Failure to decode a single JWK into a [`SigningKey`](crate::jwks::SigningKey).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyDecodeError {
    /// A parameter required by the key type is absent.
    #[error("missing '{param}' parameter")]
    MissingParameter {
        /// JWK parameter name.
        param: &'static str,
    },

    /// A parameter is not valid base64url.
    #[error("invalid base64url in '{param}': {message}")]
    InvalidEncoding {
        /// JWK parameter name.
        param: &'static str,
        /// Decoder message.
        message: String,
    },

    /// The curve is not one this crate can verify with.
    #[error("unsupported curve '{curve}'")]
    UnsupportedCurve {
        /// The `crv` value.
        curve: String,
    },

    /// The declared `alg` is unknown.
    #[error("unknown algorithm '{alg}'")]
    UnknownAlgorithm {
        /// The `alg` value.
        alg: String,
    },

    /// The decoded material is not a usable public key.
    #[error("invalid key material: {message}")]
    InvalidKey {
        /// Description of the problem.
        message: String,
    },
}

/// Configuration errors raised when building a
/// [`ValidationConfig`](crate::config::ValidationConfig),
/// [`KeyCacheConfig`](crate::config::KeyCacheConfig) or
/// [`KeySource`](crate::config::KeySource).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A field has an unusable value.
    #[error("Invalid {field}: {message}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },

    /// An algorithm that must never be accepted was placed in the allowed set.
    #[error("Algorithm '{algorithm}' is not allowed for security reasons")]
    ForbiddenAlgorithm {
        /// The offending algorithm.
        algorithm: String,
    },
}

impl ConfigError {
    /// Creates a [`ConfigError::InvalidValue`] error.
    #[must_use]
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue { field, message: message.into() }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
