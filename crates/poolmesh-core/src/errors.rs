//! Unified error taxonomy for Poolmesh
//!
//! A single error enum covers every engine in the workspace. This mirrors
//! the "collapse exception-driven return-err idioms into one result type"
//! guidance: every fallible operation in `poolmesh-access`, `poolmesh-feed`,
//! `poolmesh-store` and `poolmesh-crypto` returns `poolmesh_core::Result<T>`.

use serde::{Deserialize, Serialize};

/// Unified error type for all Poolmesh operations.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum PoolError {
    /// The core was used before `Pool::open`/`Pool::create` completed.
    #[error("not initialized: {message}")]
    NotInitialized {
        /// Description of what was not yet initialized.
        message: String,
    },

    /// Every configured backend failed to respond to a ping.
    #[error("no reachable backend: {message}")]
    NoBackend {
        /// Description of the backend probe failure.
        message: String,
    },

    /// No access-file entry decrypts to a usable key, or export was
    /// attempted with no master key.
    #[error("not authorized: {message}")]
    NotAuthorized {
        /// Description of the authorization failure.
        message: String,
    },

    /// The local clock has no NTP offset and the operation imprints wall
    /// time into a signed record.
    #[error("clock not synced: {message}")]
    NoSyncClock {
        /// Description of the clock sync gap.
        message: String,
    },

    /// A signature failed verification (identity, head, access file, invite).
    #[error("invalid signature: {message}")]
    InvalidSignature {
        /// Description of the signature that failed to verify.
        message: String,
    },

    /// A decrypted body's content hash did not match the declared hash.
    #[error("integrity error: {message}")]
    IntegrityError {
        /// Description of the hash mismatch.
        message: String,
    },

    /// An invite token was malformed or its CRC did not match.
    #[error("invalid token: {message}")]
    InvalidToken {
        /// Description of the token decoding failure.
        message: String,
    },

    /// An id was syntactically valid but unknown locally.
    #[error("invalid id: {message}")]
    InvalidId {
        /// Description of the unknown id.
        message: String,
    },

    /// A persisted record carries a newer format version than understood.
    #[error("invalid version: {message}")]
    InvalidVersion {
        /// Description of the version mismatch.
        message: String,
    },

    /// The codec was asked to encrypt/decrypt under a key-id absent from
    /// the keystore.
    #[error("unknown key: {message}")]
    UnknownKey {
        /// Description of the missing key-id.
        message: String,
    },

    /// A backend-level object or directory is absent.
    #[error("not found: {message}")]
    NotFound {
        /// Description of the missing object.
        message: String,
    },

    /// A transport-level failure against a backend; always retryable.
    #[error("backend error: {message}")]
    BackendError {
        /// Description of the transport failure.
        message: String,
    },
}

impl PoolError {
    /// Construct a `NotInitialized` error.
    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::NotInitialized { message: message.into() }
    }

    /// Construct a `NoBackend` error.
    pub fn no_backend(message: impl Into<String>) -> Self {
        Self::NoBackend { message: message.into() }
    }

    /// Construct a `NotAuthorized` error.
    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::NotAuthorized { message: message.into() }
    }

    /// Construct a `NoSyncClock` error.
    pub fn no_sync_clock(message: impl Into<String>) -> Self {
        Self::NoSyncClock { message: message.into() }
    }

    /// Construct an `InvalidSignature` error.
    pub fn invalid_signature(message: impl Into<String>) -> Self {
        Self::InvalidSignature { message: message.into() }
    }

    /// Construct an `IntegrityError`.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::IntegrityError { message: message.into() }
    }

    /// Construct an `InvalidToken` error.
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken { message: message.into() }
    }

    /// Construct an `InvalidId` error.
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId { message: message.into() }
    }

    /// Construct an `InvalidVersion` error.
    pub fn invalid_version(message: impl Into<String>) -> Self {
        Self::InvalidVersion { message: message.into() }
    }

    /// Construct an `UnknownKey` error.
    pub fn unknown_key(message: impl Into<String>) -> Self {
        Self::UnknownKey { message: message.into() }
    }

    /// Construct a `NotFound` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Construct a `BackendError`.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendError { message: message.into() }
    }

    /// Whether the caller may usefully retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendError { .. } | Self::NoBackend { .. })
    }

    /// Stable machine-readable category, used by the diagnostics log.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotInitialized { .. } => "not_initialized",
            Self::NoBackend { .. } => "no_backend",
            Self::NotAuthorized { .. } => "not_authorized",
            Self::NoSyncClock { .. } => "no_sync_clock",
            Self::InvalidSignature { .. } => "invalid_signature",
            Self::IntegrityError { .. } => "integrity_error",
            Self::InvalidToken { .. } => "invalid_token",
            Self::InvalidId { .. } => "invalid_id",
            Self::InvalidVersion { .. } => "invalid_version",
            Self::UnknownKey { .. } => "unknown_key",
            Self::NotFound { .. } => "not_found",
            Self::BackendError { .. } => "backend_error",
        }
    }
}

/// Standard result type for Poolmesh operations.
pub type Result<T> = std::result::Result<T, PoolError>;

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_version(format!("malformed json: {err}"))
    }
}

impl From<rusqlite::Error> for PoolError {
    fn from(err: rusqlite::Error) -> Self {
        Self::backend(format!("local store: {err}"))
    }
}

impl From<base64::DecodeError> for PoolError {
    fn from(err: base64::DecodeError) -> Self {
        Self::invalid_token(format!("base64 decode: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_round_trip_into_display() {
        let err = PoolError::not_authorized("no wrapper for user");
        assert!(matches!(err, PoolError::NotAuthorized { .. }));
        assert_eq!(err.to_string(), "not authorized: no wrapper for user");
        assert_eq!(err.category(), "not_authorized");
    }

    #[test]
    fn backend_errors_are_retryable() {
        assert!(PoolError::backend("timeout").is_retryable());
        assert!(!PoolError::invalid_id("bad").is_retryable());
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = PoolError::from(io_err);
        assert!(matches!(err, PoolError::NotFound { .. }));
    }
}
