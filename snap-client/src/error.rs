//! Error types for the SNAP client

use std::sync::Arc;
use thiserror::Error;

/// Result type for SNAP client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing/invalid key paths or credentials. Fatal, not retried.
    Configuration,
    /// Signing or verification could not be carried out
    Cryptographic,
    /// Bank answered with a non-200 status and an error envelope
    ProtocolRejection,
    /// Network-level failure or an unreadable response
    Transport,
    /// Store unavailable while committing state
    PersistenceTransient,
}

/// SNAP client errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key file missing, unreadable or of the wrong PEM type
    #[error("Failed to load key from {path}: {reason}")]
    KeyLoad {
        /// Path of the key file
        path: String,
        /// Reason
        reason: String,
    },

    /// RSA signing failed
    #[error("Signing error: {0}")]
    Signing(#[from] rsa::signature::Error),

    /// Signature is not valid base64
    #[error("Malformed signature encoding: {0}")]
    SignatureEncoding(#[from] base64::DecodeError),

    /// Request body could not be canonicalized
    #[error("Canonicalization error: {0}")]
    Canonicalization(#[from] serde_json::Error),

    /// Amount string is not a decimal
    #[error("Invalid amount '{value}': {source}")]
    InvalidAmount {
        /// Amount as received
        value: String,
        /// Parse failure
        #[source]
        source: rust_decimal::Error,
    },

    /// Bank rejected the request
    #[error("Bank API error {status_code}: {response_code} {response_message}")]
    BankRejection {
        /// HTTP status code
        status_code: u16,
        /// 7-character SNAP response code, verbatim (may be empty)
        response_code: String,
        /// Bank message, verbatim
        response_message: String,
    },

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Bank answered 200 but the body did not match the expected schema
    #[error("Malformed response (HTTP {status_code}): {reason}")]
    MalformedResponse {
        /// HTTP status code
        status_code: u16,
        /// Reason
        reason: String,
    },

    /// Access token renewal failed; shared by every caller that waited on it
    #[error("Access token renewal failed: {0}")]
    TokenRenewal(#[source] Arc<Error>),

    /// Relational store error
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Store refused a reservation write or returned an unreadable row
    #[error("Reservation store error: {0}")]
    Reservation(String),

    /// Cache store error
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),
}

impl Error {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::KeyLoad { .. } => ErrorKind::Configuration,
            Error::Signing(_)
            | Error::SignatureEncoding(_)
            | Error::Canonicalization(_)
            | Error::InvalidAmount { .. } => ErrorKind::Cryptographic,
            Error::BankRejection { .. } => ErrorKind::ProtocolRejection,
            Error::Http(_) | Error::MalformedResponse { .. } => ErrorKind::Transport,
            Error::TokenRenewal(cause) => cause.kind(),
            Error::Persistence(_)
            | Error::Migration(_)
            | Error::Reservation(_)
            | Error::Cache(_) => ErrorKind::PersistenceTransient,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Reservation(_) | Error::Migration(_) => false,
            Error::TokenRenewal(cause) => cause.is_retryable(),
            _ => matches!(
                self.kind(),
                ErrorKind::Transport | ErrorKind::PersistenceTransient
            ),
        }
    }

    /// Human-readable message for a bank rejection, from the static code table
    pub fn bank_message(&self) -> Option<&'static str> {
        match self {
            Error::BankRejection { response_code, .. } => {
                crate::response_codes::message_for(response_code)
            }
            Error::TokenRenewal(cause) => cause.bank_message(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_explicit() {
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::KeyLoad {
                path: "k.pem".into(),
                reason: "missing".into()
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::Reservation("duplicate".into()).kind(),
            ErrorKind::PersistenceTransient
        );
        assert_eq!(
            Error::Persistence(sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::PersistenceTransient
        );
        assert_eq!(
            Error::MalformedResponse {
                status_code: 200,
                reason: "eof".into()
            }
            .kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn bank_rejection_keeps_envelope_and_resolves_message() {
        let err = Error::BankRejection {
            status_code: 401,
            response_code: "4012401".into(),
            response_message: "Invalid Token (B2B)".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ProtocolRejection);
        assert!(!err.is_retryable());
        assert_eq!(err.bank_message(), Some("Invalid Token (B2B)"));
        assert!(err.to_string().contains("4012401"));
    }

    #[test]
    fn persistence_errors_are_retryable() {
        assert!(Error::Persistence(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!Error::Reservation("duplicate transaction id".into()).is_retryable());
        assert!(!Error::Config("missing key".into()).is_retryable());
    }

    #[test]
    fn causes_stay_reachable_through_source() {
        use std::error::Error as _;

        let err: Error = serde_json::from_slice::<serde_json::Value>(b"{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Cryptographic);
        assert!(err.source().unwrap().is::<serde_json::Error>());

        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert!(err.source().unwrap().is::<sqlx::Error>());
    }

    #[test]
    fn shared_renewal_failure_keeps_cause_classification() {
        use std::error::Error as _;

        let cause = Arc::new(Error::BankRejection {
            status_code: 401,
            response_code: "4017300".into(),
            response_message: "Unauthorized. Signature".into(),
        });
        let err = Error::TokenRenewal(cause);
        assert_eq!(err.kind(), ErrorKind::ProtocolRejection);
        assert!(!err.is_retryable());
        assert_eq!(err.bank_message(), Some("Unauthorized"));
        assert!(err.source().unwrap().to_string().contains("4017300"));
    }
}
