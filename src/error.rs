//! Error Module
//!
//! Error taxonomy shared by the certificate manager, the enrollment protocol
//! and the CA server.

use openssl::error::ErrorStack;
use std::io;
use thiserror::Error;

/// Result type alias for enrollment operations.
pub type EnrollResult<T> = Result<T, EnrollError>;

/// Security-relevant rejections raised while checking keys and signatures.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The signer's certificate could not be loaded or has no usable public key.
    #[error("invalid certificate {path}: {reason}")]
    InvalidCertificate { path: String, reason: String },

    /// The detached signature does not match the message.
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    /// The certificate's public key does not belong to the private key.
    #[error("certificate and private key do not match: {0}")]
    KeyMismatch(String),
}

/// Errors that can occur during provisioning and enrollment.
#[derive(Debug, Error)]
pub enum EnrollError {
    /// Missing or invalid configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The crypto toolchain rejected an operation.
    #[error("{context}: {source}")]
    Tool {
        context: String,
        #[source]
        source: ErrorStack,
    },

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("certificate chain invalid: {0}")]
    ChainInvalid(String),

    #[error("certificate revoked: {0}")]
    Revoked(String),

    #[error("OCSP query failed: {0}")]
    Ocsp(String),

    /// Unexpected frame or acknowledgement on the enrollment connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection timed out")]
    Timeout,

    /// Certificate database lookup miss or dangling index entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// The CA answered with a `failed` frame.
    #[error("certificate request rejected by the CA")]
    Rejected,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl EnrollError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Returns true for rejections that must never be downgraded to success.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::Verification(_) | Self::ChainInvalid(_) | Self::Revoked(_) | Self::Rejected
        )
    }
}

/// Wraps an OpenSSL error stack with the failed operation's context.
///
/// Used as `.map_err(tool("Failed to sign certificate"))`.
pub fn tool(context: impl Into<String>) -> impl FnOnce(ErrorStack) -> EnrollError {
    let context = context.into();
    move |source| EnrollError::Tool { context, source }
}

/// Wraps a filesystem error with context.
pub fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> EnrollError {
    let context = context.into();
    move |source| EnrollError::Io { context, source }
}

/// Maps a socket error, turning read/write timeouts into [`EnrollError::Timeout`].
pub fn socket_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> EnrollError {
    let context = context.into();
    move |source| match source.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => EnrollError::Timeout,
        _ => EnrollError::Io { context, source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_timeout_maps_to_timeout() {
        let err = socket_error("recv")(io::Error::new(io::ErrorKind::WouldBlock, "slow"));
        assert!(matches!(err, EnrollError::Timeout));

        let err = socket_error("recv")(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(err, EnrollError::Timeout));
    }

    #[test]
    fn test_socket_reset_stays_io() {
        let err = socket_error("recv")(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(err, EnrollError::Io { .. }));
        assert!(err.to_string().starts_with("recv"));
    }

    #[test]
    fn test_security_rejections() {
        assert!(EnrollError::Rejected.is_security_rejection());
        assert!(EnrollError::Revoked("x".into()).is_security_rejection());
        assert!(
            EnrollError::from(VerificationError::SignatureMismatch("x".into()))
                .is_security_rejection()
        );
        assert!(EnrollError::ChainInvalid("x".into()).is_security_rejection());
        assert!(!EnrollError::Ocsp("unreachable".into()).is_security_rejection());
        assert!(!EnrollError::Timeout.is_security_rejection());
        assert!(!EnrollError::config("x").is_security_rejection());
    }
}
