//! Error types for the Harbor protocol.
//!
//! One enum covers the full protocol taxonomy. Every variant maps to a
//! wire status code and a machine-readable kind string so that errors
//! survive a round trip through an error response body.

use thiserror::Error;

/// Convenience result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure (connect, send, receive)
    #[error("connection error: {0}")]
    Connection(String),

    /// Client identity could not be established
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Certificate malformed, unknown, or fingerprint mismatch
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Certificate serial is revoked or the client record is flagged
    #[error("certificate revoked: {0}")]
    CertificateRevoked(String),

    /// Framing or body corruption
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Path escapes the library root
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    /// Path is malformed (forbidden characters, depth, length)
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// No such file or directory
    #[error("not found: {0}")]
    FileNotFound(String),

    /// Target already exists
    #[error("already exists: {0}")]
    FileExists(String),

    /// Directory removal refused without recursion
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Another session holds the file lock
    #[error("file locked: {0}")]
    Locked(String),

    /// The underlying filesystem is out of space
    #[error("disk full: {0}")]
    DiskFull(String),

    /// Digest of the received bytes does not match the advertised digest
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Digest the peer advertised
        expected: String,
        /// Digest computed over the actual bytes
        actual: String,
    },

    /// Client is not authorised for the requested library
    #[error("library access denied: {0}")]
    LibraryAccessDenied(String),

    /// Another client currently holds the library
    #[error("library in use: {0}")]
    LibraryInUse(String),

    /// Request rejected by rate limiting
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wire status code for this error (HTTP semantics)
    #[must_use]
    pub fn status(&self) -> i32 {
        match self {
            Self::Authentication(_) | Self::Certificate(_) | Self::CertificateRevoked(_) => 401,
            Self::LibraryAccessDenied(_) => 403,
            Self::InvalidMessage(_) | Self::PathTraversal(_) | Self::InvalidPath(_) => 400,
            Self::FileNotFound(_) => 404,
            Self::FileExists(_) | Self::DirectoryNotEmpty(_) => 409,
            Self::Locked(_) | Self::LibraryInUse(_) => 423,
            Self::RateLimited(_) => 429,
            Self::DiskFull(_) => 507,
            Self::Connection(_)
            | Self::ChecksumMismatch { .. }
            | Self::Timeout(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Machine-readable kind carried in error response bodies
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection",
            Self::Authentication(_) => "Authentication",
            Self::Certificate(_) => "Certificate",
            Self::CertificateRevoked(_) => "CertificateRevoked",
            Self::InvalidMessage(_) => "InvalidMessage",
            Self::PathTraversal(_) => "PathTraversal",
            Self::InvalidPath(_) => "InvalidPath",
            Self::FileNotFound(_) => "FileNotFound",
            Self::FileExists(_) => "FileExists",
            Self::DirectoryNotEmpty(_) => "DirectoryNotEmpty",
            Self::Locked(_) => "Locked",
            Self::DiskFull(_) => "DiskFull",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::LibraryAccessDenied(_) => "LibraryAccessDenied",
            Self::LibraryInUse(_) => "LibraryInUse",
            Self::RateLimited(_) => "RateLimited",
            Self::Timeout(_) => "Timeout",
            Self::Internal(_) => "Internal",
        }
    }

    /// Whether the connection must be torn down after reporting this error
    ///
    /// Per-command user errors leave the session intact; transport faults,
    /// framing corruption, and uncaught internal failures do not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Internal(_)
        )
    }

    /// Reconstruct an error from a wire error response
    #[must_use]
    pub fn from_wire(status: i32, kind: &str, message: &str) -> Self {
        let msg = message.to_string();
        match kind {
            "Connection" => Self::Connection(msg),
            "Authentication" => Self::Authentication(msg),
            "Certificate" => Self::Certificate(msg),
            "CertificateRevoked" => Self::CertificateRevoked(msg),
            "InvalidMessage" => Self::InvalidMessage(msg),
            "PathTraversal" => Self::PathTraversal(msg),
            "InvalidPath" => Self::InvalidPath(msg),
            "FileNotFound" => Self::FileNotFound(msg),
            "FileExists" => Self::FileExists(msg),
            "DirectoryNotEmpty" => Self::DirectoryNotEmpty(msg),
            "Locked" => Self::Locked(msg),
            "DiskFull" => Self::DiskFull(msg),
            "ChecksumMismatch" => Self::ChecksumMismatch {
                expected: String::new(),
                actual: msg,
            },
            "LibraryAccessDenied" => Self::LibraryAccessDenied(msg),
            "LibraryInUse" => Self::LibraryInUse(msg),
            "RateLimited" => Self::RateLimited(msg),
            "Timeout" => Self::Timeout(msg),
            _ => match status {
                401 => Self::Authentication(msg),
                403 => Self::LibraryAccessDenied(msg),
                404 => Self::FileNotFound(msg),
                409 => Self::FileExists(msg),
                423 => Self::Locked(msg),
                429 => Self::RateLimited(msg),
                507 => Self::DiskFull(msg),
                400 => Self::InvalidMessage(msg),
                _ => Self::Internal(msg),
            },
        }
    }

    /// Wrap a transport-level failure
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }
}

// ENOSPC has no ErrorKind on stable; match the raw errno.
const ENOSPC: i32 = 28;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(ENOSPC) {
            return Self::DiskFull(err.to_string());
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::FileExists(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Connection(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidMessage(err.to_string())
    }
}
