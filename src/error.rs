//! Error types for run-isolated
//!
//! All modules use `IsolateResult<T>` as their return type. Fetch and link
//! failures have their own enums because they travel through completion
//! channels and capability traits before they become an `IsolateError`.

use crate::digest::Digest;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for run-isolated operations
pub type IsolateResult<T> = Result<T, IsolateError>;

/// Exit code for internal, configuration and IO failures
pub const EXIT_INTERNAL: u8 = 240;
/// Exit code when the isolated manifest itself could not be fetched
pub const EXIT_MANIFEST_FETCH: u8 = 241;
/// Exit code when the sandbox could not be built
pub const EXIT_SANDBOX_BUILD: u8 = 242;
/// Exit code when the command could not be launched
pub const EXIT_LAUNCH_FAILED: u8 = 243;
/// Exit code when the run was cancelled
pub const EXIT_CANCELLED: u8 = 244;
/// Exit code when the command exceeded its timeout
pub const EXIT_TIMED_OUT: u8 = 245;

/// Failure to retrieve one digest from a storage backend
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("digest {0} is unknown to the storage backend")]
    NotFound(Digest),

    #[error("storage backend failure: {0}")]
    Transport(String),

    #[error("size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },

    #[error("content of {expected} hashes to {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("writing fetched content failed: {0}")]
    Sink(#[source] std::io::Error),
}

impl FetchError {
    /// Only transport failures are worth another attempt; everything else
    /// would produce the same answer again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Failure to create a hardlink
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link destination already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("link source does not exist: {0}")]
    NotFound(PathBuf),

    #[error("cannot hardlink {source_path} to {destination} across devices")]
    CrossDevice {
        source_path: PathBuf,
        destination: PathBuf,
    },

    #[error("hardlink {source_path} -> {destination} failed: {error}")]
    Io {
        source_path: PathBuf,
        destination: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

/// All errors that can occur in run-isolated
#[derive(Error, Debug)]
pub enum IsolateError {
    // Manifest errors
    #[error("Failed to fetch isolated manifest {digest}: {source}")]
    ManifestFetch {
        digest: Digest,
        #[source]
        source: FetchError,
    },

    #[error("Invalid isolated manifest {digest}: {reason}")]
    Manifest { digest: String, reason: String },

    #[error("Invalid digest '{0}': expected 64 lowercase hex characters")]
    InvalidDigest(String),

    // Sandbox construction errors
    #[error("Failed to fetch {digest}: {source}")]
    FetchFailed {
        digest: Digest,
        #[source]
        source: FetchError,
    },

    #[error("Failed to place {path} in sandbox: {source}")]
    Link {
        path: PathBuf,
        #[source]
        source: LinkError,
    },

    // Execution errors
    #[error("Failed to launch command: {command}")]
    LaunchFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Run cancelled")]
    Cancelled,

    // Cleanup errors
    #[error("Failed to clean up sandbox {path}: {source}")]
    CleanupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{0}")]
    User(String),
}

impl IsolateError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a manifest validation error
    pub fn manifest(digest: impl ToString, reason: impl Into<String>) -> Self {
        Self::Manifest {
            digest: digest.to_string(),
            reason: reason.into(),
        }
    }

    /// Reserved process exit code for this failure
    ///
    /// These never collide with a command's own exit code in practice: shells
    /// use 1-2 for generic failures, 126/127 for launch problems and 128+n
    /// for signals.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ManifestFetch { .. } => EXIT_MANIFEST_FETCH,
            Self::Manifest { .. }
            | Self::FetchFailed { .. }
            | Self::Link { .. } => EXIT_SANDBOX_BUILD,
            Self::LaunchFailed { .. } => EXIT_LAUNCH_FAILED,
            Self::Cancelled => EXIT_CANCELLED,
            Self::TimedOut(_) => EXIT_TIMED_OUT,
            _ => EXIT_INTERNAL,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ManifestFetch {
                source: FetchError::NotFound(_),
                ..
            } => Some("Check the --hash value and that the store was populated"),
            Self::InvalidDigest(_) => Some("Digests are lowercase hex SHA-256 strings"),
            Self::LaunchFailed { .. } => {
                Some("The first element of the manifest command must be an executable")
            }
            Self::FetchFailed {
                source: FetchError::Transport(_),
                ..
            } => Some("The storage backend may be unavailable; retry later"),
            _ => None,
        }
    }
}
