use std::path::PathBuf;
use thiserror::Error;

/// Core error types for nftsync
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Policy file could not be parsed as YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The `nft` binary is missing or does not answer `--version`
    #[error("nftables tool unavailable: {0}")]
    ToolUnavailable(String),

    /// The process may not query or modify the filter state
    #[error("permission denied for nftables: {0}")]
    PermissionDenied(String),

    /// Another live instance holds the single-instance lock
    #[error("another instance (pid {pid}) holds the lock at {}", path.display())]
    LockContention { pid: i32, path: PathBuf },

    /// A creation/add command failed for one filter object
    #[error("failed to modify {object}: {message}")]
    Mutate {
        object: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// One policy entry failed validation
    #[error("malformed policy entry #{index}: {reason}")]
    MalformedEntry { index: usize, reason: String },

    /// Directory creation, temp write or rename of the artifact failed
    #[error("cannot write artifact {}: {source}", path.display())]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Privilege escalation wrapper unavailable
    #[error("elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),
}

impl Error {
    /// Startup-class errors stop the process; everything else is reported per object.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ToolUnavailable(_) | Error::PermissionDenied(_) | Error::LockContention { .. }
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::LockContention { .. } => 3,
            Error::ToolUnavailable(_) => 4,
            Error::PermissionDenied(_) => 5,
            _ => 1,
        }
    }

    /// Builds a mutate failure from the stderr of a failed nft invocation.
    ///
    /// Privilege and missing-binary messages are promoted to their startup-class
    /// variants so a run without rights aborts instead of failing per element.
    pub fn from_nft_failure(
        object: impl Into<String>,
        stderr: &str,
        exit_code: Option<i32>,
    ) -> Self {
        let stderr = stderr.trim();
        match classify_stderr(stderr) {
            StderrClass::Permission => Error::PermissionDenied(stderr.to_string()),
            StderrClass::Missing => Error::ToolUnavailable(stderr.to_string()),
            StderrClass::Other => Error::Mutate {
                object: object.into(),
                message: first_line(stderr),
                stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
                exit_code,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StderrClass {
    Permission,
    Missing,
    Other,
}

fn classify_stderr(msg: &str) -> StderrClass {
    let lower = msg.to_lowercase();

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("cache initialization failed")
    {
        return StderrClass::Permission;
    }

    if lower.contains("command not found") || lower.contains("no such file or directory: nft") {
        return StderrClass::Missing;
    }

    StderrClass::Other
}

fn first_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(|l| l.trim().trim_start_matches("Error: "))
        .find(|l| !l.is_empty())
        .map_or_else(|| "command exited unsuccessfully".to_string(), String::from)
}

pub type Result<T> = std::result::Result<T, Error>;
