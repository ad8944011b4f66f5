use std::{io, path::PathBuf, time::Duration};

/// Fatal bootstrap failures. Permission and probe problems are not errors;
/// they are reported as warnings in [`super::PermissionReport`].
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Bundled asset '{name}' is missing or unreadable: {source}")]
    AssetMissing {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Rootfs archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("Environment setup did not finish within {}s", .0.as_secs())]
    SetupTimeout(Duration),

    #[error("Failed to write '{path:?}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Rootfs extraction was cancelled")]
    Cancelled,

    #[error("Extraction worker failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl BootstrapError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BootstrapError::Io {
            path: path.into(),
            source,
        }
    }

    /// A retry can help after a timeout or a local write failure. A missing
    /// asset or a bad archive needs a different build, and a reset first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BootstrapError::SetupTimeout(_)
                | BootstrapError::Cancelled
                | BootstrapError::Io { .. }
        )
    }

    /// Get error category for programmatic handling
    pub fn error_category(&self) -> &'static str {
        match self {
            BootstrapError::AssetMissing { .. } => "ASSET",
            BootstrapError::ArchiveCorrupt(_) => "ARCHIVE",
            BootstrapError::SetupTimeout(_) | BootstrapError::Cancelled => "TIMEOUT",
            BootstrapError::Io { .. } => "IO",
            BootstrapError::TaskJoin(_) => "TASK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_and_retryability() {
        let timeout = BootstrapError::SetupTimeout(Duration::from_secs(300));
        assert!(timeout.is_retryable());
        assert_eq!(timeout.error_category(), "TIMEOUT");
        assert_eq!(
            timeout.to_string(),
            "Environment setup did not finish within 300s"
        );

        let missing = BootstrapError::AssetMissing {
            name: "proot".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        };
        assert!(!missing.is_retryable());
        assert!(missing.to_string().contains("'proot'"));

        assert!(!BootstrapError::ArchiveCorrupt("bad gzip".into()).is_retryable());
    }
}
