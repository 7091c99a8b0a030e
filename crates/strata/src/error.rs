/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("transport face of downloader {face} closed")]
    FaceClosed { face: usize },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("playback cancelled")]
    Cancelled,
}

impl StrataError {
    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether the caller may simply start a new playback after this error.
    ///
    /// Manifest and configuration problems will fail again with the same input,
    /// and a closed face means the network side is gone.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Manifest { .. }
            | Self::Configuration { .. }
            | Self::FaceClosed { .. }
            | Self::Json { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StrataError::manifest("no periods");
        assert_eq!(err.to_string(), "manifest error: no periods");

        let err = StrataError::FaceClosed { face: 2 };
        assert_eq!(err.to_string(), "transport face of downloader 2 closed");
    }

    #[test]
    fn only_cancellation_is_recoverable() {
        assert!(StrataError::Cancelled.is_recoverable());
        assert!(!StrataError::configuration("pool_size is 0").is_recoverable());
        assert!(!StrataError::FaceClosed { face: 0 }.is_recoverable());
    }
}
