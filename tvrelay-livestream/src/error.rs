use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    /// Initial spawn or connect failure.
    #[error("Source unreachable: {0}")]
    SourceUnreachable(String),

    /// Data was flowing, then nothing arrived within the configured window.
    #[error("Stream stalled: {0}")]
    StreamStalled(String),

    #[error("Process crashed: {0}")]
    ProcessCrashed(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Manifest not ready after {attempts} attempts")]
    ManifestNotReady { attempts: u32 },

    #[error("All sources failed: {0}")]
    FailoverExhausted(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

impl StreamError {
    /// Short machine-readable code, used in logs and stored error causes.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SourceUnreachable(_) => "source_unreachable",
            Self::StreamStalled(_) => "stream_stalled",
            Self::ProcessCrashed(_) => "process_crashed",
            Self::ClientDisconnected => "client_disconnected",
            Self::ManifestNotReady { .. } => "manifest_not_ready",
            Self::FailoverExhausted(_) => "failover_exhausted",
            Self::StreamNotFound(_) => "stream_not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    /// Failures of the upstream source, as opposed to engine or client
    /// problems. These are what the failover resolver reacts to.
    #[must_use]
    pub const fn is_source_failure(&self) -> bool {
        matches!(
            self,
            Self::SourceUnreachable(_) | Self::StreamStalled(_) | Self::ProcessCrashed(_)
        )
    }
}

impl From<tvrelay_core::Error> for StreamError {
    fn from(err: tvrelay_core::Error) -> Self {
        match err {
            tvrelay_core::Error::NotFound(msg) => Self::StreamNotFound(msg),
            tvrelay_core::Error::InvalidInput(msg) => Self::InvalidState(msg),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Serialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_failure_classification() {
        assert!(StreamError::StreamStalled("a".into()).is_source_failure());
        assert!(StreamError::ProcessCrashed("a".into()).is_source_failure());
        assert!(!StreamError::ClientDisconnected.is_source_failure());
        assert!(!StreamError::FailoverExhausted("a".into()).is_source_failure());
    }

    #[test]
    fn test_core_not_found_maps_to_stream_not_found() {
        let err: StreamError = tvrelay_core::Error::NotFound("live news".into()).into();
        assert!(matches!(err, StreamError::StreamNotFound(_)));
        assert_eq!(err.code(), "stream_not_found");
    }
}
