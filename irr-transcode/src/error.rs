use thiserror::Error;

/// Failures surfaced by the transcoding core.
///
/// Invalid arguments and transient stream errors are recovered inside the
/// orchestrator. Hardware errors are recovered until the burst policy gives up.
/// End-of-stream and resource exhaustion are reported to the caller.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stream {0} not found")]
    StreamNotFound(usize),

    #[error("transient stream error: {0}")]
    Transient(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("end of stream")]
    EndOfStream,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("frame pool exhausted: {count} buffers outstanding")]
    PoolExhausted { count: usize },

    #[error("transcoder already running")]
    AlreadyRunning,

    #[error("transcoder not running")]
    NotRunning,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl TranscodeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        TranscodeError::InvalidArgument(msg.into())
    }

    /// True for device-level failures that feed the hardware backoff policy.
    pub fn is_hardware(&self) -> bool {
        matches!(self, TranscodeError::Hardware(_))
    }
}

pub type Result<T> = std::result::Result<T, TranscodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = TranscodeError::PoolExhausted { count: 5 };
        assert!(err.to_string().contains("5 buffers"));

        let err = TranscodeError::invalid("qp 0 outside [1, 51]");
        assert!(err.to_string().contains("qp 0"));
        assert!(!err.is_hardware());
    }

    #[test]
    fn backend_errors_convert_from_anyhow() {
        let err: TranscodeError = anyhow::anyhow!("codec not found: h264").into();
        assert!(matches!(err, TranscodeError::Backend(_)));
        assert_eq!(err.to_string(), "codec not found: h264");
    }

    #[test]
    fn hardware_classification() {
        assert!(TranscodeError::Hardware("EIO".into()).is_hardware());
        assert!(!TranscodeError::EndOfStream.is_hardware());
    }
}
