use lapse_settings::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no camera detected")]
    NoneDetected,

    #[error("no camera matches '{0}'")]
    NotFound(String),

    #[error("several cameras match '{pattern}': {matches:?}")]
    Ambiguous { pattern: String, matches: Vec<String> },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("camera does not expose '{0}'")]
    Unsupported(String),

    #[error("failed to run {tool}: {source}")]
    Tool {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("camera transport: {0}")]
    Transport(String),

    #[error("camera is not open")]
    NotOpen,

    #[error("camera i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("camera unavailable after {attempts} attempts: {source}")]
    Device {
        attempts: u32,
        #[source]
        source: Box<CameraError>,
    },

    #[error("camera worker: {0}")]
    Worker(String),
}

impl CameraError {
    /// Transient faults are worth a reconnect. Everything else is returned
    /// to the caller as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotOpen | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_not_transient() {
        let e: CameraError = ValidationError::UnknownSetting("main.x".into()).into();
        assert!(!e.is_transient());
        assert!(CameraError::Transport("PTP I/O error".into()).is_transient());
        assert!(!CameraError::NotFound("nikon".into()).is_transient());
    }
}
