use thiserror::Error;

use lapse_camera::CameraError;
use lapse_motor::MotorError;
use lapse_settings::ValidationError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session config: {0}")]
    Config(String),

    #[error("insufficient resources: {0}")]
    Resource(String),

    #[error(transparent)]
    Validation(ValidationError),

    #[error("camera: {0}")]
    Camera(CameraError),

    #[error("motor: {0}")]
    Motor(#[from] MotorError),

    #[error("metadata: {0}")]
    Metadata(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("session i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Selection problems are configuration problems; bad setting values stay
/// validation errors.
impl From<CameraError> for SessionError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::Validation(v) => Self::Validation(v),
            e @ (CameraError::NoneDetected
            | CameraError::NotFound(_)
            | CameraError::Ambiguous { .. }) => Self::Config(e.to_string()),
            e => Self::Camera(e),
        }
    }
}

impl From<csv::Error> for SessionError {
    fn from(e: csv::Error) -> Self {
        Self::Metadata(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_errors_are_classified() {
        let e: SessionError = CameraError::NotFound("d750".into()).into();
        assert!(matches!(e, SessionError::Config(_)));
        let e: SessionError = CameraError::Validation(ValidationError::ReadOnly("x".into())).into();
        assert!(matches!(e, SessionError::Validation(_)));
        let e: SessionError = CameraError::Transport("usb".into()).into();
        assert!(matches!(e, SessionError::Camera(_)));
    }
}
