use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MotorError {
    #[error("no valid reply to '{command}' after {attempts} attempts")]
    Timeout { command: String, attempts: u32 },

    #[error("move did not finish within {0:?}")]
    MoveTimeout(Duration),

    #[error("unexpected reply to '{command}': {reply}")]
    Protocol { command: String, reply: String },

    #[error("firmware rejected '{command}': {reply}")]
    Firmware { command: String, reply: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("move cancelled")]
    Cancelled,

    #[error("serial link is closed")]
    Closed,

    #[error("no pan/tilt head found")]
    NotDetected,

    #[error("serial: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("serial i/o: {0}")]
    Io(#[from] std::io::Error),
}
