pub mod autodetect;
pub mod doctor;
pub mod error;
pub mod link;
pub mod position;
pub mod protocol;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::MotorError;
pub use link::MotorLink;
pub use position::{MotorPosition, PositionSource};
pub use protocol::{Jog, Microstep};

/// How the firmware reports move completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveMode {
    /// `M` takes absolute degrees and the reply (`DONE`) arrives once the
    /// move is finished.
    #[default]
    #[serde(alias = "sync")]
    Synchronous,
    /// `M` takes relative degrees, replies `OK` at once, and `Q` answers
    /// `BUSY` until the move is finished.
    #[serde(alias = "async")]
    Asynchronous,
    /// Ask the firmware with `Q` at init and pick one of the above.
    Probe,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Serial device, or `auto` to probe candidates.
    pub port: String,
    pub baud: u32,
    pub microstep: Microstep,
    pub move_mode: MoveMode,
    pub position_source: PositionSource,

    /// Wait for one reply line, per attempt.
    pub reply_timeout_ms: u64,
    /// Attempts per idempotent command.
    pub attempts: u32,
    /// Busy poll period for asynchronous moves.
    pub poll_interval_ms: u64,
    /// Upper bound for one asynchronous move.
    pub move_timeout_ms: u64,

    /// Autodetect candidates. Empty means "enumerate serial ports".
    pub candidate_devs: Vec<String>,
    /// Wait for a VERSION reply per probed port.
    pub probe_timeout_ms: u64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            port: "auto".into(),
            baud: 115_200,
            microstep: Microstep::default(),
            move_mode: MoveMode::default(),
            position_source: PositionSource::default(),
            reply_timeout_ms: 10_000,
            attempts: 3,
            poll_interval_ms: 100,
            move_timeout_ms: 120_000,
            candidate_devs: Vec::new(),
            probe_timeout_ms: 1_500,
        }
    }
}

impl MotorConfig {
    pub fn is_auto(&self) -> bool {
        self.port.is_empty() || self.port.eq_ignore_ascii_case("auto")
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }
}
