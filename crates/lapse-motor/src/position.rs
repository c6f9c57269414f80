use serde::{Deserialize, Serialize};

use crate::protocol::Microstep;

/// Where the link takes the head pose from after a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSource {
    /// Sum of confirmed moves since drivers were last toggled.
    #[default]
    Tracked,
    /// Re-read with `S` after every completed move.
    Firmware,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorPosition {
    pub pan_deg: f64,
    pub tilt_deg: f64,
    pub drivers_enabled: bool,
    pub microstep: Microstep,
}

impl MotorPosition {
    pub fn new(microstep: Microstep) -> Self {
        Self { pan_deg: 0.0, tilt_deg: 0.0, drivers_enabled: false, microstep }
    }

    /// Toggling drivers loses holding torque, so the pose restarts at zero.
    pub fn reset(&mut self, drivers_enabled: bool) {
        self.pan_deg = 0.0;
        self.tilt_deg = 0.0;
        self.drivers_enabled = drivers_enabled;
    }
}
