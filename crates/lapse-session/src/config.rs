use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use lapse_camera::CameraConfig;
use lapse_motor::MotorConfig;
use lapse_proto::Angles;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataMode {
    /// JPEG comment per frame, table row only when embedding is impossible.
    #[default]
    Embed,
    /// Always a row in `metadata.csv`.
    Table,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelapseConfig {
    pub total_frames: u32,
    pub interval_s: f64,
    pub settle_time_s: f64,
    pub start: Angles,
    pub target: Angles,
    pub output_dir: PathBuf,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_image_ext")]
    pub image_ext: String,
    #[serde(default = "default_frame_size")]
    pub frame_size_estimate_bytes: u64,
    #[serde(default)]
    pub metadata: MetadataMode,
    #[serde(default = "default_video_name")]
    pub video_name: String,
    #[serde(default)]
    pub encoder_args: Vec<String>,
}

fn default_fps() -> f64 {
    25.0
}

fn default_image_ext() -> String {
    "jpg".into()
}

fn default_frame_size() -> u64 {
    20_000_000
}

fn default_video_name() -> String {
    "timelapse.mp4".into()
}

impl TimelapseConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.total_frames < 2 {
            return Err(SessionError::config(format!(
                "total_frames must be at least 2, got {}",
                self.total_frames
            )));
        }
        let numbers = [
            ("interval_s", self.interval_s),
            ("settle_time_s", self.settle_time_s),
            ("fps", self.fps),
            ("start.pan", self.start.pan),
            ("start.tilt", self.start.tilt),
            ("target.pan", self.target.pan),
            ("target.tilt", self.target.tilt),
        ];
        if let Some((name, v)) = numbers.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SessionError::config(format!("{} must be finite, got {}", name, v)));
        }
        if self.settle_time_s < 0.0 {
            return Err(SessionError::config("settle_time_s must not be negative"));
        }
        for (name, v) in [("interval_s", self.interval_s), ("settle_time_s", self.settle_time_s)] {
            if Duration::try_from_secs_f64(v.max(0.0)).is_err() {
                return Err(SessionError::config(format!("{} is out of range, got {}", name, v)));
            }
        }
        if self.interval_s < self.settle_time_s {
            return Err(SessionError::config(format!(
                "interval_s ({}) must not be shorter than settle_time_s ({})",
                self.interval_s, self.settle_time_s
            )));
        }
        if self.fps <= 0.0 {
            return Err(SessionError::config("fps must be positive"));
        }
        if self.image_ext.is_empty() || self.image_ext.contains(['/', '.']) {
            return Err(SessionError::config(format!("bad image_ext '{}'", self.image_ext)));
        }
        if self.video_name.is_empty() || self.video_name.contains('/') {
            return Err(SessionError::config(format!("bad video_name '{}'", self.video_name)));
        }
        Ok(())
    }

    /// Per-frame pan/tilt increment.
    pub fn step(&self) -> Angles {
        let n = f64::from(self.total_frames.saturating_sub(1).max(1));
        Angles::new(
            (self.target.pan - self.start.pan) / n,
            (self.target.tilt - self.start.tilt) / n,
        )
    }

    /// Saturates at [`Duration::MAX`] for values [`validate`](Self::validate)
    /// rejects as out of range.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_s.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn settle(&self) -> Duration {
        Duration::try_from_secs_f64(self.settle_time_s.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Bytes the frames of a full run are expected to take.
    pub fn required_space(&self) -> u64 {
        u64::from(self.total_frames).saturating_mul(self.frame_size_estimate_bytes)
    }
}

/// Everything one session needs: the parsed `[camera]`, `[motor]` and
/// `[timelapse]` tables.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub motor: MotorConfig,
    pub timelapse: TimelapseConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TimelapseConfig {
        TimelapseConfig {
            total_frames: 10,
            interval_s: 5.0,
            settle_time_s: 1.0,
            start: Angles::new(0.0, 0.0),
            target: Angles::new(90.0, 0.0),
            output_dir: PathBuf::from("/tmp/lapse"),
            fps: default_fps(),
            image_ext: default_image_ext(),
            frame_size_estimate_bytes: default_frame_size(),
            metadata: MetadataMode::Embed,
            video_name: default_video_name(),
            encoder_args: Vec::new(),
        }
    }

    #[test]
    fn step_divides_span_by_gaps() {
        let step = sample().step();
        assert_eq!(step.pan, 10.0);
        assert_eq!(step.tilt, 0.0);
    }

    #[test]
    fn rejects_single_frame_and_short_interval() {
        let mut c = sample();
        c.total_frames = 1;
        assert!(matches!(c.validate(), Err(SessionError::Config(_))));

        let mut c = sample();
        c.interval_s = 0.5;
        assert!(matches!(c.validate(), Err(SessionError::Config(_))));

        let mut c = sample();
        c.settle_time_s = -1.0;
        c.interval_s = 1.0;
        assert!(c.validate().is_err());

        let mut c = sample();
        c.fps = 0.0;
        assert!(c.validate().is_err());

        let mut c = sample();
        c.target.pan = f64::NAN;
        assert!(c.validate().is_err());

        sample().validate().unwrap();
    }

    #[test]
    fn zero_settle_and_equal_interval_are_fine() {
        let mut c = sample();
        c.settle_time_s = 0.0;
        c.interval_s = 0.0;
        c.validate().unwrap();
    }

    #[test]
    fn huge_durations_are_config_errors() {
        let mut c = sample();
        c.interval_s = 1e300;
        assert!(matches!(c.validate(), Err(SessionError::Config(_))));
        assert_eq!(c.interval(), Duration::MAX);

        let mut c = sample();
        c.settle_time_s = 1e300;
        c.interval_s = 1e300;
        assert!(matches!(c.validate(), Err(SessionError::Config(_))));
        assert_eq!(c.settle(), Duration::MAX);
        assert_eq!(sample().interval(), Duration::from_secs(5));
    }

    #[test]
    fn parses_session_toml() {
        let cfg: SessionConfig = toml::from_str(
            r#"
            [camera]
            select = "nikon"

            [camera.settings]
            "main.imgsettings.iso" = 200

            [motor]
            port = "/dev/ttyUSB0"
            microstep = 16

            [timelapse]
            total_frames = 120
            interval_s = 10.0
            settle_time_s = 2.0
            start = { pan = 0.0, tilt = 10.0 }
            target = { pan = 180.0, tilt = 10.0 }
            output_dir = "/srv/lapse/sunset"
            metadata = "table"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.timelapse.total_frames, 120);
        assert_eq!(cfg.timelapse.fps, 25.0);
        assert_eq!(cfg.timelapse.metadata, MetadataMode::Table);
        assert_eq!(cfg.timelapse.required_space(), 120 * 20_000_000);
        assert_eq!(cfg.camera.settings.len(), 1);
        assert_eq!(cfg.motor.port, "/dev/ttyUSB0");
        cfg.timelapse.validate().unwrap();
    }
}
