//! Camera access for the rig.
//!
//! A [`CameraBackend`] is a blocking handle to one physical camera. It is
//! wrapped in a [`RetryingSession`] that reconnects on transient faults and,
//! for async callers, in a [`CameraSession`] that serializes every operation
//! behind one lock.

pub mod error;
pub mod gphoto;
pub mod retry;
pub mod session;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use lapse_settings::{ConfigStore, RawValue, StepPolicy};

pub use error::CameraError;
pub use gphoto::GphotoCli;
pub use retry::{RetryPolicy, RetryingSession};
pub use session::{CameraSession, FocusDirection};

/// Recovery hooks used by the retry ladder.
pub trait Reconnect {
    /// Releases the handle. Calling it on a closed handle is a no-op.
    fn close(&mut self);
    /// Resets the underlying transport (USB port reset).
    fn hard_reset(&mut self) -> Result<(), CameraError>;
    fn reopen(&mut self) -> Result<(), CameraError>;
}

pub trait CameraBackend: Reconnect + ConfigStore<Error = CameraError> + Send + 'static {
    /// Takes a picture and stores it at `dest`. Returns the written path.
    fn capture(&mut self, dest: &Path) -> Result<PathBuf, CameraError>;

    /// One live-view frame, JPEG encoded.
    fn capture_preview(&mut self) -> Result<Vec<u8>, CameraError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedCamera {
    pub model: String,
    /// Transport address, e.g. `usb:001,004`.
    pub port: String,
}

impl std::fmt::Display for DetectedCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.model, self.port)
    }
}

/// Picks one camera. With a pattern, exactly one model must contain it
/// (case-insensitive). Without one, the first detected camera wins.
pub fn select(
    detected: Vec<DetectedCamera>,
    pattern: Option<&str>,
) -> Result<DetectedCamera, CameraError> {
    let Some(pattern) = pattern.filter(|p| !p.trim().is_empty()) else {
        if detected.len() > 1 {
            warn!("{} cameras detected, using the first: {}", detected.len(), detected[0]);
        }
        return detected.into_iter().next().ok_or(CameraError::NoneDetected);
    };

    let needle = pattern.to_lowercase();
    let mut matches: Vec<DetectedCamera> = detected
        .into_iter()
        .filter(|c| c.model.to_lowercase().contains(&needle))
        .collect();
    match matches.len() {
        0 => Err(CameraError::NotFound(pattern.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(CameraError::Ambiguous {
            pattern: pattern.to_string(),
            matches: matches.iter().map(ToString::to_string).collect(),
        }),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Case-insensitive model substring. Empty picks the first camera.
    pub select: Option<String>,
    pub step_policy: StepPolicy,
    /// Path to the gphoto2 executable. Defaults to `gphoto2` on PATH.
    pub gphoto2: Option<String>,
    pub retry_backoff_ms: Option<u64>,
    /// Dotted setting path to value, applied once the camera is open.
    pub settings: BTreeMap<String, RawValue>,
}

impl CameraConfig {
    pub fn gphoto2_bin(&self) -> &str {
        self.gphoto2.as_deref().unwrap_or("gphoto2")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(ms) = self.retry_backoff_ms {
            policy.backoff = Duration::from_millis(ms);
        }
        policy
    }
}
