//! One timelapse session: config, the scheduler that walks the head from
//! start to target while capturing, and the artifacts it leaves behind.

pub mod config;
pub mod disk;
pub mod doctor;
pub mod encode;
pub mod error;
pub mod metadata;
pub mod rig;
pub mod scheduler;

pub use config::{MetadataMode, SessionConfig, TimelapseConfig};
pub use encode::{EncodeJob, Encoder, FfmpegEncoder};
pub use error::SessionError;
pub use metadata::MetadataSink;
pub use rig::{HardwareRig, Rig};
pub use scheduler::{Outcome, PreparedRig, RunReport, SessionState, TimelapseScheduler};
