use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::OffsetDateTime;

/// Pan/tilt pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Angles {
    pub pan: f64,
    pub tilt: f64,
}

impl Angles {
    pub fn new(pan: f64, tilt: f64) -> Self {
        Self { pan, tilt }
    }
}

/// One captured frame of a session. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub index: u32,
    pub path: PathBuf,
    pub pan_deg: f64,
    pub tilt_deg: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

impl Frame {
    /// File name of the frame, e.g. `frame_0007.jpg`.
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Canonical on-disk name for frame `index`.
    pub fn file_name_for(index: u32, ext: &str) -> String {
        format!("frame_{:04}.{}", index, ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_names_are_zero_padded() {
        assert_eq!(Frame::file_name_for(7, "jpg"), "frame_0007.jpg");
        assert_eq!(Frame::file_name_for(12345, "cr2"), "frame_12345.cr2");
    }

    #[test]
    fn captured_at_serializes_as_rfc3339() {
        let f = Frame {
            index: 1,
            path: PathBuf::from("/tmp/out/frame_0001.jpg"),
            pan_deg: 2.5,
            tilt_deg: -1.0,
            captured_at: time::macros::datetime!(2024-03-01 12:00:00 UTC),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"2024-03-01T12:00:00Z\""), "{json}");
        assert_eq!(f.filename(), "frame_0001.jpg");
    }
}
