use anyhow::{Context, Result};
use std::path::Path;

use lapse_camera::CameraConfig;

use crate::config::TimelapseConfig;
use crate::disk::available_space;
use crate::encode::tool_on_path;

pub fn check_timelapse(cfg: &TimelapseConfig) -> Result<()> {
    cfg.validate().context("timelapse config")?;
    Ok(())
}

/// The output dir may not exist yet; then its nearest existing ancestor
/// must be a directory with room for the run.
pub fn check_output_dir(cfg: &TimelapseConfig) -> Result<()> {
    let dir = &cfg.output_dir;
    if dir.exists() {
        anyhow::ensure!(dir.is_dir(), "timelapse.output_dir is not a dir: {}", dir.display());
    }
    let existing = dir
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."));
    anyhow::ensure!(existing.is_dir(), "no directory to create {} in", dir.display());

    if let Some(free) = available_space(existing) {
        let needed = cfg.required_space();
        anyhow::ensure!(
            free >= needed,
            "{} MB free under {}, run needs about {} MB",
            free / 1_000_000,
            existing.display(),
            needed / 1_000_000
        );
    }
    Ok(())
}

pub fn check_tools(camera: &CameraConfig, ffmpeg: &str) -> Result<()> {
    anyhow::ensure!(tool_on_path(camera.gphoto2_bin()), "{} not found on PATH", camera.gphoto2_bin());
    anyhow::ensure!(tool_on_path(ffmpeg), "{} not found on PATH", ffmpeg);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetadataMode;
    use lapse_proto::Angles;

    fn cfg(dir: &Path) -> TimelapseConfig {
        TimelapseConfig {
            total_frames: 3,
            interval_s: 1.0,
            settle_time_s: 0.0,
            start: Angles::default(),
            target: Angles::new(4.0, 0.0),
            output_dir: dir.join("run"),
            fps: 25.0,
            image_ext: "jpg".into(),
            frame_size_estimate_bytes: 1,
            metadata: MetadataMode::Embed,
            video_name: "timelapse.mp4".into(),
            encoder_args: Vec::new(),
        }
    }

    #[test]
    fn missing_output_dir_is_fine_when_parent_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let c = cfg(tmp.path());
        check_timelapse(&c).unwrap();
        check_output_dir(&c).unwrap();
    }

    #[test]
    fn output_dir_must_not_be_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let c = cfg(tmp.path());
        std::fs::write(&c.output_dir, b"x").unwrap();
        assert!(check_output_dir(&c).is_err());
    }

    #[test]
    fn huge_run_does_not_fit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut c = cfg(tmp.path());
        c.frame_size_estimate_bytes = u64::MAX / 4;
        if available_space(tmp.path()).is_some() {
            assert!(check_output_dir(&c).is_err());
        }
    }

    #[test]
    fn missing_tools_are_reported() {
        let camera = CameraConfig { gphoto2: Some("/nonexistent/gphoto2".into()), ..Default::default() };
        let err = check_tools(&camera, "ffmpeg").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/gphoto2"));
    }
}
