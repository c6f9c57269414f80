use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use crate::error::SessionError;

/// What the encoder needs to turn a frame directory into a video.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub dir: PathBuf,
    pub fps: f64,
    pub image_ext: String,
    pub video_name: String,
    pub extra_args: Vec<String>,
}

impl EncodeJob {
    pub fn video_path(&self) -> PathBuf {
        self.dir.join(&self.video_name)
    }

    /// Input pattern relative to `dir`.
    pub fn input_pattern(&self) -> String {
        format!("frame_%04d.{}", self.image_ext)
    }
}

#[allow(async_fn_in_trait)]
pub trait Encoder {
    /// Encodes the job and returns the written video path.
    async fn encode(&self, job: &EncodeJob) -> Result<PathBuf, SessionError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    bin: String,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegEncoder {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Arguments passed to ffmpeg, run with `dir` as working directory.
    pub fn args(job: &EncodeJob) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-framerate".to_string(),
            job.fps.to_string(),
            "-i".to_string(),
            job.input_pattern(),
        ];
        args.extend(job.extra_args.iter().cloned());
        args.push(job.video_name.clone());
        args
    }
}

impl Encoder for FfmpegEncoder {
    async fn encode(&self, job: &EncodeJob) -> Result<PathBuf, SessionError> {
        let args = Self::args(job);
        info!("encode: {} {}", self.bin, args.join(" "));
        let out = Command::new(&self.bin)
            .args(&args)
            .current_dir(&job.dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SessionError::Encoding(format!("cannot run {}: {}", self.bin, e)))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail = last_lines(&stderr, 8);
            return Err(SessionError::Encoding(format!("{} exited with {}: {}", self.bin, out.status, tail)));
        }
        let video = job.video_path();
        info!("encode: wrote {}", video.display());
        Ok(video)
    }
}

/// ffmpeg prints its banner first, the cause comes last.
fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// True when `bin` resolves to a file, either directly or on PATH.
pub fn tool_on_path(bin: &str) -> bool {
    let direct = Path::new(bin);
    if bin.contains('/') {
        return direct.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|p| p.join(bin).is_file()))
        .unwrap_or(false)
}
