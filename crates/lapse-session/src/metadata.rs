use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use lapse_proto::Frame;

use crate::config::MetadataMode;
use crate::error::SessionError;

pub const TABLE_NAME: &str = "metadata.csv";
const TABLE_HEADER: [&str; 4] = ["frame", "filename", "pan_deg", "tilt_deg"];

/// Persists the pose of every captured frame, either inside the JPEG or in
/// a side table next to the frames.
pub struct MetadataSink {
    mode: MetadataMode,
    table_path: PathBuf,
    table: Option<csv::Writer<File>>,
}

impl MetadataSink {
    pub fn open(dir: &Path, mode: MetadataMode) -> Result<Self, SessionError> {
        let mut sink = Self { mode, table_path: dir.join(TABLE_NAME), table: None };
        if mode == MetadataMode::Table {
            sink.open_table()?;
        }
        Ok(sink)
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn record(&mut self, frame: &Frame) -> Result<(), SessionError> {
        if self.mode == MetadataMode::Embed {
            match embed_pose(frame) {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("metadata: {} is not a JPEG, using table", frame.filename()),
                Err(e) => warn!("metadata: embedding into {} failed: {}", frame.filename(), e),
            }
        }
        self.append_row(frame)
    }

    pub fn close(&mut self) -> Result<(), SessionError> {
        if let Some(mut w) = self.table.take() {
            w.flush()?;
        }
        Ok(())
    }

    fn open_table(&mut self) -> Result<(), SessionError> {
        if self.table.is_some() {
            return Ok(());
        }
        let is_new = std::fs::metadata(&self.table_path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new().create(true).append(true).open(&self.table_path)?;
        let mut w = csv::Writer::from_writer(file);
        if is_new {
            w.write_record(TABLE_HEADER)?;
        }
        self.table = Some(w);
        Ok(())
    }

    fn append_row(&mut self, frame: &Frame) -> Result<(), SessionError> {
        self.open_table()?;
        let w = self
            .table
            .as_mut()
            .ok_or_else(|| SessionError::Metadata("table not open".into()))?;
        w.write_record([
            frame.index.to_string(),
            frame.filename(),
            format!("{:.6}", frame.pan_deg),
            format!("{:.6}", frame.tilt_deg),
        ])?;
        w.flush()?;
        Ok(())
    }
}

impl Drop for MetadataSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("metadata: close failed: {}", e);
        }
    }
}

/// Writes the pose as a JSON comment segment into the frame. Returns
/// `Ok(false)` when the file is not a JPEG.
pub fn embed_pose(frame: &Frame) -> std::io::Result<bool> {
    let comment = serde_json::json!({
        "frame": frame.index,
        "pan_deg": frame.pan_deg,
        "tilt_deg": frame.tilt_deg,
    })
    .to_string();

    let data = std::fs::read(&frame.path)?;
    let Some(out) = insert_jpeg_comment(&data, comment.as_bytes()) else {
        return Ok(false);
    };
    let tmp = frame.path.with_extension("part");
    std::fs::write(&tmp, out)?;
    std::fs::rename(&tmp, &frame.path)?;
    Ok(true)
}

/// Inserts a COM segment after SOI and any leading APPn segments.
/// Returns `None` for data that is not a well formed JPEG header.
pub fn insert_jpeg_comment(jpeg: &[u8], comment: &[u8]) -> Option<Vec<u8>> {
    if !jpeg.starts_with(&[0xFF, 0xD8]) || comment.len() + 2 > usize::from(u16::MAX) {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= jpeg.len() && jpeg[pos] == 0xFF && (0xE0..=0xEF).contains(&jpeg[pos + 1]) {
        let len = usize::from(u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]));
        if len < 2 || pos + 2 + len > jpeg.len() {
            return None;
        }
        pos += 2 + len;
    }

    let seg_len = (comment.len() + 2) as u16;
    let mut out = Vec::with_capacity(jpeg.len() + comment.len() + 4);
    out.extend_from_slice(&jpeg[..pos]);
    out.extend_from_slice(&[0xFF, 0xFE]);
    out.extend_from_slice(&seg_len.to_be_bytes());
    out.extend_from_slice(comment);
    out.extend_from_slice(&jpeg[pos..]);
    Some(out)
}
