use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Free bytes on the filesystem holding `dir`, if it can be determined.
pub fn available_space(dir: &Path) -> Option<u64> {
    let dir = dir.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().components().count())
        .map(|d| {
            debug!("disk: {} on {:?}", dir.display(), d.mount_point());
            d.available_space()
        })
}

/// Fails with a resource error when `dir` has less than `needed` bytes free.
/// An unknown free space is logged and accepted.
pub fn ensure_free_space(dir: &Path, needed: u64) -> Result<(), SessionError> {
    match available_space(dir) {
        Some(free) => check(dir.to_path_buf(), free, needed),
        None => {
            warn!("disk: free space of {} unknown, not checked", dir.display());
            Ok(())
        }
    }
}

fn check(dir: PathBuf, free: u64, needed: u64) -> Result<(), SessionError> {
    if free < needed {
        return Err(SessionError::Resource(format!(
            "{} has {} MB free, session needs about {} MB",
            dir.display(),
            free / 1_000_000,
            needed / 1_000_000
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_is_a_resource_error() {
        let err = check(PathBuf::from("/data"), 10_000_000, 20_000_000).unwrap_err();
        assert!(matches!(err, SessionError::Resource(_)));
        check(PathBuf::from("/data"), 20_000_000, 20_000_000).unwrap();
    }

    #[test]
    fn zero_need_always_fits() {
        let dir = tempfile::tempdir().unwrap();
        ensure_free_space(dir.path(), 0).unwrap();
    }
}
