//! In-memory camera. Clones share state, so a test keeps one clone to
//! inspect what the session did with the other.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use lapse_settings::{ConfigNode, ConfigStore, SettingKind, SettingValue};

use crate::error::CameraError;
use crate::{CameraBackend, Reconnect};

/// Smallest JFIF file most readers accept: SOI, APP0, EOI.
pub const TINY_JPEG: [u8; 22] = [
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

struct State {
    tree: ConfigNode,
    open: bool,
    faults: u32,
    ops: u32,
    commits: u32,
    captures: u32,
    events: Vec<String>,
}

#[derive(Clone)]
pub struct MockCamera {
    state: Arc<Mutex<State>>,
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCamera {
    pub fn new() -> Self {
        Self::with_tree(default_tree())
    }

    pub fn with_tree(tree: ConfigNode) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                tree,
                open: true,
                faults: 0,
                ops: 0,
                commits: 0,
                captures: 0,
                events: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread is the only way to poison this lock.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next `n` operations fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.state().faults = n;
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn commits(&self) -> u32 {
        self.state().commits
    }

    pub fn captures(&self) -> u32 {
        self.state().captures
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn tree(&self) -> ConfigNode {
        self.state().tree.clone()
    }

    fn begin(&self, name: &str) -> Result<MutexGuard<'_, State>, CameraError> {
        let mut st = self.state();
        st.events.push(name.to_string());
        st.ops += 1;
        if !st.open {
            return Err(CameraError::NotOpen);
        }
        if st.faults > 0 {
            st.faults -= 1;
            return Err(CameraError::Transport(format!("injected fault on op {}", st.ops)));
        }
        Ok(st)
    }
}

impl Reconnect for MockCamera {
    fn close(&mut self) {
        let mut st = self.state();
        if st.open {
            st.open = false;
            st.events.push("close".into());
        }
    }

    fn hard_reset(&mut self) -> Result<(), CameraError> {
        self.state().events.push("reset".into());
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), CameraError> {
        let mut st = self.state();
        st.events.push("reopen".into());
        st.open = true;
        Ok(())
    }
}

impl ConfigStore for MockCamera {
    type Error = CameraError;

    fn read_config(&mut self) -> Result<ConfigNode, CameraError> {
        let st = self.begin("read_config")?;
        Ok(st.tree.clone())
    }

    fn write_config(&mut self, root: &ConfigNode) -> Result<(), CameraError> {
        let mut st = self.begin("write_config")?;
        for (path, value) in root.changed_leaves() {
            if let Some(node) = st.tree.find_mut(&path) {
                node.value = Some(value.clone());
            }
        }
        st.commits += 1;
        Ok(())
    }
}

impl CameraBackend for MockCamera {
    fn capture(&mut self, dest: &Path) -> Result<PathBuf, CameraError> {
        let mut st = self.begin("capture")?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, TINY_JPEG)?;
        st.captures += 1;
        Ok(dest.to_path_buf())
    }

    fn capture_preview(&mut self) -> Result<Vec<u8>, CameraError> {
        let _st = self.begin("preview")?;
        Ok(TINY_JPEG.to_vec())
    }
}

/// A small tree shaped like what a DSLR reports.
pub fn default_tree() -> ConfigNode {
    ConfigNode::container(
        "main",
        vec![
            ConfigNode::container(
                "actions",
                vec![
                    ConfigNode::leaf("viewfinder", SettingKind::Toggle)
                        .with_value(SettingValue::Toggle(false)),
                    ConfigNode::leaf("manualfocusdrive", SettingKind::Text)
                        .with_value(SettingValue::Text("None".into())),
                ],
            ),
            ConfigNode::container(
                "imgsettings",
                vec![ConfigNode::leaf("iso", SettingKind::Choice)
                    .with_label("ISO Speed")
                    .with_choices(["Auto", "100", "200", "400", "800", "1600"])
                    .with_value(SettingValue::Choice("Auto".into()))],
            ),
            ConfigNode::container(
                "capturesettings",
                vec![
                    ConfigNode::leaf("exposurecompensation", SettingKind::Range)
                        .with_bounds(-3.0, 3.0, 0.5)
                        .with_value(SettingValue::Number(0.0)),
                    ConfigNode::leaf("continuousaf", SettingKind::Toggle)
                        .with_value(SettingValue::Toggle(true)),
                ],
            ),
            ConfigNode::container(
                "status",
                vec![ConfigNode::leaf("batterylevel", SettingKind::Choice)
                    .with_choices(["Empty", "Low", "Half", "Full"])
                    .with_value(SettingValue::Choice("Half".into()))
                    .read_only()],
            ),
        ],
    )
}
