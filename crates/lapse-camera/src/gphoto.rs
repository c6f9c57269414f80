use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, info};

use lapse_settings::{ConfigNode, ConfigStore, SettingKind, SettingValue};

use crate::error::CameraError;
use crate::retry::RetryingSession;
use crate::session::CameraSession;
use crate::{select, CameraBackend, CameraConfig, DetectedCamera, Reconnect};

/// Camera driven through the `gphoto2` command line tool.
///
/// The tool opens and releases the device on every invocation, so "open"
/// here means the model was found on a known port.
pub struct GphotoCli {
    bin: String,
    model: String,
    port: String,
    open: bool,
}

impl GphotoCli {
    pub fn open(bin: impl Into<String>, camera: DetectedCamera) -> Self {
        info!("camera: {} on {}", camera.model, camera.port);
        Self { bin: bin.into(), model: camera.model, port: camera.port, open: true }
    }

    /// Detects, selects and opens the configured camera.
    pub fn connect(cfg: &CameraConfig) -> Result<CameraSession<GphotoCli>, CameraError> {
        let detected = detect(cfg.gphoto2_bin())?;
        let camera = select(detected, cfg.select.as_deref())?;
        let backend = Self::open(cfg.gphoto2_bin(), camera);
        Ok(CameraSession::new(RetryingSession::new(backend, cfg.retry_policy())))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    fn run(&self, args: &[&str]) -> Result<Output, CameraError> {
        if !self.open {
            return Err(CameraError::NotOpen);
        }
        let mut full = vec!["--port", self.port.as_str()];
        full.extend_from_slice(args);
        run_tool(&self.bin, &full)
    }
}

impl Reconnect for GphotoCli {
    fn close(&mut self) {
        if self.open {
            debug!("camera: closing {}", self.model);
            self.open = false;
        }
    }

    fn hard_reset(&mut self) -> Result<(), CameraError> {
        let (bus, dev) = usb_address(&self.port)
            .ok_or_else(|| CameraError::Transport(format!("no usb address in '{}'", self.port)))?;
        let target = format!("{}/{}", bus, dev);
        info!("camera: usbreset {}", target);
        run_tool("usbreset", &[target.as_str()]).map(|_| ())
    }

    /// The port may change after a reset, so the model is looked up again.
    fn reopen(&mut self) -> Result<(), CameraError> {
        let found = detect(&self.bin)?
            .into_iter()
            .find(|c| c.model == self.model)
            .ok_or_else(|| CameraError::Transport(format!("{} not detected", self.model)))?;
        if found.port != self.port {
            info!("camera: {} moved {} -> {}", self.model, self.port, found.port);
            self.port = found.port;
        }
        self.open = true;
        Ok(())
    }
}

impl ConfigStore for GphotoCli {
    type Error = CameraError;

    fn read_config(&mut self) -> Result<ConfigNode, CameraError> {
        let out = self.run(&["--list-all-config"])?;
        parse_config_listing(&String::from_utf8_lossy(&out.stdout))
    }

    fn write_config(&mut self, root: &ConfigNode) -> Result<(), CameraError> {
        let assignments: Vec<String> = root
            .changed_leaves()
            .into_iter()
            .map(|(path, value)| format!("/{}={}", path.replace('.', "/"), value))
            .collect();
        if assignments.is_empty() {
            return Ok(());
        }
        let mut args = Vec::with_capacity(assignments.len() * 2);
        for a in &assignments {
            args.push("--set-config-value");
            args.push(a.as_str());
        }
        debug!("camera: commit {:?}", assignments);
        self.run(&args).map(|_| ())
    }
}

impl CameraBackend for GphotoCli {
    fn capture(&mut self, dest: &Path) -> Result<PathBuf, CameraError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let filename = dest.to_string_lossy();
        self.run(&[
            "--capture-image-and-download",
            "--filename",
            filename.as_ref(),
            "--force-overwrite",
        ])?;
        if !dest.exists() {
            return Err(CameraError::Transport(format!(
                "capture reported success but {} is missing",
                dest.display()
            )));
        }
        Ok(dest.to_path_buf())
    }

    fn capture_preview(&mut self) -> Result<Vec<u8>, CameraError> {
        let out = self.run(&["--capture-preview", "--stdout"])?;
        if out.stdout.is_empty() {
            return Err(CameraError::Transport("empty preview frame".into()));
        }
        Ok(out.stdout)
    }
}

/// Cameras reported by `gphoto2 --auto-detect`.
pub fn detect(bin: &str) -> Result<Vec<DetectedCamera>, CameraError> {
    let out = run_tool(bin, &["--auto-detect"])?;
    Ok(parse_auto_detect(&String::from_utf8_lossy(&out.stdout)))
}

fn run_tool(bin: &str, args: &[&str]) -> Result<Output, CameraError> {
    let out = Command::new(bin)
        .args(args)
        .output()
        .map_err(|source| CameraError::Tool { tool: bin.to_string(), source })?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let msg = stderr.trim();
        return Err(CameraError::Transport(if msg.is_empty() {
            format!("{} exited with {}", bin, out.status)
        } else {
            msg.to_string()
        }));
    }
    Ok(out)
}

pub(crate) fn parse_auto_detect(text: &str) -> Vec<DetectedCamera> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty() && !l.starts_with("Model") && !l.starts_with("---"))
        .filter_map(|l| {
            let (model, port) = l.rsplit_once(char::is_whitespace)?;
            let model = model.trim();
            (!model.is_empty() && port.contains(':')).then(|| DetectedCamera {
                model: model.to_string(),
                port: port.to_string(),
            })
        })
        .collect()
}

/// `usb:001,004` -> `("001", "004")`.
pub(crate) fn usb_address(port: &str) -> Option<(&str, &str)> {
    let rest = port.strip_prefix("usb:")?;
    let (bus, dev) = rest.split_once(',')?;
    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    (digits(bus) && digits(dev)).then_some((bus, dev))
}

#[derive(Default)]
struct Block {
    path: String,
    label: Option<String>,
    readonly: bool,
    kind: Option<String>,
    current: Option<String>,
    choices: Vec<String>,
    bottom: Option<f64>,
    top: Option<f64>,
    step: Option<f64>,
}

/// Builds the config tree from `--list-all-config` output.
pub(crate) fn parse_config_listing(text: &str) -> Result<ConfigNode, CameraError> {
    let mut root: Option<ConfigNode> = None;
    let mut block: Option<Block> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if line.starts_with('/') {
            block = Some(Block { path: line.to_string(), ..Default::default() });
            continue;
        }
        let Some(b) = block.as_mut() else { continue };
        if line == "END" {
            if let Some(b) = block.take() {
                insert_leaf(&mut root, b)?;
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim_start();
        match key {
            "Label" => b.label = Some(value.to_string()),
            "Readonly" => b.readonly = value.trim() == "1",
            "Type" => b.kind = Some(value.trim().to_string()),
            "Current" => b.current = Some(value.to_string()),
            "Choice" => {
                let choice = value.split_once(' ').map(|(_, c)| c).unwrap_or("");
                b.choices.push(choice.to_string());
            }
            "Bottom" => b.bottom = value.trim().parse().ok(),
            "Top" => b.top = value.trim().parse().ok(),
            "Step" => b.step = value.trim().parse().ok(),
            _ => {}
        }
    }

    root.ok_or_else(|| CameraError::Transport("empty configuration listing".into()))
}

fn insert_leaf(root: &mut Option<ConfigNode>, b: Block) -> Result<(), CameraError> {
    let segments: Vec<&str> = b.path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((leaf_name, parents)) = segments.split_last() else {
        return Ok(());
    };
    let Some((root_name, sections)) = parents.split_first() else {
        return Ok(());
    };

    let node = root.get_or_insert_with(|| ConfigNode::container(*root_name, Vec::new()));
    if node.name != *root_name {
        return Err(CameraError::Transport(format!("mixed roots in listing: {}", b.path)));
    }
    let mut parent = node;
    for section in sections {
        let idx = match parent.children.iter().position(|c| c.name == *section) {
            Some(i) => i,
            None => {
                parent.children.push(ConfigNode::container(*section, Vec::new()));
                parent.children.len() - 1
            }
        };
        parent = &mut parent.children[idx];
    }
    let leaf_name = leaf_name.to_string();
    parent.children.push(leaf_from_block(&leaf_name, b));
    Ok(())
}

fn leaf_from_block(name: &str, b: Block) -> ConfigNode {
    let kind = match b.kind.as_deref() {
        Some("RANGE") => SettingKind::Range,
        Some("TOGGLE") => SettingKind::Toggle,
        Some("RADIO") | Some("MENU") => SettingKind::Choice,
        Some("DATE") => SettingKind::Date,
        Some("BUTTON") => SettingKind::Action,
        _ => SettingKind::Text,
    };
    let current = b.current.as_deref();
    let value = match kind {
        SettingKind::Range => current.and_then(|c| c.trim().parse().ok()).map(SettingValue::Number),
        // 2 means "unknown" for toggles.
        SettingKind::Toggle => match current.map(str::trim) {
            Some("1") => Some(SettingValue::Toggle(true)),
            Some("0") => Some(SettingValue::Toggle(false)),
            _ => None,
        },
        SettingKind::Choice => current.map(|c| SettingValue::Choice(c.to_string())),
        SettingKind::Date => current.and_then(|c| c.trim().parse().ok()).map(SettingValue::Date),
        SettingKind::Text => current.map(|c| SettingValue::Text(c.to_string())),
        SettingKind::Action => None,
    };

    let mut node = ConfigNode::leaf(name, kind);
    if let Some(label) = b.label {
        node = node.with_label(label);
    }
    if let Some(v) = value {
        node = node.with_value(v);
    }
    if kind == SettingKind::Choice {
        node = node.with_choices(b.choices);
    }
    if let (Some(min), Some(max)) = (b.bottom, b.top) {
        node = node.with_bounds(min, max, b.step.unwrap_or(0.0));
    }
    if b.readonly {
        node = node.read_only();
    }
    node
}
