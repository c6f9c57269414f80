use std::time::{Duration, Instant};
use tokio_serial::{SerialPortInfo, SerialPortType};
use tracing::{info, warn};

use lapse_proto::AbortFlag;

use crate::error::MotorError;
use crate::link::{open_serial, MotorLink};
use crate::MotorConfig;

/// Substrings of USB descriptors that usually mean "ESP or Arduino board".
const BRIDGE_HINTS: [&str; 4] = ["cp210", "ch340", "arduino", "usb serial"];

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub dev: String,
    pub version: Option<String>,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<String>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
        "/dev/serial0".into(),
    ]
}

/// Enumerated ports, USB serial bridges first.
pub fn candidate_devs() -> Vec<String> {
    match tokio_serial::available_ports() {
        Ok(ports) if !ports.is_empty() => rank_ports(ports),
        Ok(_) => default_candidate_devs(),
        Err(e) => {
            warn!("motor autodetect: cannot enumerate ports: {}", e);
            default_candidate_devs()
        }
    }
}

fn rank_ports(ports: Vec<SerialPortInfo>) -> Vec<String> {
    rank(ports.into_iter().map(|p| (describe(&p.port_type), p.port_name)).collect())
}

fn describe(kind: &SerialPortType) -> String {
    match kind {
        SerialPortType::UsbPort(usb) => format!(
            "{} {}",
            usb.manufacturer.as_deref().unwrap_or(""),
            usb.product.as_deref().unwrap_or("")
        ),
        _ => String::new(),
    }
}

/// Stable partition of `(description, device)` pairs, bridges first.
fn rank(ports: Vec<(String, String)>) -> Vec<String> {
    let (mut bridges, others): (Vec<_>, Vec<_>) = ports.into_iter().partition(|(desc, _)| {
        let desc = desc.to_lowercase();
        BRIDGE_HINTS.iter().any(|h| desc.contains(h))
    });
    bridges.extend(others);
    bridges.into_iter().map(|(_, dev)| dev).collect()
}

/// Probes candidates with `V` and picks the first that answers `VERSION`.
pub async fn autodetect_head(cfg: &MotorConfig) -> Result<AutodetectResult, MotorError> {
    let devs = if cfg.candidate_devs.is_empty() {
        candidate_devs()
    } else {
        cfg.candidate_devs.clone()
    };
    let probe_cfg = MotorConfig {
        reply_timeout_ms: cfg.probe_timeout_ms,
        attempts: 1,
        ..cfg.clone()
    };

    let mut probes = Vec::new();
    for dev in devs {
        let start = Instant::now();
        let (version, note) = match probe(&dev, &probe_cfg).await {
            Ok(v) => (Some(v), "version reply".to_string()),
            Err(e) => {
                warn!("motor autodetect probe failed dev={} err={}", dev, e);
                (None, e.to_string())
            }
        };
        let found = version.is_some();
        probes.push(ProbeResult {
            dev: dev.clone(),
            version,
            elapsed_ms: start.elapsed().as_millis() as u64,
            note,
        });
        if found {
            info!("motor autodetect: OK {} @ {}", dev, cfg.baud);
            return Ok(AutodetectResult { chosen: Some(dev), probes });
        }
    }
    Ok(AutodetectResult { chosen: None, probes })
}

async fn probe(dev: &str, cfg: &MotorConfig) -> Result<String, MotorError> {
    let port = open_serial(dev, cfg.baud)?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut link = MotorLink::new(port, cfg.clone(), AbortFlag::new());
    let version = link.version().await;
    link.close().await;
    version
}
