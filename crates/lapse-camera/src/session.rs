use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

use lapse_settings::{apply, query, RawValue, SettingEntry, SettingKind, SettingValue, StepPolicy};

use crate::error::CameraError;
use crate::retry::RetryingSession;
use crate::CameraBackend;

const CONTINUOUS_AF: &str = "main.capturesettings.continuousaf";
const VIEWFINDER: &str = "main.actions.viewfinder";
const FOCUS_DRIVE: &str = "main.actions.manualfocusdrive";
const BATTERY: &str = "batterylevel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusDirection {
    Near,
    Far,
}

impl FocusDirection {
    fn label(self) -> &'static str {
        match self {
            Self::Near => "Near",
            Self::Far => "Far",
        }
    }
}

impl std::str::FromStr for FocusDirection {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "near" => Ok(Self::Near),
            "far" => Ok(Self::Far),
            other => Err(CameraError::InvalidArgument(format!(
                "focus direction must be near or far, not '{}'",
                other
            ))),
        }
    }
}

/// Async handle to one camera. Every operation takes the same lock and runs
/// on the blocking pool, so camera calls never interleave.
pub struct CameraSession<B: CameraBackend> {
    inner: Arc<Mutex<RetryingSession<B>>>,
}

impl<B: CameraBackend> Clone for CameraSession<B> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<B: CameraBackend> CameraSession<B> {
    pub fn new(session: RetryingSession<B>) -> Self {
        Self { inner: Arc::new(Mutex::new(session)) }
    }

    async fn locked<T, F>(&self, f: F) -> Result<T, CameraError>
    where
        T: Send + 'static,
        F: FnOnce(&mut RetryingSession<B>) -> Result<T, CameraError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| CameraError::Worker("camera lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CameraError::Worker(e.to_string()))?
    }

    /// Fresh read of every leaf setting.
    pub async fn query(&self) -> Result<BTreeMap<String, SettingEntry>, CameraError> {
        self.locked(|s| s.execute(|b| Ok(query(&b.read_config()?)))).await
    }

    /// Path to current value for every leaf that reports one.
    pub async fn current_settings(&self) -> Result<BTreeMap<String, SettingValue>, CameraError> {
        let entries = self.query().await?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, e)| e.current.map(|v| (path, v)))
            .collect())
    }

    /// Validates the whole batch, then commits it in one write.
    pub async fn apply_settings(
        &self,
        entries: BTreeMap<String, RawValue>,
        policy: StepPolicy,
    ) -> Result<Vec<(String, SettingValue)>, CameraError> {
        self.locked(move |s| s.execute(|b| apply(b, &entries, policy))).await
    }

    pub async fn capture(&self, dest: PathBuf) -> Result<PathBuf, CameraError> {
        self.locked(move |s| s.execute(|b| b.capture(&dest))).await
    }

    pub async fn capture_preview(&self) -> Result<Vec<u8>, CameraError> {
        self.locked(|s| s.execute(|b| b.capture_preview())).await
    }

    /// Drives the lens one step. Continuous AF is switched off and live view
    /// switched on first if needed; live view is closed again unless
    /// `keep_live_view`.
    pub async fn focus_step(
        &self,
        direction: FocusDirection,
        step: u8,
        keep_live_view: bool,
    ) -> Result<(), CameraError> {
        if !(1..=3).contains(&step) {
            return Err(CameraError::InvalidArgument(format!(
                "focus step must be 1, 2 or 3, not {}",
                step
            )));
        }
        self.locked(move |s| {
            let leaves = s.execute(|b| Ok(query(&b.read_config()?)))?;
            let mut prep = BTreeMap::new();
            if leaves.get(CONTINUOUS_AF).map_or(false, |e| is_engaged(e.current.as_ref())) {
                debug!("focus: turning off continuous AF");
                prep.insert(CONTINUOUS_AF.to_string(), RawValue::Bool(false));
            }
            if !leaves.get(VIEWFINDER).map_or(false, |e| is_engaged(e.current.as_ref())) {
                debug!("focus: opening viewfinder");
                prep.insert(VIEWFINDER.to_string(), RawValue::Bool(true));
            }
            if !prep.is_empty() {
                s.execute(|b| apply(b, &prep, StepPolicy::Strict))?;
            }

            let drive = BTreeMap::from([(
                FOCUS_DRIVE.to_string(),
                RawValue::Text(format!("{} {}", direction.label(), step)),
            )]);
            s.execute(|b| apply(b, &drive, StepPolicy::Strict))?;

            if !keep_live_view {
                let off = BTreeMap::from([(VIEWFINDER.to_string(), RawValue::Bool(false))]);
                s.execute(|b| apply(b, &off, StepPolicy::Strict))?;
            }
            Ok(())
        })
        .await
    }

    /// Battery charge in percent.
    pub async fn battery_level(&self) -> Result<u8, CameraError> {
        let entries = self.query().await?;
        let entry = entries
            .iter()
            .find(|(path, _)| path.rsplit('.').next() == Some(BATTERY))
            .map(|(_, e)| e)
            .ok_or_else(|| CameraError::Unsupported(BATTERY.into()))?;
        battery_percent(entry).ok_or_else(|| CameraError::Unsupported(BATTERY.into()))
    }

    pub async fn close(&self) -> Result<(), CameraError> {
        self.locked(|s| {
            s.close();
            Ok(())
        })
        .await
    }
}

fn is_engaged(value: Option<&SettingValue>) -> bool {
    match value {
        None => false,
        Some(SettingValue::Toggle(b)) => *b,
        Some(SettingValue::Number(x)) => *x != 0.0,
        Some(SettingValue::Date(_)) => true,
        Some(SettingValue::Text(s)) | Some(SettingValue::Choice(s)) => {
            !matches!(s.trim().to_ascii_lowercase().as_str(), "" | "0" | "off" | "false")
        }
    }
}

/// Cameras report either a percentage ("75%", 75) or a level 0..=3.
fn battery_percent(entry: &SettingEntry) -> Option<u8> {
    const LEVELS: [u8; 4] = [0, 33, 66, 100];
    let current = entry.current.as_ref()?;

    if let Some(choices) = &entry.choices {
        if choices.len() == LEVELS.len() {
            if let Some(i) = current.as_str().and_then(|c| choices.iter().position(|x| x == c)) {
                return Some(LEVELS[i]);
            }
        }
    }

    let number = match current {
        SettingValue::Number(x) => *x,
        SettingValue::Text(s) | SettingValue::Choice(s) => {
            s.trim().trim_end_matches('%').trim().parse().ok()?
        }
        _ => return None,
    };
    let enumerated = match entry.kind {
        SettingKind::Range => entry.bounds.map_or(false, |b| b.max <= 3.0),
        _ => current.as_str().map_or(false, |s| !s.contains('%')) && number <= 3.0,
    };
    if enumerated && number.fract() == 0.0 && (0.0..=3.0).contains(&number) {
        return Some(LEVELS[number as usize]);
    }
    (0.0..=100.0).contains(&number).then(|| number.round() as u8)
}
