use thiserror::Error;

/// A caller supplied value could not be accepted. Never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("setting '{0}' is read-only")]
    ReadOnly(String),

    #[error("invalid value for '{path}': {reason}")]
    Invalid { path: String, reason: String },
}

impl ValidationError {
    pub(crate) fn invalid(path: &str, reason: impl Into<String>) -> Self {
        Self::Invalid { path: path.to_string(), reason: reason.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::UnknownSetting(p) | Self::ReadOnly(p) => p,
            Self::Invalid { path, .. } => path,
        }
    }
}
