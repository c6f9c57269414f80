use serde::{Deserialize, Serialize};
use std::fmt;

/// Value as supplied by the caller (config file, CLI). Untyped until it is
/// normalized against a concrete entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    /// Parses a CLI style `key=value` right-hand side. Numbers and booleans
    /// are recognised, everything else stays text.
    pub fn parse_loose(s: &str) -> Self {
        let t = s.trim();
        if let Ok(b) = t.parse::<bool>() {
            return Self::Bool(b);
        }
        if let Ok(i) = t.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = t.parse::<f64>() {
            if f.is_finite() {
                return Self::Float(f);
            }
        }
        Self::Text(s.to_string())
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for RawValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for RawValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

/// Normalized value, typed per setting kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SettingValue {
    Text(String),
    Number(f64),
    Toggle(bool),
    Choice(String),
    /// Seconds since the Unix epoch.
    Date(i64),
}

impl SettingValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Choice(s) => Some(s),
            _ => None,
        }
    }
}

/// Wire form as the camera expects it: integral numbers without a fraction,
/// toggles as `1`/`0`.
impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) | Self::Choice(s) => f.write_str(s),
            Self::Number(x) if x.fract() == 0.0 && x.abs() < 1e15 => write!(f, "{}", *x as i64),
            Self::Number(x) => write!(f, "{}", x),
            Self::Toggle(b) => f.write_str(if *b { "1" } else { "0" }),
            Self::Date(t) => write!(f, "{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn raw_values_deserialize_untagged_from_toml() {
        let m: BTreeMap<String, RawValue> = toml::from_str(
            r#"
            "main.imgsettings.iso" = "400"
            "main.capturesettings.exposurecompensation" = -0.5
            "main.actions.viewfinder" = true
            "main.capturesettings.focallength" = 35
            "#,
        )
        .unwrap();
        assert_eq!(m["main.imgsettings.iso"], RawValue::Text("400".into()));
        assert_eq!(m["main.capturesettings.exposurecompensation"], RawValue::Float(-0.5));
        assert_eq!(m["main.actions.viewfinder"], RawValue::Bool(true));
        assert_eq!(m["main.capturesettings.focallength"], RawValue::Int(35));
    }

    #[test]
    fn loose_parsing() {
        assert_eq!(RawValue::parse_loose("true"), RawValue::Bool(true));
        assert_eq!(RawValue::parse_loose("12"), RawValue::Int(12));
        assert_eq!(RawValue::parse_loose("1.5"), RawValue::Float(1.5));
        assert_eq!(RawValue::parse_loose("1/250"), RawValue::Text("1/250".into()));
    }

    #[test]
    fn wire_format() {
        assert_eq!(SettingValue::Number(100.0).to_string(), "100");
        assert_eq!(SettingValue::Number(0.25).to_string(), "0.25");
        assert_eq!(SettingValue::Toggle(true).to_string(), "1");
        assert_eq!(SettingValue::Date(1_700_000_000).to_string(), "1700000000");
    }
}
