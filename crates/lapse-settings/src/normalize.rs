use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::error::ValidationError;
use crate::tree::{RangeBounds, SettingEntry, SettingKind};
use crate::value::{RawValue, SettingValue};

/// How range values that fall between steps are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPolicy {
    /// Reject values not aligned to the declared step.
    #[default]
    Strict,
    /// Round to the nearest valid step inside the bounds.
    Snap,
}

const STEP_TOLERANCE: f64 = 1e-9;
const TRUE_WORDS: [&str; 5] = ["1", "true", "on", "yes", "enabled"];
const FALSE_WORDS: [&str; 5] = ["0", "false", "off", "no", "disabled"];

/// Converts `raw` into the typed value `entry` accepts.
pub fn normalize(
    entry: &SettingEntry,
    raw: &RawValue,
    policy: StepPolicy,
) -> Result<SettingValue, ValidationError> {
    let path = entry.path.as_str();
    match entry.kind {
        SettingKind::Toggle => to_bool_like(path, raw).map(SettingValue::Toggle),
        SettingKind::Choice => {
            let choices = entry.choices.as_deref().unwrap_or(&[]);
            coerce_to_choice(path, raw, choices).map(SettingValue::Choice)
        }
        SettingKind::Range => {
            let bounds = entry
                .bounds
                .ok_or_else(|| ValidationError::invalid(path, "range without bounds"))?;
            normalize_range(path, raw, bounds, policy).map(SettingValue::Number)
        }
        SettingKind::Date => to_unix_timestamp(path, raw).map(SettingValue::Date),
        SettingKind::Text | SettingKind::Action => Ok(SettingValue::Text(raw.to_string())),
    }
}

fn normalize_range(
    path: &str,
    raw: &RawValue,
    b: RangeBounds,
    policy: StepPolicy,
) -> Result<f64, ValidationError> {
    if !(b.min <= b.max) {
        return Err(ValidationError::invalid(path, format!("bad bounds [{}, {}]", b.min, b.max)));
    }
    let mut value = to_number(path, raw)?;
    if policy == StepPolicy::Snap {
        value = snap_to_step(value, b);
    }
    if value < b.min || value > b.max {
        return Err(ValidationError::invalid(
            path,
            format!("{} not in [{}, {}]", value, b.min, b.max),
        ));
    }
    if policy == StepPolicy::Strict && !aligns_to_step(value, b.min, b.step) {
        return Err(ValidationError::invalid(
            path,
            format!("{} does not align to step {} from {}", value, b.step, b.min),
        ));
    }
    Ok(value)
}

/// True when `value` sits on the grid `min + k * step`. Non-positive steps
/// accept everything.
pub fn aligns_to_step(value: f64, min: f64, step: f64) -> bool {
    if step <= 0.0 {
        return true;
    }
    let k = (value - min) / step;
    (k - k.round()).abs() <= STEP_TOLERANCE * k.abs().max(1.0)
}

/// Nearest grid point inside the bounds. The step index is clamped, so the
/// result is both in bounds and aligned.
pub fn snap_to_step(value: f64, b: RangeBounds) -> f64 {
    if b.step <= 0.0 {
        return value.clamp(b.min, b.max);
    }
    let max_k = ((b.max - b.min) / b.step + STEP_TOLERANCE).floor().max(0.0);
    let k = ((value - b.min) / b.step).round().clamp(0.0, max_k);
    (b.min + k * b.step).clamp(b.min, b.max)
}

fn to_number(path: &str, raw: &RawValue) -> Result<f64, ValidationError> {
    let v = match raw {
        RawValue::Int(i) => *i as f64,
        RawValue::Float(x) => *x,
        RawValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ValidationError::invalid(path, format!("expected a number, got {:?}", s)))?,
        RawValue::Bool(b) => {
            return Err(ValidationError::invalid(path, format!("expected a number, got {}", b)))
        }
    };
    if !v.is_finite() {
        return Err(ValidationError::invalid(path, "number must be finite"));
    }
    Ok(v)
}

fn to_bool_like(path: &str, raw: &RawValue) -> Result<bool, ValidationError> {
    match raw {
        RawValue::Bool(b) => Ok(*b),
        RawValue::Int(i) => Ok(*i != 0),
        RawValue::Text(s) => {
            let s = s.trim().to_ascii_lowercase();
            if TRUE_WORDS.contains(&s.as_str()) {
                Ok(true)
            } else if FALSE_WORDS.contains(&s.as_str()) {
                Ok(false)
            } else {
                Err(ValidationError::invalid(path, format!("expected a boolean, got {:?}", s)))
            }
        }
        RawValue::Float(x) => {
            Err(ValidationError::invalid(path, format!("expected a boolean, got {}", x)))
        }
    }
}

fn coerce_to_choice(path: &str, raw: &RawValue, valid: &[String]) -> Result<String, ValidationError> {
    let has = |s: &str| valid.iter().any(|c| c == s);
    let found = match raw {
        RawValue::Text(s) => has(s.as_str()).then(|| s.clone()),
        RawValue::Bool(b) => [("On", "Off"), ("1", "0"), ("True", "False")]
            .into_iter()
            .find(|(t, f)| has(*t) && has(*f))
            .map(|(t, f)| (if *b { t } else { f }).to_string()),
        RawValue::Int(i) => {
            let s = i.to_string();
            has(s.as_str()).then_some(s)
        }
        RawValue::Float(x) => {
            let mut candidates = vec![x.to_string()];
            if x.fract() == 0.0 {
                candidates.push(format!("{}", *x as i64));
                candidates.push(format!("{:.1}", x));
            }
            candidates.into_iter().find(|c| has(c.as_str()))
        }
    };
    found.ok_or_else(|| {
        ValidationError::invalid(path, format!("{} is not one of {:?}", raw, valid))
    })
}

fn to_unix_timestamp(path: &str, raw: &RawValue) -> Result<i64, ValidationError> {
    let parsed = match raw {
        RawValue::Int(i) => Some(*i),
        RawValue::Float(x) if x.is_finite() => Some(x.trunc() as i64),
        RawValue::Text(s) => parse_date_text(s.trim()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ValidationError::invalid(
            path,
            format!("expected epoch seconds, a date/datetime or ISO-8601 string, got {}", raw),
        )
    })
}

/// Naive dates and datetimes are taken as UTC.
fn parse_date_text(s: &str) -> Option<i64> {
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(dt.unix_timestamp());
    }
    let with_t = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let with_space = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    for fmt in [with_t, with_space] {
        if let Ok(dt) = PrimitiveDateTime::parse(s, fmt) {
            return Some(dt.assume_utc().unix_timestamp());
        }
    }
    if let Ok(d) = Date::parse(s, format_description!("[year]-[month]-[day]")) {
        return Some(d.midnight().assume_utc().unix_timestamp());
    }
    s.parse::<f64>().ok().filter(|x| x.is_finite()).map(|x| x.trunc() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: SettingKind) -> SettingEntry {
        SettingEntry {
            path: "main.test".into(),
            label: "Test".into(),
            kind,
            current: None,
            choices: None,
            bounds: None,
            readonly: false,
        }
    }

    fn range(min: f64, max: f64, step: f64) -> SettingEntry {
        SettingEntry { bounds: Some(RangeBounds { min, max, step }), ..entry(SettingKind::Range) }
    }

    fn choice(choices: &[&str]) -> SettingEntry {
        SettingEntry {
            choices: Some(choices.iter().map(|s| s.to_string()).collect()),
            ..entry(SettingKind::Choice)
        }
    }

    #[test]
    fn strict_range_accepts_only_aligned_in_bounds_values() {
        let e = range(-3.0, 3.0, 0.5);
        for v in [-3.0, -0.5, 0.0, 2.5, 3.0] {
            assert_eq!(
                normalize(&e, &RawValue::Float(v), StepPolicy::Strict),
                Ok(SettingValue::Number(v))
            );
        }
        for v in [-3.5, 3.01, 0.25, 1.1] {
            assert!(normalize(&e, &RawValue::Float(v), StepPolicy::Strict).is_err(), "{v}");
        }
    }

    #[test]
    fn strict_range_tolerates_float_noise() {
        let e = range(0.0, 1.0, 0.1);
        assert!(normalize(&e, &RawValue::Float(0.3), StepPolicy::Strict).is_ok());
        assert!(normalize(&e, &RawValue::Text(" 0.7 ".into()), StepPolicy::Strict).is_ok());
    }

    #[test]
    fn snap_always_lands_in_bounds_on_the_grid() {
        let b = RangeBounds { min: 0.0, max: 10.0, step: 3.0 };
        let e = range(b.min, b.max, b.step);
        for raw in [-100.0, -1.4, 0.0, 1.4, 1.6, 4.49, 8.9, 9.9, 10.0, 250.0] {
            let v = normalize(&e, &RawValue::Float(raw), StepPolicy::Snap)
                .unwrap()
                .as_number()
                .unwrap();
            assert!(v >= b.min && v <= b.max, "{raw} -> {v}");
            assert!(aligns_to_step(v, b.min, b.step), "{raw} -> {v}");
        }
        // 9.9 is nearest to 9 once the last reachable grid point is 9, not 12
        assert_eq!(snap_to_step(9.9, b), 9.0);
        assert_eq!(snap_to_step(1.6, b), 3.0);
    }

    #[test]
    fn snap_fractional_step_stays_within_max() {
        let b = RangeBounds { min: 0.0, max: 0.3, step: 0.1 };
        let v = snap_to_step(0.31, b);
        assert!(v <= 0.3);
        assert!(aligns_to_step(v, 0.0, 0.1));
    }

    #[test]
    fn non_numeric_range_value_is_rejected() {
        let e = range(0.0, 10.0, 1.0);
        assert!(normalize(&e, &RawValue::Bool(true), StepPolicy::Snap).is_err());
        assert!(normalize(&e, &RawValue::Text("fast".into()), StepPolicy::Snap).is_err());
        assert!(normalize(&e, &RawValue::Float(f64::NAN), StepPolicy::Snap).is_err());
    }

    #[test]
    fn choice_coerces_booleans_and_numbers() {
        let on_off = choice(&["On", "Off"]);
        assert_eq!(
            normalize(&on_off, &RawValue::Bool(false), StepPolicy::Strict),
            Ok(SettingValue::Choice("Off".into()))
        );
        let digits = choice(&["0", "1"]);
        assert_eq!(
            normalize(&digits, &RawValue::Bool(true), StepPolicy::Strict),
            Ok(SettingValue::Choice("1".into()))
        );
        let iso = choice(&["Auto", "100", "200"]);
        assert_eq!(
            normalize(&iso, &RawValue::Int(200), StepPolicy::Strict),
            Ok(SettingValue::Choice("200".into()))
        );
        assert_eq!(
            normalize(&iso, &RawValue::Float(100.0), StepPolicy::Strict),
            Ok(SettingValue::Choice("100".into()))
        );
        assert!(normalize(&iso, &RawValue::Bool(true), StepPolicy::Strict).is_err());
        assert!(normalize(&iso, &RawValue::Text("auto".into()), StepPolicy::Strict).is_err());
    }

    #[test]
    fn toggle_accepts_boolean_like_values() {
        let e = entry(SettingKind::Toggle);
        for raw in [RawValue::Bool(true), RawValue::Int(1), RawValue::Text("On".into())] {
            assert_eq!(normalize(&e, &raw, StepPolicy::Strict), Ok(SettingValue::Toggle(true)));
        }
        assert_eq!(
            normalize(&e, &RawValue::Text("disabled".into()), StepPolicy::Strict),
            Ok(SettingValue::Toggle(false))
        );
        assert!(normalize(&e, &RawValue::Text("maybe".into()), StepPolicy::Strict).is_err());
        assert!(normalize(&e, &RawValue::Float(0.5), StepPolicy::Strict).is_err());
    }

    #[test]
    fn date_accepts_epoch_and_iso_forms() {
        let e = entry(SettingKind::Date);
        let cases = [
            (RawValue::Int(1_700_000_000), 1_700_000_000),
            (RawValue::Float(1_700_000_000.9), 1_700_000_000),
            (RawValue::Text("1700000000".into()), 1_700_000_000),
            (RawValue::Text("2024-01-01".into()), 1_704_067_200),
            (RawValue::Text("2024-01-01T00:00:10".into()), 1_704_067_210),
            (RawValue::Text("2024-01-01 00:01:00".into()), 1_704_067_260),
            (RawValue::Text("2024-01-01T02:00:00+02:00".into()), 1_704_067_200),
        ];
        for (raw, want) in cases {
            assert_eq!(normalize(&e, &raw, StepPolicy::Strict), Ok(SettingValue::Date(want)), "{raw}");
        }
        assert!(normalize(&e, &RawValue::Text("next tuesday".into()), StepPolicy::Strict).is_err());
        assert!(normalize(&e, &RawValue::Bool(true), StepPolicy::Strict).is_err());
    }

    #[test]
    fn text_and_action_pass_through() {
        assert_eq!(
            normalize(&entry(SettingKind::Text), &RawValue::Int(5), StepPolicy::Strict),
            Ok(SettingValue::Text("5".into()))
        );
        assert_eq!(
            normalize(&entry(SettingKind::Action), &RawValue::Text("Near 2".into()), StepPolicy::Strict),
            Ok(SettingValue::Text("Near 2".into()))
        );
    }
}
