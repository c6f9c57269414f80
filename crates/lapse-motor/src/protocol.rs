//! Line protocol of the pan/tilt head firmware.
//!
//! Every command is one ASCII line terminated by `\n`. Every accepted command
//! is answered by one line starting with `VERSION`, `OK`, `DONE`, `BUSY`,
//! `ERR` or `STATUS`. Anything else on the wire (boot banner, debug prints)
//! is noise.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MotorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Version,
    Ok,
    Done,
    Busy,
    Err,
    Status,
}

impl ReplyKind {
    const ALL: [(ReplyKind, &'static str); 6] = [
        (ReplyKind::Version, "VERSION"),
        (ReplyKind::Status, "STATUS"),
        (ReplyKind::Done, "DONE"),
        (ReplyKind::Busy, "BUSY"),
        (ReplyKind::Err, "ERR"),
        (ReplyKind::Ok, "OK"),
    ];

    fn prefix(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(k, _)| *k == self)
            .map(|(_, p)| *p)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    /// Whole line, trimmed.
    pub text: String,
}

impl Reply {
    /// Text after the keyword, e.g. `1.0.1` for `VERSION 1.0.1`.
    pub fn detail(&self) -> &str {
        self.text.get(self.kind.prefix().len()..).unwrap_or("").trim()
    }
}

/// Classifies one received line. Returns `None` for noise.
pub fn parse_reply(line: &str) -> Option<Reply> {
    let text = line.trim();
    ReplyKind::ALL.iter().find_map(|(kind, prefix)| {
        let head = text.get(..prefix.len())?;
        if !head.eq_ignore_ascii_case(prefix) {
            return None;
        }
        let boundary = text[prefix.len()..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'));
        boundary.then(|| Reply { kind: *kind, text: text.to_string() })
    })
}

/// `STATUS <pan> <tilt> <drivers>` as `(pan, tilt, drivers_enabled)`.
pub fn parse_status(reply: &Reply) -> Result<(f64, f64, bool), MotorError> {
    let bad = || MotorError::Protocol { command: "S".into(), reply: reply.text.clone() };
    if reply.kind != ReplyKind::Status {
        return Err(bad());
    }
    let mut parts = reply.detail().split_whitespace();
    let pan: f64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let tilt: f64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let drivers = parts.next().ok_or_else(bad)?;
    let enabled = !matches!(drivers.to_ascii_uppercase().as_str(), "0" | "OFF" | "DISABLED");
    Ok((pan, tilt, enabled))
}

/// Absolute target, as understood by firmware that completes moves before
/// replying.
pub fn absolute_move(pan: f64, tilt: f64) -> String {
    format!("M {:.6} {:.6}", pan, tilt)
}

/// Relative delta, as understood by firmware that replies immediately and
/// reports completion through `Q`.
pub fn relative_move(d_pan: f64, d_tilt: f64) -> String {
    format!("M {:.3} {:.3}", d_pan, d_tilt)
}

/// A delta rounded to the resolution [`relative_move`] puts on the wire.
pub fn round_relative(delta: f64) -> f64 {
    (delta * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Microstep {
    Full,
    Half,
    Quarter,
    Eighth,
    #[default]
    Sixteenth,
}

impl Microstep {
    pub fn divisor(self) -> u8 {
        match self {
            Self::Full => 1,
            Self::Half => 2,
            Self::Quarter => 4,
            Self::Eighth => 8,
            Self::Sixteenth => 16,
        }
    }

    /// Single character command; 16 is sent as `6`.
    pub fn command(self) -> &'static str {
        match self {
            Self::Full => "1",
            Self::Half => "2",
            Self::Quarter => "4",
            Self::Eighth => "8",
            Self::Sixteenth => "6",
        }
    }
}

impl TryFrom<u8> for Microstep {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Full),
            2 => Ok(Self::Half),
            4 => Ok(Self::Quarter),
            8 => Ok(Self::Eighth),
            16 => Ok(Self::Sixteenth),
            other => Err(format!("microstep must be one of 1, 2, 4, 8, 16, not {}", other)),
        }
    }
}

impl From<Microstep> for u8 {
    fn from(m: Microstep) -> u8 {
        m.divisor()
    }
}

/// Manual jog commands. These move the axes outside the tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jog {
    PanStep,
    PanRevolution,
    PanReverse,
    PanStop,
    TiltStep,
    TiltRevolution,
    TiltReverse,
    TiltStop,
    Faster,
    Slower,
}

impl Jog {
    pub fn command(self) -> &'static str {
        match self {
            Self::PanStep => "n",
            Self::PanRevolution => "c",
            Self::PanReverse => "r",
            Self::PanStop => "x",
            Self::TiltStep => "w",
            Self::TiltRevolution => "p",
            Self::TiltReverse => "t",
            Self::TiltStop => "z",
            Self::Faster => "+",
            Self::Slower => "-",
        }
    }
}

impl FromStr for Jog {
    type Err = MotorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pan-step" => Self::PanStep,
            "pan-rev" => Self::PanRevolution,
            "pan-reverse" => Self::PanReverse,
            "pan-stop" => Self::PanStop,
            "tilt-step" => Self::TiltStep,
            "tilt-rev" => Self::TiltRevolution,
            "tilt-reverse" => Self::TiltReverse,
            "tilt-stop" => Self::TiltStop,
            "faster" => Self::Faster,
            "slower" => Self::Slower,
            other => return Err(MotorError::InvalidArgument(format!("unknown jog '{}'", other))),
        })
    }
}

impl fmt::Display for Jog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}
