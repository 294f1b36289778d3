//! Core types for device state and motion logs.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::{ParseError, ParseResult};

/// Maximum length of a device name in bytes.
pub const MAX_DEVICE_NAME_LEN: usize = 64;

/// Live state of a single registered device.
///
/// One record exists per device name. The persisted row in the device table
/// is derived from this shape and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceRecord {
    /// Unique device name. Never changes once the record exists.
    pub name: String,
    /// Number of the set the device is currently recording into. Starts at 1.
    pub set_number: u32,
    /// When the last rotation happened, if any.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub latest_set_time: Option<OffsetDateTime>,
    /// Most recent contact from the device.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub latest_check_in_time: OffsetDateTime,
    /// A rotation was requested and the device has not acknowledged it yet.
    pub is_new_set: bool,
    /// Whether the device should be sampling.
    pub is_recording: bool,
    /// False once the sweeper has marked the device stale.
    pub is_checked_in: bool,
}

impl DeviceRecord {
    /// Create the record for a device checking in for the first time.
    pub fn new(name: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            name: name.into(),
            set_number: 1,
            latest_set_time: None,
            latest_check_in_time: now,
            is_new_set: false,
            is_recording: true,
            is_checked_in: true,
        }
    }

    /// Number of archived sets implied by the current set number.
    pub fn completed_sets(&self) -> u32 {
        self.set_number.saturating_sub(1)
    }

    /// Whether the last contact is older than `timeout` at `now`.
    pub fn is_stale(&self, now: OffsetDateTime, timeout: time::Duration) -> bool {
        now - self.latest_check_in_time > timeout
    }
}

/// A single motion sample reported by a device.
///
/// On disk this is one line of a device log:
/// `deviceName,YYYY-MM-DD,HH:MM:SS,movement`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MotionEvent {
    /// Device that produced the sample.
    pub device_name: String,
    /// Sample time, second precision, UTC.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Whether motion was detected.
    pub movement: bool,
}

impl MotionEvent {
    /// Create an event, truncating the timestamp to whole seconds.
    pub fn new(device_name: impl Into<String>, timestamp: OffsetDateTime, movement: bool) -> Self {
        Self {
            device_name: device_name.into(),
            timestamp: timestamp.replace_nanosecond(0).unwrap_or(timestamp),
            movement,
        }
    }

    /// Render the event as a newline-terminated log line.
    pub fn to_line(&self) -> String {
        let ts = self.timestamp;
        format!(
            "{},{:04}-{:02}-{:02},{:02}:{:02}:{:02},{}\n",
            self.device_name,
            ts.year(),
            u8::from(ts.month()),
            ts.day(),
            ts.hour(),
            ts.minute(),
            ts.second(),
            self.movement
        )
    }
}

impl FromStr for MotionEvent {
    type Err = ParseError;

    fn from_str(line: &str) -> ParseResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split(',').collect();
        let [name, date, clock, movement] = fields.as_slice() else {
            return Err(ParseError::MalformedLine(line.to_string()));
        };

        if name.is_empty() {
            return Err(ParseError::MalformedLine(line.to_string()));
        }

        Ok(Self {
            device_name: (*name).to_string(),
            timestamp: parse_timestamp(date, clock)?,
            movement: parse_movement(movement)?,
        })
    }
}

/// Parse the fixed-width date and time fields of a log line as a UTC timestamp.
pub fn parse_timestamp(date: &str, clock: &str) -> ParseResult<OffsetDateTime> {
    let joined = format!("{} {}", date.trim(), clock.trim());
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(&joined, format)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|_| ParseError::InvalidTimestamp(joined))
}

/// Parse a movement flag. Accepts `true`/`false` in any letter case.
pub fn parse_movement(value: &str) -> ParseResult<bool> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ParseError::InvalidMovement(value.to_string()))
    }
}

/// Check that a device name is usable as a file name and log field.
///
/// Allowed: ASCII letters and digits, `-`, `_` and inner spaces, at most
/// [`MAX_DEVICE_NAME_LEN`] bytes.
pub fn validate_device_name(name: &str) -> ParseResult<()> {
    let invalid = |reason| ParseError::InvalidDeviceName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_DEVICE_NAME_LEN {
        return Err(invalid("name is too long"));
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return Err(invalid("name cannot start or end with a space"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ' ')
    {
        return Err(invalid("only letters, digits, '-', '_' and spaces are allowed"));
    }

    Ok(())
}

/// Time granularity of a motion chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TimeMeasure {
    /// Twelve five-minute buckets over the trailing hour.
    Hour,
    /// Twenty-four one-hour buckets over the trailing day.
    #[default]
    Day,
    /// Both of the above, computed independently.
    All,
}

impl TimeMeasure {
    /// The concrete granularities this selector expands to.
    pub fn granularities(self) -> &'static [TimeMeasure] {
        match self {
            TimeMeasure::Hour => &[TimeMeasure::Hour],
            TimeMeasure::Day => &[TimeMeasure::Day],
            TimeMeasure::All => &[TimeMeasure::Hour, TimeMeasure::Day],
        }
    }

    /// Bucket width and count, or `None` for [`TimeMeasure::All`].
    pub fn buckets(self) -> Option<(time::Duration, usize)> {
        match self {
            TimeMeasure::Hour => Some((time::Duration::minutes(5), 12)),
            TimeMeasure::Day => Some((time::Duration::hours(1), 24)),
            TimeMeasure::All => None,
        }
    }
}

impl fmt::Display for TimeMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeMeasure::Hour => write!(f, "hour"),
            TimeMeasure::Day => write!(f, "day"),
            TimeMeasure::All => write!(f, "all"),
        }
    }
}

impl FromStr for TimeMeasure {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(TimeMeasure::Hour),
            "day" => Ok(TimeMeasure::Day),
            "all" => Ok(TimeMeasure::All),
            _ => Err(ParseError::UnknownTimeMeasure(s.to_string())),
        }
    }
}
