//! Human-readable memory sizes and durations.
//!
//! Both types parse from and print to the strings used in `config.toml` and in
//! runtime-parameter URL parameters (`cache-max-size=4 GB`,
//! `default-query-timeout=30s`).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;
const GB: u64 = 1 << 30;
const TB: u64 = 1 << 40;

/// Error produced when a size or duration string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Could not parse \"{input}\" as {expected}")]
pub struct UnitParseError {
    pub input: String,
    pub expected: &'static str,
}

/// Splits `"4.5 GB"` into `("4.5", "GB")`.
fn split_number_and_unit(input: &str) -> (&str, &str) {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    (number, unit.trim())
}

/// An amount of memory in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn bytes(bytes: u64) -> Self {
        MemorySize(bytes)
    }

    pub const fn kilobytes(kb: u64) -> Self {
        MemorySize(kb * KB)
    }

    pub const fn megabytes(mb: u64) -> Self {
        MemorySize(mb * MB)
    }

    pub const fn gigabytes(gb: u64) -> Self {
        MemorySize(gb * GB)
    }

    pub const fn get_bytes(self) -> u64 {
        self.0
    }

    /// Byte count clamped to the platform's `usize`
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }

    pub fn parse(input: &str) -> Result<Self, UnitParseError> {
        let err = || UnitParseError {
            input: input.to_string(),
            expected: "a memory size (e.g. \"512 MB\" or \"4GB\")",
        };
        let (number, unit) = split_number_and_unit(input);
        if number.is_empty() {
            return Err(err());
        }
        let factor = match unit.to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "KB" | "K" => KB,
            "MB" | "M" => MB,
            "GB" | "G" => GB,
            "TB" | "T" => TB,
            _ => return Err(err()),
        };
        if factor == 1 {
            return number.parse::<u64>().map(MemorySize).map_err(|_| err());
        }
        let value: f64 = number.parse().map_err(|_| err())?;
        Ok(MemorySize((value * factor as f64).round() as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Largest unit that divides the size exactly, so printing and parsing
        // never lose bytes.
        for (factor, unit) in [(TB, "TB"), (GB, "GB"), (MB, "MB"), (KB, "kB")] {
            if self.0 >= factor && self.0 % factor == 0 {
                return write!(f, "{} {unit}", self.0 / factor);
            }
        }
        write!(f, "{} B", self.0)
    }
}

impl TryFrom<String> for MemorySize {
    type Error = UnitParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MemorySize::parse(&value)
    }
}

impl From<MemorySize> for String {
    fn from(value: MemorySize) -> Self {
        value.to_string()
    }
}

/// A duration written with a unit suffix: `500ms`, `30s`, `2min`, `1h`.
/// A bare number is read as seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeLimit(Duration);

impl TimeLimit {
    pub const fn from_secs(secs: u64) -> Self {
        TimeLimit(Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        TimeLimit(Duration::from_millis(millis))
    }

    pub const fn duration(self) -> Duration {
        self.0
    }

    pub fn parse(input: &str) -> Result<Self, UnitParseError> {
        let err = || UnitParseError {
            input: input.to_string(),
            expected: "a duration (e.g. \"500ms\", \"30s\" or \"5min\")",
        };
        let (number, unit) = split_number_and_unit(input);
        if number.is_empty() {
            return Err(err());
        }
        let millis_per_unit: u64 = match unit.to_ascii_lowercase().as_str() {
            "ms" => 1,
            "" | "s" | "sec" => 1000,
            "min" | "m" => 60_000,
            "h" => 3_600_000,
            _ => return Err(err()),
        };
        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(millis_per_unit)
                .map(|millis| TimeLimit(Duration::from_millis(millis)))
                .ok_or_else(err);
        }
        let value: f64 = number.parse().map_err(|_| err())?;
        Duration::try_from_secs_f64(value * millis_per_unit as f64 / 1000.0)
            .map(TimeLimit)
            .map_err(|_| err())
    }
}

impl From<Duration> for TimeLimit {
    fn from(value: Duration) -> Self {
        TimeLimit(value)
    }
}

impl fmt::Display for TimeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis % 1000 == 0 {
            write!(f, "{}s", millis / 1000)
        } else {
            write!(f, "{millis}ms")
        }
    }
}

impl TryFrom<String> for TimeLimit {
    type Error = UnitParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TimeLimit::parse(&value)
    }
}

impl From<TimeLimit> for String {
    fn from(value: TimeLimit) -> Self {
        value.to_string()
    }
}
