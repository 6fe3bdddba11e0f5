//! Time source and timezone normalisation for postponements

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};

use crate::error::{Error, Result};

/// Supplies "now"
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Parse `Z`, `UTC`, `+HH`, `+HHMM` or `+HH:MM` (and `-` forms)
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let s = raw.trim();
    let invalid = || Error::ConfigError(format!("invalid UTC offset '{}'", raw));
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }
    let (sign, rest) = match s.chars().next() {
        Some('+') => (1, &s[1..]),
        Some('-') => (-1, &s[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) || rest.matches(':').count() > 1 {
        return Err(invalid());
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().map_err(|_| invalid())?, 0),
        4 => (
            digits[..2].parse::<i32>().map_err(|_| invalid())?,
            digits[2..].parse::<i32>().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    };
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Reference and upstream zones used to read and compare timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceZone {
    reference: FixedOffset,
    upstream: FixedOffset,
}

impl Default for ReferenceZone {
    fn default() -> Self {
        let utc = Utc.fix();
        Self::new(utc, utc)
    }
}

impl ReferenceZone {
    pub fn new(reference: FixedOffset, upstream: FixedOffset) -> Self {
        Self {
            reference,
            upstream,
        }
    }

    pub fn reference(&self) -> FixedOffset {
        self.reference
    }

    pub fn upstream(&self) -> FixedOffset {
        self.upstream
    }

    /// Read a timestamp. Explicit offsets are honoured; naive timestamps
    /// are read in the upstream zone. The result is the same instant in UTC.
    pub fn parse(&self, raw: &str) -> Result<DateTime<Utc>> {
        let s = raw.trim();
        if let Ok(at) = DateTime::parse_from_rfc3339(s) {
            return Ok(at.with_timezone(&Utc));
        }
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                return self.from_upstream(naive);
            }
        }
        Err(Error::InvalidInput(format!(
            "cannot read timestamp '{}'; use RFC 3339 or YYYY-MM-DD HH:MM[:SS]",
            raw
        )))
    }

    /// Interpret a naive timestamp in the upstream zone
    pub fn from_upstream(&self, naive: NaiveDateTime) -> Result<DateTime<Utc>> {
        self.upstream
            .from_local_datetime(&naive)
            .single()
            .map(|at| at.with_timezone(&Utc))
            .ok_or_else(|| Error::InvalidInput(format!("ambiguous local time {}", naive)))
    }

    /// Present an instant in the reference zone
    pub fn display(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.reference)
    }
}
