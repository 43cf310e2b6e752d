//! Hour buckets and usage log file naming.
//!
//! A sample belongs to the log file of its hour, except that the instant
//! `HH:00:00.000` still belongs to the previous hour: bucket `HH` covers
//! `(HH:00:00.000, HH+1:00:00.000]`. A write tick landing exactly on the hour
//! therefore closes out the prior hour's file.
//!
//! File names are `YYYY-MM-DDTHH.log` in UTC, which sort lexically in time order.

use chrono::{DateTime, Duration, DurationRound, NaiveDate, TimeZone, Utc};
use std::fmt;
use std::path::{Path, PathBuf};

/// Suffix of uncompressed hourly logs.
pub const LOG_SUFFIX: &str = ".log";

/// Suffix appended by compaction.
pub const GZ_SUFFIX: &str = ".gz";

/// Hour-aligned identity of a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourBucket(DateTime<Utc>);

impl HourBucket {
    /// Bucket starting at `start`, which must lie exactly on an hour.
    pub fn from_start(start: DateTime<Utc>) -> Option<Self> {
        match start.duration_trunc(Duration::hours(1)) {
            Ok(aligned) if aligned == start => Some(Self(start)),
            _ => None,
        }
    }

    /// First instant of the hour this bucket is named after.
    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    /// The bucket immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + Duration::hours(1))
    }

    /// `YYYY-MM-DDTHH.log`
    pub fn file_name(&self) -> String {
        self.0.format("%Y-%m-%dT%H.log").to_string()
    }

    /// Parse a log file name back to its bucket.
    ///
    /// Returns `None` for anything that is not exactly `YYYY-MM-DDTHH.log` with
    /// a valid calendar date and hour.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(LOG_SUFFIX)?;
        let bytes = stem.as_bytes();
        if bytes.len() != 13 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' {
            return None;
        }
        let digits = [0..4, 5..7, 8..10, 11..13];
        if !digits.into_iter().all(|r| bytes[r].iter().all(u8::is_ascii_digit)) {
            return None;
        }

        let date = NaiveDate::parse_from_str(&stem[..10], "%Y-%m-%d").ok()?;
        let hour: u32 = stem[11..].parse().ok()?;
        let naive = date.and_hms_opt(hour, 0, 0)?;
        Some(Self(Utc.from_utc_datetime(&naive)))
    }
}

impl fmt::Display for HourBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:00:00Z"))
    }
}

/// Anything that can be aligned to an hour bucket.
pub trait ToHourBucket {
    fn to_hour_bucket(&self) -> HourBucket;
}

impl ToHourBucket for DateTime<Utc> {
    fn to_hour_bucket(&self) -> HourBucket {
        let millis = self.duration_trunc(Duration::milliseconds(1)).unwrap_or(*self);
        let shifted = millis - Duration::milliseconds(1);
        HourBucket(shifted.duration_trunc(Duration::hours(1)).unwrap_or(shifted))
    }
}

impl ToHourBucket for HourBucket {
    fn to_hour_bucket(&self) -> HourBucket {
        *self
    }
}

/// Align a timestamp (or an existing bucket) to its hour bucket.
pub fn hour_bucket(t: impl ToHourBucket) -> HourBucket {
    t.to_hour_bucket()
}

/// Path of the log file a sample taken at `t` is appended to.
pub fn usage_file_path(dir: &Path, t: DateTime<Utc>) -> PathBuf {
    dir.join(hour_bucket(t).file_name())
}

/// Name of the compressed archive for a log file name.
pub fn gz_name(name: &str) -> String {
    format!("{}{}", name, GZ_SUFFIX)
}

/// Hidden temporary path compaction writes to before the atomic rename.
pub fn temp_gz_path(log_path: &Path) -> PathBuf {
    let name = log_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    log_path.with_file_name(format!(".{}", gz_name(&name)))
}
