//! Usage record types.
//!
//! One record is one JSON line in an hourly usage log. Per-VM records carry
//! `type: "usage"`; every write cycle ends with exactly one `type: "summary"`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Data version tag written into the `v` field of every record.
pub const DATA_VERSION: &str = "HF4";

/// Identity of the host the daemon runs on, fetched once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub sdc_version: String,
    pub server_uuid: String,
    pub datacenter_name: String,
}

/// Fields shared by every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Data version tag.
    pub v: String,
    /// Sample time.
    #[serde(with = "iso8601_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub host: HostIdentity,
}

impl RecordHeader {
    pub fn new(timestamp: DateTime<Utc>, host: &HostIdentity) -> Self {
        Self { v: DATA_VERSION.to_string(), timestamp, host: host.clone() }
    }
}

/// Usage sample for a single VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmUsage {
    #[serde(flatten)]
    pub header: RecordHeader,
    /// VM identifier; the key of the usage cache.
    pub uuid: String,
    #[serde(default)]
    pub os_uuid: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub network_usage: Value,
    #[serde(default)]
    pub disk_usage: Value,
}

/// Per-cycle summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(flatten)]
    pub header: RecordHeader,
    pub vm_count: u64,
    /// Collection runtime in milliseconds.
    pub runtime: u64,
}

/// A single line of a usage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UsageRecord {
    Usage(VmUsage),
    Summary(Summary),
}

impl UsageRecord {
    pub fn header(&self) -> &RecordHeader {
        match self {
            UsageRecord::Usage(u) => &u.header,
            UsageRecord::Summary(s) => &s.header,
        }
    }

    /// Render the record as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl From<VmUsage> for UsageRecord {
    fn from(u: VmUsage) -> Self {
        UsageRecord::Usage(u)
    }
}

impl From<Summary> for UsageRecord {
    fn from(s: Summary) -> Self {
        UsageRecord::Summary(s)
    }
}

/// ISO-8601 in UTC with millisecond precision, e.g. `2024-03-01T12:00:05.000Z`.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

mod iso8601_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(t))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
