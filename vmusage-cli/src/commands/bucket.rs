//! `vmusage bucket` command

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use vmusage_core::hour_bucket;

/// Print the hourly log file a timestamp belongs to.
pub fn bucket(timestamp: Option<&str>) -> Result<()> {
    println!("{}", bucket_file_name(timestamp, Utc::now())?);
    Ok(())
}

fn bucket_file_name(timestamp: Option<&str>, now: DateTime<Utc>) -> Result<String> {
    let t = match timestamp {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("Invalid timestamp: {}", raw))?
            .with_timezone(&Utc),
        None => now,
    };
    Ok(hour_bucket(t).file_name())
}
