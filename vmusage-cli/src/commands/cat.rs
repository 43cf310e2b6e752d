//! `vmusage cat` command

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;
use vmusage_core::reader::read_log;
use vmusage_core::UsageRecord;

/// Print the records of a usage log as JSON lines.
pub fn cat(path: &Path, summary_only: bool) -> Result<()> {
    let contents =
        read_log(path).with_context(|| format!("Failed to read {}", path.display()))?;

    if contents.skipped > 0 {
        warn!(path = %path.display(), skipped = contents.skipped, "skipped unparseable lines");
    }

    for record in contents.records {
        if summary_only && !matches!(record, UsageRecord::Summary(_)) {
            continue;
        }
        print!("{}", record.to_line()?);
    }
    Ok(())
}
