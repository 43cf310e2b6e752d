//! `vmusage compact` command

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use vmusage_core::compact_pass;

/// Run one compaction pass over `dir` as of now.
pub async fn compact(dir: &Path) -> Result<()> {
    let report = compact_pass(dir, Utc::now())
        .await
        .with_context(|| format!("Compaction of {} failed", dir.display()))?;

    println!("Compacted: {}", report.compacted);
    println!("Recovered: {}", report.recovered);
    println!("Skipped:   {}", report.skipped);
    println!("Failed:    {}", report.failed);
    Ok(())
}
