//! Reading usage logs back.
//!
//! Logs may contain blank lines (one per writer) and, after a crash, a
//! truncated record. Both are skipped.

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::bucket::GZ_SUFFIX;
use crate::error::{Result, UsageError};
use crate::record::UsageRecord;

/// Records recovered from one log file.
#[derive(Debug, Default)]
pub struct LogContents {
    pub records: Vec<UsageRecord>,
    /// Non-blank lines that did not parse as a record.
    pub skipped: usize,
}

/// Read a `.log` or `.log.gz` file.
pub fn read_log(path: &Path) -> Result<LogContents> {
    let file =
        File::open(path).map_err(|e| UsageError::Io { path: path.to_path_buf(), source: e })?;

    let is_gz = path.to_string_lossy().ends_with(GZ_SUFFIX);
    let input: Box<dyn Read> =
        if is_gz { Box::new(MultiGzDecoder::new(file)) } else { Box::new(file) };

    let mut contents = LogContents::default();
    for line in BufReader::new(input).split(b'\n') {
        let line = line.map_err(|e| UsageError::Io { path: path.to_path_buf(), source: e })?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<UsageRecord>(&line) {
            Ok(record) => contents.records.push(record),
            Err(_) => contents.skipped += 1,
        }
    }
    Ok(contents)
}
