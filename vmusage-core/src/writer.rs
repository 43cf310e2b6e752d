//! Durable append-only writer for hourly usage logs.
//!
//! Each writer owns one hour file for its lifetime. Records are rendered on
//! the caller's side and funnelled through a single-consumer queue, so lines
//! reach the file in the order they were written and the file never sees
//! overlapping writes.
//!
//! The file is opened for append and a blank line is written first. If a
//! previous process died half way through a record, that blank line makes
//! sure the next record starts on its own line; readers skip blank and
//! unparseable lines.
//!
//! Durability is only promised once [`UsageFileWriter::end`] returns: the
//! queue is drained, the file flushed and `fsync`ed.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{DirBuilder, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::bucket;
use crate::error::{Result, UsageError};
use crate::observability::metrics;
use crate::record::UsageRecord;

/// Mode for the usage log directory.
pub const MODE_DIR: u32 = 0o750;

/// Mode for usage log files.
pub const MODE_FILE: u32 = 0o640;

/// Writer for one hourly usage log file.
pub struct UsageFileWriter {
    path: PathBuf,
    queue: mpsc::UnboundedSender<String>,
    task: JoinHandle<Result<u64>>,
}

impl UsageFileWriter {
    /// Start writing to the hour file for `now` under `dir`.
    ///
    /// Opening happens in the background; records written before the file is
    /// open are queued and written once it is.
    pub fn open(dir: &Path, now: DateTime<Utc>) -> Self {
        let path = bucket::usage_file_path(dir, now);
        let (queue, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drain(path.clone(), rx));

        Self { path, queue, task }
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a record for writing.
    ///
    /// Never blocks. Fails only if the background writer already stopped
    /// because of an I/O error; the error itself is reported by [`end`](Self::end).
    pub fn write(&self, record: &UsageRecord) -> Result<()> {
        let line = record.to_line()?;
        self.queue.send(line).map_err(|_| UsageError::WriterClosed { path: self.path.clone() })
    }

    /// Close the writer and wait until every queued record is durable.
    ///
    /// Consuming `self` makes further writes and a second `end` impossible.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn end(self) -> Result<PathBuf> {
        let Self { path, queue, task } = self;
        drop(queue);

        let records = task.await.map_err(UsageError::internal)??;
        debug!(records, "usage file synced");
        Ok(path)
    }
}

async fn drain(path: PathBuf, mut rx: mpsc::UnboundedReceiver<String>) -> Result<u64> {
    let mut file = open_for_append(&path).await?;

    // Guard against a truncated trailing record from an earlier writer.
    write_all(&mut file, &path, b"\n").await?;

    let mut records = 0u64;
    while let Some(line) = rx.recv().await {
        write_all(&mut file, &path, line.as_bytes()).await?;
        records += 1;
    }

    file.flush().await.map_err(|e| durability(&path, "flush", e))?;
    file.sync_all().await.map_err(|e| durability(&path, "fsync", e))?;
    metrics::record_records_written(records);

    Ok(records)
}

/// Create the usage log directory (and its parents) if missing.
pub async fn create_log_dir(dir: &Path) -> Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(MODE_DIR);
    builder.create(dir).await.map_err(|e| UsageError::Io { path: dir.to_path_buf(), source: e })
}

async fn open_for_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        create_log_dir(parent).await?;
    }

    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    options.mode(MODE_FILE);

    let file = options
        .open(path)
        .await
        .map_err(|e| UsageError::Io { path: path.to_path_buf(), source: e })?;
    debug!(path = %path.display(), "usage file opened");
    Ok(file)
}

async fn write_all(file: &mut File, path: &Path, bytes: &[u8]) -> Result<()> {
    file.write_all(bytes).await.map_err(|e| durability(path, "write", e))
}

fn durability(path: &Path, operation: &'static str, source: std::io::Error) -> UsageError {
    UsageError::Durability { path: path.to_path_buf(), operation, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HostIdentity, RecordHeader, Summary, VmUsage};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn host() -> HostIdentity {
        HostIdentity {
            sdc_version: "7.0".into(),
            server_uuid: "server-1".into(),
            datacenter_name: "dc".into(),
        }
    }

    fn usage(t: DateTime<Utc>, uuid: &str) -> UsageRecord {
        UsageRecord::from(VmUsage {
            header: RecordHeader::new(t, &host()),
            uuid: uuid.into(),
            os_uuid: None,
            status: Some("running".into()),
            config: json!({ "zonepath": format!("/zones/{uuid}") }),
            network_usage: json!({}),
            disk_usage: json!({}),
        })
    }

    #[tokio::test]
    async fn test_end_leaves_exact_sequential_content() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();

        let records: Vec<UsageRecord> = ["a", "b", "c"].iter().map(|u| usage(now, u)).collect();
        let summary = UsageRecord::from(Summary {
            header: RecordHeader::new(now, &host()),
            vm_count: 3,
            runtime: 7,
        });

        let writer = UsageFileWriter::open(dir.path(), now);
        for r in &records {
            writer.write(r).unwrap();
        }
        writer.write(&summary).unwrap();
        let path = writer.end().await.unwrap();

        assert_eq!(path, dir.path().join("2024-03-01T12.log"));

        let mut expected = String::from("\n");
        for r in records.iter().chain(std::iter::once(&summary)) {
            expected.push_str(&r.to_line().unwrap());
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_appends_after_truncated_record() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        let path = dir.path().join("2024-03-01T12.log");
        std::fs::write(&path, "{\"type\":\"usage\",\"uuid\":\"trunc").unwrap();

        let writer = UsageFileWriter::open(dir.path(), now);
        writer.write(&usage(now, "x")).unwrap();
        writer.end().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("trunc"));
        let parsed: UsageRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, usage(now, "x"));
    }

    #[tokio::test]
    async fn test_end_without_writes_creates_nested_dirs() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let writer = UsageFileWriter::open(&nested, now);
        assert_eq!(writer.path(), nested.join("2024-02-29T23.log").as_path());
        let path = writer.end().await.unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let path = UsageFileWriter::open(dir.path(), now).end().await.unwrap();

        let mode = std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
        // umask can only remove bits.
        assert_eq!(mode & !MODE_FILE, 0);
    }

    #[tokio::test]
    async fn test_open_failure_surfaces_at_end() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();

        let writer = UsageFileWriter::open(&blocker, now);
        // The write may or may not race the failing open; either way end() reports it.
        let _ = writer.write(&usage(now, "x"));
        let err = writer.end().await.unwrap_err();
        assert!(matches!(err, UsageError::Io { .. }), "unexpected error: {err}");
    }
}
