//! Compaction of closed hourly logs into gzip archives.
//!
//! A log is closed once its hour bucket is strictly before the bucket of
//! "now"; the usage writer only ever appends to the current bucket, so the two
//! never touch the same file.
//!
//! Each file is replaced with this sequence:
//!
//! 1. compress into a hidden temp file in the same directory and `fsync` it
//! 2. rename the temp file to `<name>.gz`
//! 3. `fsync` the directory so the rename itself is durable
//! 4. unlink the original
//!
//! A crash at any point leaves either the original alone, both files (the
//! next pass verifies the archive and removes the original), or the archive
//! alone.

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::bucket::{self, hour_bucket, HourBucket};
use crate::error::{FatalSignal, Result, UsageError};
use crate::gate::RunGate;
use crate::observability::metrics;
use crate::scheduler::Trigger;
use crate::writer::MODE_FILE;

/// What compacting one file did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GzipOutcome {
    /// The log was compressed and removed.
    Compressed { bytes_in: u64, bytes_out: u64 },
    /// A complete archive already existed; only the original was removed.
    RemovedOriginal,
}

/// Result of one pass over the log directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub compacted: usize,
    pub recovered: usize,
    pub skipped: usize,
    /// Closed logs left in place after a recoverable failure.
    pub failed: usize,
}

/// Compacts closed hourly logs, one pass at a time.
#[derive(Clone)]
pub struct CompactionService {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    gate: RunGate,
    fatal: FatalSignal,
}

impl CompactionService {
    pub fn new(dir: PathBuf, fatal: FatalSignal) -> Self {
        Self { inner: Arc::new(Inner { dir, gate: RunGate::new(), fatal }) }
    }

    /// Start a compaction pass as of `now`.
    ///
    /// Only write ticks compact. A write tick that arrives during a pass is
    /// folded into one extra pass afterwards. Returns the handle of a newly
    /// started run.
    pub fn trigger_at(&self, now: DateTime<Utc>, do_write: bool) -> Option<JoinHandle<()>> {
        if !do_write {
            return None;
        }
        if !self.inner.gate.try_start(true) {
            debug!("compaction already running; queued another pass");
            return None;
        }

        let inner = self.inner.clone();
        Some(tokio::spawn(async move { inner.run(now).await }))
    }

    /// Wait for any in-flight pass (and its queued follow-up) to finish.
    pub async fn idle(&self) {
        self.inner.gate.idle().await
    }
}

impl Trigger for CompactionService {
    fn trigger(&self, tick: DateTime<Utc>, do_write: bool) -> Result<()> {
        self.trigger_at(tick, do_write);
        Ok(())
    }
}

impl Inner {
    async fn run(&self, mut now: DateTime<Utc>) {
        loop {
            match compact_pass(&self.dir, now).await {
                Ok(report) => {
                    debug!(?report, "compaction pass complete");
                }
                Err(e) if e.is_fatal() => {
                    self.gate.abort();
                    self.fatal.raise("compaction", e);
                    return;
                }
                Err(e) => {
                    metrics::record_compaction_failure();
                    error!(error = %e, "compaction pass aborted; will retry on the next pass");
                }
            }

            if !self.gate.finish() {
                return;
            }
            debug!("queued, running compaction again");
            now = Utc::now();
        }
    }
}

/// Compact every closed log in `dir`, oldest first, one file at a time.
///
/// A file that fails recoverably stays uncompressed and is retried on the
/// next pass; the pass moves on to the next file. A durability failure ends
/// the pass.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub async fn compact_pass(dir: &Path, now: DateTime<Utc>) -> Result<CompactionReport> {
    let current = hour_bucket(now);
    let mut report = CompactionReport::default();

    for name in list_names(dir).await? {
        if !is_closed(&name, current) {
            trace!(filename = %name, "should not compact file");
            report.skipped += 1;
            continue;
        }

        info!(filename = %name, "compacting usage log");
        match safe_gzip(dir.join(&name)).await {
            Ok(GzipOutcome::Compressed { bytes_in, bytes_out }) => {
                debug!(filename = %name, bytes_in, bytes_out, "usage log compressed");
                metrics::record_compacted();
                report.compacted += 1;
            }
            Ok(GzipOutcome::RemovedOriginal) => report.recovered += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                metrics::record_compaction_failure();
                warn!(filename = %name, error = %e, "compaction failed; will retry next pass");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Whether `name` is an hourly log strictly older than the `current` bucket.
pub fn is_closed(name: &str, current: HourBucket) -> bool {
    matches!(HourBucket::parse_file_name(name), Some(b) if b < current)
}

async fn list_names(dir: &Path) -> Result<Vec<String>> {
    let unreadable = |e: io::Error| UsageError::Compaction {
        path: dir.to_path_buf(),
        reason: format!("could not list directory: {}", e),
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(unreadable)?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Replace `path` with `path.gz` without ever losing the data.
///
/// Compression runs on a blocking worker thread.
pub async fn safe_gzip(path: PathBuf) -> Result<GzipOutcome> {
    tokio::task::spawn_blocking(move || gzip_file(&path)).await.map_err(UsageError::internal)?
}

fn gzip_file(path: &Path) -> Result<GzipOutcome> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| compaction(path, "path has no file name"))?;
    let gz_path = path.with_file_name(bucket::gz_name(&name));
    let tmp_path = bucket::temp_gz_path(path);

    if gz_path.exists() {
        match verify_gzip(&gz_path) {
            Ok(()) => {
                info!(filename = %gz_path.display(), "archive exists already; unlinking original");
                remove_original(path)?;
                return Ok(GzipOutcome::RemovedOriginal);
            }
            Err(e) => {
                warn!(
                    filename = %gz_path.display(),
                    error = %e,
                    "existing archive is damaged; compressing again"
                );
                fs::remove_file(&gz_path).map_err(|e| compaction(&gz_path, &e.to_string()))?;
            }
        }
    }

    let (bytes_in, bytes_out) = match compress_to(path, &tmp_path) {
        Ok(sizes) => sizes,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };

    fs::rename(&tmp_path, &gz_path).map_err(|e| UsageError::Durability {
        path: gz_path.clone(),
        operation: "rename",
        source: e,
    })?;
    if let Some(parent) = gz_path.parent() {
        sync_directory(parent)?;
    }
    remove_original(path)?;

    Ok(GzipOutcome::Compressed { bytes_in, bytes_out })
}

/// Compress `src` into `tmp` and fsync the result.
fn compress_to(src: &Path, tmp: &Path) -> Result<(u64, u64)> {
    let failed = |e: io::Error| compaction(src, &e.to_string());

    let mut input = File::open(src).map_err(failed)?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(MODE_FILE);
    }
    let output = options.open(tmp).map_err(failed)?;
    debug!(filename = %tmp.display(), "tmpfile opened");

    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    let bytes_in = io::copy(&mut input, &mut encoder).map_err(failed)?;
    let output =
        encoder.finish().map_err(failed)?.into_inner().map_err(|e| failed(e.into_error()))?;

    output.sync_all().map_err(failed)?;
    let bytes_out = output.metadata().map_err(failed)?.len();
    Ok((bytes_in, bytes_out))
}

/// Decode an archive to the end so the gzip trailer (CRC and length) is checked.
fn verify_gzip(path: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty archive"));
    }
    io::copy(&mut MultiGzDecoder::new(file), &mut io::sink())?;
    Ok(())
}

fn sync_directory(dir: &Path) -> Result<()> {
    File::open(dir).and_then(|d| d.sync_all()).map_err(|e| UsageError::Durability {
        path: dir.to_path_buf(),
        operation: "directory fsync",
        source: e,
    })
}

fn remove_original(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(compaction(path, &format!("could not unlink original: {}", e))),
    }
}

fn compaction(path: &Path, reason: &str) -> UsageError {
    UsageError::Compaction { path: path.to_path_buf(), reason: reason.to_string() }
}
