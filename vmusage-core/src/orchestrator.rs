//! The usage cycle.
//!
//! Every tick asks the record source for a fresh snapshot and merges it into
//! a per-VM cache. Write ticks then flush the whole cache, plus the summary,
//! through a new [`UsageFileWriter`] and clear it. A VM that failed to report
//! on the write tick is still written with its last cached sample.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::error::{FatalSignal, Result};
use crate::gate::RunGate;
use crate::host::{HostIdentitySource, RecordSource};
use crate::observability::metrics;
use crate::record::{HostIdentity, UsageRecord, VmUsage};
use crate::scheduler::Trigger;
use crate::writer::UsageFileWriter;

/// Collects usage on every tick and persists it on write ticks.
#[derive(Clone)]
pub struct UsageService {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    source: Arc<dyn RecordSource>,
    host: OnceLock<HostIdentity>,
    loaded: Notify,
    cache: Mutex<HashMap<String, VmUsage>>,
    gate: RunGate,
    fatal: FatalSignal,
}

impl UsageService {
    /// Create the service and start fetching the host identity.
    ///
    /// Triggers are ignored until the identity is known. Failing to fetch it
    /// is fatal.
    pub fn new(
        dir: PathBuf,
        source: Arc<dyn RecordSource>,
        identity: Arc<dyn HostIdentitySource>,
        fatal: FatalSignal,
    ) -> Self {
        let service = Self::build(dir, source, fatal);

        let inner = service.inner.clone();
        tokio::spawn(async move {
            match identity.fetch().await {
                Ok(host) => {
                    info!(server_uuid = %host.server_uuid, "host identity loaded");
                    let _ = inner.host.set(host);
                    inner.loaded.notify_waiters();
                }
                Err(e) => inner.fatal.raise("usage", e),
            }
        });

        service
    }

    /// Create the service with an identity that is already known.
    pub fn with_host(
        dir: PathBuf,
        source: Arc<dyn RecordSource>,
        host: HostIdentity,
        fatal: FatalSignal,
    ) -> Self {
        let service = Self::build(dir, source, fatal);
        let _ = service.inner.host.set(host);
        service
    }

    fn build(dir: PathBuf, source: Arc<dyn RecordSource>, fatal: FatalSignal) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir,
                source,
                host: OnceLock::new(),
                loaded: Notify::new(),
                cache: Mutex::new(HashMap::new()),
                gate: RunGate::new(),
                fatal,
            }),
        }
    }

    /// The host identity, once fetched.
    pub fn host(&self) -> Option<&HostIdentity> {
        self.inner.host.get()
    }

    /// Wait until the host identity is known.
    ///
    /// Never resolves if the fetch failed; that failure is reported through
    /// the fatal signal instead.
    pub async fn ready(&self) {
        loop {
            let loaded = self.inner.loaded.notified();
            if self.inner.host.get().is_some() {
                return;
            }
            loaded.await;
        }
    }

    /// Start a cycle as of `now`.
    ///
    /// While a cycle is running, a write trigger is folded into one extra
    /// write cycle afterwards and a cache-only trigger is dropped. Returns
    /// the handle of a newly started run.
    pub fn trigger_at(&self, now: DateTime<Utc>, do_write: bool) -> Option<JoinHandle<()>> {
        if self.inner.host.get().is_none() {
            debug!("host identity not loaded yet; skipping cycle");
            return None;
        }
        if !self.inner.gate.try_start(do_write) {
            debug!(do_write, "usage cycle already running");
            return None;
        }

        let inner = self.inner.clone();
        Some(tokio::spawn(async move { inner.run(now, do_write).await }))
    }

    /// Wait for any running cycle (and its queued follow-up) to finish.
    pub async fn idle(&self) {
        self.inner.gate.idle().await
    }

    /// Whether a cycle is in flight.
    pub fn is_running(&self) -> bool {
        self.inner.gate.is_running()
    }

    /// UUIDs currently held in the cache, sorted.
    pub fn cached_vms(&self) -> Vec<String> {
        let cache = self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mut uuids: Vec<String> = cache.keys().cloned().collect();
        uuids.sort();
        uuids
    }
}

impl Trigger for UsageService {
    fn trigger(&self, tick: DateTime<Utc>, do_write: bool) -> Result<()> {
        self.trigger_at(tick, do_write);
        Ok(())
    }
}

impl Inner {
    async fn run(&self, mut now: DateTime<Utc>, mut do_write: bool) {
        loop {
            if let Err(e) = self.cycle(now, do_write).await {
                self.gate.abort();
                self.fatal.raise("usage", e);
                return;
            }

            if !self.gate.finish() {
                return;
            }
            debug!("write queued while running; cycling again");
            now = Utc::now();
            do_write = true;
        }
    }

    #[instrument(skip(self))]
    async fn cycle(&self, now: DateTime<Utc>, do_write: bool) -> Result<()> {
        let Some(host) = self.host.get() else {
            return Ok(());
        };

        let started = Instant::now();
        let snapshot = self.source.get_usage(now, host).await?;
        let observed = snapshot.records.len();

        let batch = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            for vm in snapshot.records {
                cache.insert(vm.uuid.clone(), vm);
            }
            do_write.then(|| std::mem::take(&mut *cache))
        };

        let Some(batch) = batch else {
            metrics::record_cycle(false, started.elapsed().as_secs_f64(), observed);
            debug!(vm_count = observed, "caching run complete");
            return Ok(());
        };

        let mut vms: Vec<VmUsage> = batch.into_values().collect();
        vms.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        let written = vms.len();

        let writer = UsageFileWriter::open(&self.dir, now);
        for vm in vms {
            writer.write(&UsageRecord::Usage(vm))?;
        }
        writer.write(&UsageRecord::Summary(snapshot.summary))?;
        let path = writer.end().await?;

        metrics::record_cycle(true, started.elapsed().as_secs_f64(), written);
        info!(path = %path.display(), vm_count = written, "usage written");
        Ok(())
    }
}
