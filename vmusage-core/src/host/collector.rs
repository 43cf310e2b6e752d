//! Usage records from an external collector program.
//!
//! The collector is invoked with the sample time (ISO-8601) as its last
//! argument and prints one JSON object per VM per line:
//!
//! ```text
//! {"uuid":"...","os_uuid":"...","status":"running","config":{...},
//!  "network_usage":{...},"disk_usage":{...}}
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{run_command, RecordSource, UsageSnapshot};
use crate::error::Result;
use crate::record::{format_timestamp, HostIdentity, RecordHeader, Summary, VmUsage};

#[derive(Debug, Deserialize)]
struct CollectedVm {
    uuid: String,
    #[serde(default)]
    os_uuid: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    network_usage: Value,
    #[serde(default)]
    disk_usage: Value,
}

/// Record source backed by a collector program.
#[derive(Debug, Clone)]
pub struct CommandRecordSource {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRecordSource {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self { program, args, timeout }
    }
}

#[async_trait]
impl RecordSource for CommandRecordSource {
    async fn get_usage(&self, now: DateTime<Utc>, host: &HostIdentity) -> Result<UsageSnapshot> {
        let start = Instant::now();

        let mut args = self.args.clone();
        args.push(format_timestamp(&now));
        let stdout = run_command(&self.program, &args, self.timeout).await?;

        let records = parse_collector_output(&stdout, now, host);
        let summary = Summary {
            header: RecordHeader::new(now, host),
            vm_count: records.len() as u64,
            runtime: start.elapsed().as_millis() as u64,
        };
        info!(
            vm_count = summary.vm_count,
            runtime_ms = summary.runtime,
            "enumerated virtual machines"
        );

        Ok(UsageSnapshot { records, summary })
    }
}

/// Turn collector output into usage records.
///
/// A line that does not describe a VM is that VM's problem, not the cycle's:
/// it is logged and left out.
pub fn parse_collector_output(
    stdout: &str,
    now: DateTime<Utc>,
    host: &HostIdentity,
) -> Vec<VmUsage> {
    stdout
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(index, line)| match serde_json::from_str::<CollectedVm>(line) {
            Ok(vm) => Some(VmUsage {
                header: RecordHeader::new(now, host),
                uuid: vm.uuid,
                os_uuid: vm.os_uuid,
                status: vm.status,
                config: vm.config,
                network_usage: vm.network_usage,
                disk_usage: vm.disk_usage,
            }),
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping unusable VM entry from collector");
                None
            }
        })
        .collect()
}
