//! `vmusage get-usage` command
//!
//! Runs the same collaborators the daemon uses, once, without touching the
//! usage logs.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::info;
use vmusage_core::host::{
    CommandRecordSource, HostIdentitySource, RecordSource, SysinfoIdentity,
};
use vmusage_core::{Config, UsageRecord, VmUsage};

#[derive(Tabled)]
struct UsageRow {
    #[tabled(rename = "UUID")]
    uuid: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "OS UUID")]
    os_uuid: String,
}

/// Collect usage once and print it.
pub async fn get_usage(config: &Config, uuid: Option<&str>, table: bool) -> Result<()> {
    let identity = SysinfoIdentity::new(config.sysinfo_command.clone(), config.command_timeout());
    let host = identity.fetch().await.context("Failed to fetch host identity")?;

    let source: Arc<dyn RecordSource> = Arc::new(CommandRecordSource::new(
        config.collector_command.clone(),
        config.collector_args.clone(),
        config.command_timeout(),
    ));
    let snapshot = source.get_usage(Utc::now(), &host).await.context("Failed to collect usage")?;
    info!(
        vm_count = snapshot.summary.vm_count,
        runtime_ms = snapshot.summary.runtime,
        "summary"
    );

    let vms = select_vms(snapshot.records, uuid);
    if table {
        print_table(vms);
        return Ok(());
    }

    for vm in vms {
        print!("{}", UsageRecord::Usage(vm).to_line()?);
    }
    Ok(())
}

fn select_vms(vms: Vec<VmUsage>, uuid: Option<&str>) -> Vec<VmUsage> {
    match uuid {
        Some(uuid) => vms.into_iter().filter(|vm| vm.uuid == uuid).collect(),
        None => vms,
    }
}

fn print_table(vms: Vec<VmUsage>) {
    if vms.is_empty() {
        println!("No VMs found");
        return;
    }

    let rows: Vec<UsageRow> = vms
        .into_iter()
        .map(|vm| UsageRow {
            uuid: vm.uuid,
            status: vm.status.unwrap_or_else(|| "-".to_string()),
            os_uuid: vm.os_uuid.unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{}", table);
}
