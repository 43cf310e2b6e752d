//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Usage cycle metrics
    describe_counter!(
        "vmusage_cycles_total",
        "Usage collection cycles run (by write: true, false)"
    );
    describe_histogram!(
        "vmusage_cycle_duration_seconds",
        "Time taken by the record source to enumerate VM usage"
    );
    describe_gauge!("vmusage_vm_count", "VMs reported by the most recent usage cycle");

    // Writer metrics
    describe_counter!(
        "vmusage_records_written_total",
        "Usage records durably written to hourly logs"
    );

    // Compaction metrics
    describe_counter!("vmusage_files_compacted_total", "Hourly logs replaced by gzip archives");
    describe_counter!(
        "vmusage_compaction_failures_total",
        "Compaction attempts that left the original log in place"
    );

    // Scheduler metrics
    describe_counter!("vmusage_scheduler_ticks_total", "Scheduler ticks (by write: true, false)");
}

pub fn record_cycle(do_write: bool, duration_secs: f64, vm_count: usize) {
    counter!("vmusage_cycles_total", "write" => do_write.to_string()).increment(1);
    histogram!("vmusage_cycle_duration_seconds").record(duration_secs);
    gauge!("vmusage_vm_count").set(vm_count as f64);
}

pub fn record_records_written(count: u64) {
    counter!("vmusage_records_written_total").increment(count);
}

pub fn record_compacted() {
    counter!("vmusage_files_compacted_total").increment(1);
}

pub fn record_compaction_failure() {
    counter!("vmusage_compaction_failures_total").increment(1);
}

pub fn record_tick(write: bool) {
    counter!("vmusage_scheduler_ticks_total", "write" => write.to_string()).increment(1);
}
