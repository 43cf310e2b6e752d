//! Host collaborators: where identity and usage data come from.
//!
//! The core only sees the two traits below. The concrete implementations in
//! this module shell out to host programs, each call capped by a timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, UsageError};
use crate::record::{HostIdentity, Summary, VmUsage};

mod collector;
mod sysinfo;

pub use collector::{parse_collector_output, CommandRecordSource};
pub use sysinfo::{identity_from_sysinfo, SysinfoIdentity};

/// Output of one usage enumeration.
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    pub records: Vec<VmUsage>,
    pub summary: Summary,
}

/// Produces per-VM usage records for an instant.
///
/// Called every few seconds; implementations must not keep state the core
/// can observe. Per-VM problems should drop that VM from the result rather
/// than fail the call.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn get_usage(&self, now: DateTime<Utc>, host: &HostIdentity) -> Result<UsageSnapshot>;
}

/// Looks up the identity of this host. Called once at startup.
#[async_trait]
pub trait HostIdentitySource: Send + Sync {
    async fn fetch(&self) -> Result<HostIdentity>;
}

/// Run a host program and return its stdout.
///
/// The child is killed if it outlives `limit`. A non-zero exit or a signal is
/// an error carrying the program's stderr.
pub async fn run_command(program: &Path, args: &[String], limit: Duration) -> Result<String> {
    let command = program.display().to_string();
    debug!(command = %command, ?args, "running host command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = timeout(limit, cmd.output())
        .await
        .map_err(|_| UsageError::CommandTimeout { command: command.clone(), timeout: limit })?
        .map_err(|e| UsageError::CommandFailed {
            command: command.clone(),
            status: "could not execute".to_string(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(UsageError::CommandFailed {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (PathBuf::from("/bin/sh"), vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_run_command_stdout() {
        let (program, args) = sh("echo hello");
        let out = run_command(&program, &args, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_run_command_nonzero_exit() {
        let (program, args) = sh("echo broken >&2; exit 3");
        let err = run_command(&program, &args, Duration::from_secs(5)).await.unwrap_err();
        match err {
            UsageError::CommandFailed { status, stderr, .. } => {
                assert!(status.contains('3'), "status was {status}");
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let (program, args) = sh("sleep 5");
        let err = run_command(&program, &args, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, UsageError::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let err = run_command(Path::new("/nonexistent/vmusage-probe"), &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, UsageError::CommandFailed { .. }));
    }
}
