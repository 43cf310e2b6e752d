//! Host identity from the `sysinfo` program.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use super::{run_command, HostIdentitySource};
use crate::error::{Result, UsageError};
use crate::record::HostIdentity;

/// Reported when sysinfo does not carry a version.
const DEFAULT_SDC_VERSION: &str = "6.5";

/// Fetches host identity by running `sysinfo` and parsing its JSON output.
#[derive(Debug, Clone)]
pub struct SysinfoIdentity {
    program: PathBuf,
    timeout: Duration,
}

impl SysinfoIdentity {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }
}

#[async_trait]
impl HostIdentitySource for SysinfoIdentity {
    async fn fetch(&self) -> Result<HostIdentity> {
        let stdout = run_command(&self.program, &[], self.timeout).await?;
        let value: Value = serde_json::from_str(&stdout).map_err(|e| {
            let reason = format!("could not parse sysinfo output: {}", e);
            UsageError::InvalidHostIdentity { reason }
        })?;

        let identity = identity_from_sysinfo(&value)?;
        info!(
            server_uuid = %identity.server_uuid,
            datacenter = %identity.datacenter_name,
            "host identity fetched"
        );
        Ok(identity)
    }
}

/// Map sysinfo's keys onto the record base fields.
pub fn identity_from_sysinfo(value: &Value) -> Result<HostIdentity> {
    let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

    let server_uuid = field("UUID").ok_or_else(|| UsageError::InvalidHostIdentity {
        reason: "sysinfo has no UUID".to_string(),
    })?;

    Ok(HostIdentity {
        sdc_version: field("SDC Version").unwrap_or_else(|| DEFAULT_SDC_VERSION.to_string()),
        server_uuid,
        datacenter_name: field("Datacenter Name").unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_mapping() {
        let sysinfo = json!({
            "UUID": "44454c4c-3200-1042-8051-c7c04f463232",
            "SDC Version": "7.0",
            "Datacenter Name": "us-west-1",
            "Hostname": "cn0"
        });
        let identity = identity_from_sysinfo(&sysinfo).unwrap();
        assert_eq!(identity.server_uuid, "44454c4c-3200-1042-8051-c7c04f463232");
        assert_eq!(identity.sdc_version, "7.0");
        assert_eq!(identity.datacenter_name, "us-west-1");
    }

    #[test]
    fn test_identity_defaults_version() {
        let identity = identity_from_sysinfo(&json!({ "UUID": "u" })).unwrap();
        assert_eq!(identity.sdc_version, DEFAULT_SDC_VERSION);
        assert_eq!(identity.datacenter_name, "");
    }

    #[test]
    fn test_identity_requires_uuid() {
        let err = identity_from_sysinfo(&json!({ "SDC Version": "7.0" })).unwrap_err();
        assert!(matches!(err, UsageError::InvalidHostIdentity { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_rejects_non_json() {
        // /bin/echo with no args prints a bare newline.
        let source = SysinfoIdentity::new(PathBuf::from("/bin/echo"), Duration::from_secs(5));
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, UsageError::InvalidHostIdentity { .. }));
    }
}
