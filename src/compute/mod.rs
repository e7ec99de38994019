//! The cloud side of things: looking up, starting and stopping the VM, and
//! managing snapshots of its disk.

pub mod gce;

use std::{fmt, net::IpAddr};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use thiserror::Error;

pub use gce::GceClient;

/// Which VM we're managing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Suspending,
    Suspended,
    Terminated,
    Other(String),
}

impl InstanceStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "PROVISIONING" => Self::Provisioning,
            "STAGING" => Self::Staging,
            "RUNNING" => Self::Running,
            "STOPPING" => Self::Stopping,
            "SUSPENDING" => Self::Suspending,
            "SUSPENDED" => Self::Suspended,
            "TERMINATED" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Staging => "STAGING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Suspending => "SUSPENDING",
            Self::Suspended => "SUSPENDED",
            Self::Terminated => "TERMINATED",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub status: InstanceStatus,
    pub external_ip: Option<IpAddr>,
    /// Name of the boot disk (not the full resource URL).
    pub boot_disk: Option<String>,
}

/// A long-running operation started by a mutating call. We don't wait for
/// these to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_at: DateTime<FixedOffset>,
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("API returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("couldn't get an access token: {0}")]
    Auth(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_instance(&self, instance: &InstanceRef) -> Result<InstanceInfo, ComputeError>;
    async fn start_instance(&self, instance: &InstanceRef) -> Result<Operation, ComputeError>;
    async fn stop_instance(&self, instance: &InstanceRef) -> Result<Operation, ComputeError>;

    /// Snapshot a zonal disk in the instance's zone.
    async fn create_snapshot(
        &self,
        instance: &InstanceRef,
        disk: &str,
        snapshot_name: &str,
        description: &str,
    ) -> Result<Operation, ComputeError>;

    /// Every snapshot in the project whose name starts with `prefix`, in no
    /// particular order.
    async fn list_snapshots(
        &self,
        project: &str,
        prefix: &str,
    ) -> Result<Vec<SnapshotInfo>, ComputeError>;

    async fn delete_snapshot(&self, project: &str, name: &str) -> Result<Operation, ComputeError>;
}

/// `<prefix><YYYYMMDD-HHMMSS>` in UTC.
pub fn snapshot_name(prefix: &str, now: DateTime<chrono::Utc>) -> String {
    format!("{prefix}{}", now.format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_status_roundtrip() {
        assert_eq!(InstanceStatus::parse("RUNNING"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::parse("TERMINATED"), InstanceStatus::Terminated);
        let other = InstanceStatus::parse("REPAIRING");
        assert_eq!(other, InstanceStatus::Other("REPAIRING".to_string()));
        assert_eq!(other.to_string(), "REPAIRING");
    }

    #[test]
    fn test_snapshot_name() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 5).unwrap();
        assert_eq!(
            snapshot_name("minecraft-server-snapshot-", now),
            "minecraft-server-snapshot-20240115-100005"
        );
    }
}
