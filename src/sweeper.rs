//! Deletes old snapshots so only the newest few are kept.

use std::sync::Arc;

use tracing::{error, info};

use crate::{
    compute::{ComputeApi, SnapshotInfo},
    config::Config,
    controller::Report,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepResult {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

pub struct RetentionSweeper {
    compute: Arc<dyn ComputeApi>,
    config: Arc<Config>,
}

impl RetentionSweeper {
    pub fn new(compute: Arc<dyn ComputeApi>, config: Arc<Config>) -> Self {
        Self { compute, config }
    }

    pub async fn sweep(&self) -> Report {
        let project = match self.config.project_id() {
            Ok(project) => project,
            Err(err) => {
                error!("{err}");
                return Report::config_error(&err);
            }
        };

        match self.sweep_project(project).await {
            Ok(result) => {
                info!(
                    "snapshot cleanup done: kept {}, deleted {}, failed {}",
                    result.kept.len(),
                    result.deleted.len(),
                    result.failed.len()
                );
                Report::ok("Snapshot cleanup process completed successfully.")
            }
            Err(err) => {
                error!("snapshot cleanup failed: {err}");
                Report::error(format!("Error during snapshot cleanup: {err}"))
            }
        }
    }

    pub async fn sweep_project(
        &self,
        project: &str,
    ) -> Result<SweepResult, crate::compute::ComputeError> {
        let prefix = &self.config.snapshot_prefix;
        let retention = self.config.snapshot_retention_count;
        info!("cleaning up snapshots in {project} (prefix {prefix:?}, keeping {retention})");

        let snapshots = self.compute.list_snapshots(project, prefix).await?;
        let (keep, delete) = partition_by_age(snapshots, prefix, retention);

        for (i, snapshot) in keep.iter().enumerate() {
            info!("  [{}] {} ({})", i + 1, snapshot.name, snapshot.created_at);
        }

        let mut result = SweepResult {
            kept: keep.into_iter().map(|s| s.name).collect(),
            ..Default::default()
        };
        if delete.is_empty() {
            info!("{} snapshots, nothing to delete", result.kept.len());
            return Ok(result);
        }

        info!("deleting {} snapshots over the retention count", delete.len());
        for snapshot in delete {
            match self.compute.delete_snapshot(project, &snapshot.name).await {
                Ok(operation) => {
                    info!("  - deleting {} (operation {})", snapshot.name, operation.name);
                    result.deleted.push(snapshot.name);
                }
                Err(err) => {
                    // keep going, the rest might still work
                    error!("  - couldn't delete {}: {err}", snapshot.name);
                    result.failed.push(snapshot.name);
                }
            }
        }

        Ok(result)
    }
}

/// Split snapshots into the `retention` newest ones and the rest, newest
/// first. Anything not starting with `prefix` is dropped entirely.
pub fn partition_by_age(
    snapshots: Vec<SnapshotInfo>,
    prefix: &str,
    retention: usize,
) -> (Vec<SnapshotInfo>, Vec<SnapshotInfo>) {
    let mut snapshots = snapshots
        .into_iter()
        .filter(|s| s.name.starts_with(prefix))
        .collect::<Vec<_>>();
    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let delete = snapshots.split_off(retention.min(snapshots.len()));
    (snapshots, delete)
}
