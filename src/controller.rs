//! Stops the server when nobody is playing on it.

use std::{fmt, net::IpAddr, sync::Arc};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::{
    compute::{self, ComputeApi, ComputeError, InstanceRef},
    config::{Config, ConfigError},
    notify::{Event, Notifier},
    query::{PlayerQuery, QueryTarget},
};

/// What a trigger (HTTP request or CLI run) reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub success: bool,
    pub message: String,
}

impl Report {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    pub fn config_error(err: &ConfigError) -> Self {
        Self::error(format!("Configuration error: {err}"))
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Players(u32),
    /// The query failed, so we have no idea.
    Unknown,
}

pub struct IdleShutdown {
    compute: Arc<dyn ComputeApi>,
    query: Arc<dyn PlayerQuery>,
    notifier: Arc<dyn Notifier>,
    config: Arc<Config>,
}

impl IdleShutdown {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        query: Arc<dyn PlayerQuery>,
        notifier: Arc<dyn Notifier>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            compute,
            query,
            notifier,
            config,
        }
    }

    /// Look at the server once and stop it if it's empty.
    ///
    /// A failed query is reported as a success on purpose, since schedulers
    /// retry on errors and retrying won't make the server answer.
    pub async fn check(&self) -> Report {
        let instance = match self.config.instance() {
            Ok(instance) => instance,
            Err(err) => {
                error!("{err}");
                return Report::config_error(&err);
            }
        };

        let ip = match self.compute.get_instance(&instance).await {
            Ok(info) => info.external_ip,
            Err(err) => {
                error!("couldn't get instance {instance}: {err}");
                None
            }
        };
        let Some(ip) = ip else {
            warn!("{instance} has no external IP");
            return Report::error("No external IP found or API error");
        };

        match self.occupancy(ip).await {
            Occupancy::Unknown => {
                info!("couldn't get the player count, leaving {instance} running");
                Report::ok("Player count: unknown (query failed)")
            }
            Occupancy::Players(0) => {
                info!("nobody is on {instance}, shutting it down");
                self.shut_down(&instance).await
            }
            Occupancy::Players(count) => {
                info!("{count} players on {instance}");
                Report::ok(format!("Player count: {count}"))
            }
        }
    }

    /// Query the server, retrying up to `query.attempts` times.
    pub async fn occupancy(&self, ip: IpAddr) -> Occupancy {
        let target = QueryTarget::new(ip.to_string())
            .with_port(self.config.query.port)
            .with_timeout(self.config.query_timeout());

        for attempt in 1..=self.config.query.attempts {
            match self.query.player_count(&target).await {
                Ok(count) => return Occupancy::Players(count),
                Err(err) => warn!(
                    "query attempt {attempt}/{} failed ({}): {err}",
                    self.config.query.attempts,
                    err.kind()
                ),
            }
        }
        Occupancy::Unknown
    }

    /// Snapshot, stop, notify. Only failing to stop is fatal.
    async fn shut_down(&self, instance: &InstanceRef) -> Report {
        match self.snapshot(instance).await {
            Ok(name) => info!("started snapshot {name}"),
            Err(err) => error!("couldn't snapshot {instance}, stopping it anyway: {err}"),
        }

        match self.compute.stop_instance(instance).await {
            Ok(operation) => info!("stopping {instance} (operation {})", operation.name),
            Err(err) => {
                error!("couldn't stop {instance}: {err}");
                return Report::error("Player count: 0, but failed to stop instance.");
            }
        }

        let event = Event::VmStopped {
            instance: instance.name.clone(),
        };
        if let Err(err) = self.notifier.notify(&event).await {
            error!("couldn't send stop notification: {err}");
        }

        Report::ok("Player count: 0 (instance stopped)")
    }

    async fn snapshot(&self, instance: &InstanceRef) -> Result<String, ComputeError> {
        // look the disk up again, it could've been swapped since the last call
        let info = self.compute.get_instance(instance).await?;
        let Some(disk) = info.boot_disk else {
            return Err(ComputeError::Decode(format!("{instance} has no boot disk")));
        };
        snapshot_disk(
            self.compute.as_ref(),
            instance,
            &disk,
            &self.config.snapshot_prefix,
            "before idle shutdown",
        )
        .await
    }
}

/// Start a snapshot of `disk` named with the configured prefix and the current
/// time. Returns the snapshot name.
pub async fn snapshot_disk(
    compute: &dyn ComputeApi,
    instance: &InstanceRef,
    disk: &str,
    prefix: &str,
    reason: &str,
) -> Result<String, ComputeError> {
    let now = Utc::now();
    let name = compute::snapshot_name(prefix, now);
    let description = format!(
        "Snapshot of {disk} taken {reason} at {}",
        now.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let operation = compute
        .create_snapshot(instance, disk, &name, &description)
        .await?;
    info!("snapshot {name} of {disk} started (operation {})", operation.name);
    Ok(name)
}
