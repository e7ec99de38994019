use std::{env, fs, io, net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{compute::InstanceRef, query};

pub const DEFAULT_SNAPSHOT_PREFIX: &str = "minecraft-server-snapshot-";
pub const DEFAULT_RETENTION_COUNT: usize = 7;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("couldn't read config file: {0}")]
    Io(#[from] io::Error),
    #[error("couldn't parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The GCP project the server's VM lives in.
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,

    /// Snapshots made by this program are named this followed by a
    /// timestamp, and only snapshots starting with it are ever deleted.
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
    /// How many of the newest snapshots to keep. Defaults to 7.
    #[serde(default = "default_retention_count")]
    pub snapshot_retention_count: usize,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub discord: DiscordConfig,

    /// Where to POST when the idle check stops the server. Usually the
    /// `/webhook/vm-stopped` endpoint of the bot. Nothing is sent if unset.
    #[serde(default)]
    pub notification_webhook_url: Option<String>,
    /// If set, webhook and interaction requests must carry it in the
    /// `X-Webhook-Secret` header, and outgoing notifications send it too.
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// How long to wait after starting the VM before asking for its IP.
    #[serde(default = "default_start_ip_wait_secs")]
    pub start_ip_wait_secs: u64,

    /// A fixed OAuth access token for the Compute Engine API. When unset, one
    /// is requested from the GCE metadata server.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub compute_base_url: Option<String>,

    /// Also write logs to a daily rotated file in this directory.
    #[serde(default)]
    pub logging_dir: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    #[serde(default = "default_query_port")]
    pub port: u16,
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    /// How many times the idle check queries before giving up. Defaults to 1.
    #[serde(default = "default_query_attempts")]
    pub attempts: u32,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub channel_id: Option<u64>,
    /// Needed to register slash commands. They aren't registered if unset.
    #[serde(default)]
    pub application_id: Option<u64>,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

fn default_snapshot_prefix() -> String {
    DEFAULT_SNAPSHOT_PREFIX.to_string()
}
fn default_retention_count() -> usize {
    DEFAULT_RETENTION_COUNT
}
fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}
fn default_start_ip_wait_secs() -> u64 {
    15
}
fn default_query_port() -> u16 {
    query::DEFAULT_PORT
}
fn default_query_timeout_secs() -> u64 {
    query::DEFAULT_TIMEOUT.as_secs()
}
fn default_query_attempts() -> u32 {
    1
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            port: default_query_port(),
            timeout_secs: default_query_timeout_secs(),
            attempts: default_query_attempts(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: None,
            zone: None,
            instance_name: None,
            snapshot_prefix: default_snapshot_prefix(),
            snapshot_retention_count: default_retention_count(),
            query: QueryConfig::default(),
            discord: DiscordConfig::default(),
            notification_webhook_url: None,
            webhook_secret: None,
            listen_addr: default_listen_addr(),
            start_ip_wait_secs: default_start_ip_wait_secs(),
            access_token: None,
            compute_base_url: None,
            logging_dir: None,
        }
    }
}

impl Config {
    /// Read the config file (if it exists) and apply environment overrides on
    /// top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_toml(&fs::read_to_string(path)?)?
        } else {
            Self::default()
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Override settings with environment variables. Takes a lookup function
    /// so tests don't have to touch the real environment.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GCP_PROJECT").or_else(|| get("GOOGLE_CLOUD_PROJECT")) {
            self.project_id = Some(v);
        }
        if let Some(v) = get("GCE_ZONE") {
            self.zone = Some(v);
        }
        if let Some(v) = get("GCE_INSTANCE_NAME") {
            self.instance_name = Some(v);
        }
        if let Some(v) = get("SNAPSHOT_PREFIX") {
            self.snapshot_prefix = v;
        }
        if let Some(v) = get("SNAPSHOT_RETENTION_COUNT") {
            self.snapshot_retention_count = parse_env("SNAPSHOT_RETENTION_COUNT", &v)?;
        }
        if let Some(v) = get("QUERY_TIMEOUT_SECS") {
            self.query.timeout_secs = parse_env("QUERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DISCORD_BOT_TOKEN") {
            self.discord.bot_token = Some(v);
        }
        if let Some(v) = get("DISCORD_CHANNEL_ID") {
            self.discord.channel_id = Some(parse_env("DISCORD_CHANNEL_ID", &v)?);
        }
        if let Some(v) = get("DISCORD_APPLICATION_ID") {
            self.discord.application_id = Some(parse_env("DISCORD_APPLICATION_ID", &v)?);
        }
        if let Some(v) = get("NOTIFICATION_WEBHOOK_URL") {
            self.notification_webhook_url = Some(v);
        }
        if let Some(v) = get("WEBHOOK_SECRET") {
            self.webhook_secret = Some(v);
        }
        if let Some(v) = get("LISTEN_ADDR") {
            self.listen_addr = parse_env("LISTEN_ADDR", &v)?;
        }
        if let Some(v) = get("GCE_ACCESS_TOKEN") {
            self.access_token = Some(v);
        }

        Ok(())
    }

    /// Check the values that are always required to be sane. Missing
    /// settings are only reported when something needs them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "query.timeout_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.query.attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "query.attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.snapshot_prefix.is_empty() {
            // an empty prefix would make the sweeper consider every snapshot
            // in the project
            return Err(ConfigError::Invalid {
                key: "snapshot_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn project_id(&self) -> Result<&str, ConfigError> {
        required(&self.project_id, "project_id")
    }

    pub fn instance(&self) -> Result<InstanceRef, ConfigError> {
        Ok(InstanceRef {
            project: self.project_id()?.to_string(),
            zone: required(&self.zone, "zone")?.to_string(),
            name: required(&self.instance_name, "instance_name")?.to_string(),
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query.timeout_secs)
    }

    pub fn discord_bot_token(&self) -> Result<&str, ConfigError> {
        required(&self.discord.bot_token, "discord.bot_token")
    }

    pub fn discord_channel_id(&self) -> Result<u64, ConfigError> {
        match self.discord.channel_id {
            Some(id) if id != 0 => Ok(id),
            _ => Err(ConfigError::Missing("discord.channel_id")),
        }
    }
}

fn required<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parse_env<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        key,
        reason: err.to_string(),
    })
}
