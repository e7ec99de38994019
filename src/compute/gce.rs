//! Compute Engine REST v1 client.
//!
//! https://cloud.google.com/compute/docs/reference/rest/v1

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    ComputeApi, ComputeError, InstanceInfo, InstanceRef, InstanceStatus, Operation, SnapshotInfo,
};

pub const DEFAULT_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh cached tokens this long before they actually expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

pub struct GceClient {
    http: reqwest::Client,
    base_url: String,
    token: TokenSource,
}

enum TokenSource {
    Static(String),
    Metadata {
        url: String,
        cached: Mutex<Option<(String, Instant)>>,
    },
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl GceClient {
    /// Authenticate with a fixed access token.
    pub fn with_access_token(http: reqwest::Client, base_url: Option<&str>, token: String) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            token: TokenSource::Static(token),
        }
    }

    /// Authenticate as the VM's default service account, which is what you
    /// get on Cloud Run and Cloud Functions.
    pub fn with_metadata_server(http: reqwest::Client, base_url: Option<&str>) -> Self {
        Self::with_token_url(http, base_url, METADATA_TOKEN_URL.to_string())
    }

    fn with_token_url(http: reqwest::Client, base_url: Option<&str>, url: String) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            token: TokenSource::Metadata {
                url,
                cached: Mutex::new(None),
            },
        }
    }

    async fn access_token(&self) -> Result<String, ComputeError> {
        let (url, cached) = match &self.token {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata { url, cached } => (url, cached),
        };

        let still_valid = cached
            .lock()
            .as_ref()
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(token, _)| token.clone());
        if let Some(token) = still_valid {
            return Ok(token);
        }

        let response = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| ComputeError::Auth(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ComputeError::Auth(format!(
                "metadata server returned {}",
                response.status()
            )));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|err| ComputeError::Auth(err.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached.lock() = Some((token.access_token.clone(), Instant::now() + lifetime));
        debug!("got a new access token from the metadata server");

        Ok(token.access_token)
    }

    fn instance_url(&self, instance: &InstanceRef) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances/{}",
            self.base_url, instance.project, instance.zone, instance.name
        )
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ComputeError> {
        let token = self.access_token().await?;
        let response = request.bearer_auth(token).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ComputeError::Api { status, body })
    }

    async fn operation(&self, request: reqwest::RequestBuilder) -> Result<Operation, ComputeError> {
        let operation: OperationResponse = self.send(request).await?.json().await?;
        Ok(Operation {
            name: operation.name,
            status: operation.status,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceResponse {
    status: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    disks: Vec<AttachedDisk>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Deserialize)]
struct AttachedDisk {
    #[serde(default)]
    boot: bool,
    source: Option<String>,
}

#[derive(Deserialize)]
struct OperationResponse {
    name: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotList {
    #[serde(default)]
    items: Vec<SnapshotItem>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotItem {
    name: String,
    creation_timestamp: String,
}

impl InstanceResponse {
    fn into_info(self) -> Result<InstanceInfo, ComputeError> {
        let external_ip = self
            .network_interfaces
            .first()
            .and_then(|i| i.access_configs.first())
            .and_then(|c| c.nat_ip.as_deref())
            .map(|ip| {
                ip.parse::<IpAddr>()
                    .map_err(|_| ComputeError::Decode(format!("invalid natIP {ip:?}")))
            })
            .transpose()?;

        // source looks like https://.../projects/PROJECT/zones/ZONE/disks/DISK
        let boot_disk = self
            .disks
            .iter()
            .find(|d| d.boot)
            .and_then(|d| d.source.as_deref())
            .and_then(|source| source.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Ok(InstanceInfo {
            status: InstanceStatus::parse(&self.status),
            external_ip,
            boot_disk,
        })
    }
}

#[async_trait]
impl ComputeApi for GceClient {
    async fn get_instance(&self, instance: &InstanceRef) -> Result<InstanceInfo, ComputeError> {
        let response: InstanceResponse = self
            .send(self.http.get(self.instance_url(instance)))
            .await?
            .json()
            .await?;
        response.into_info()
    }

    async fn start_instance(&self, instance: &InstanceRef) -> Result<Operation, ComputeError> {
        let url = format!("{}/start", self.instance_url(instance));
        self.operation(self.http.post(url)).await
    }

    async fn stop_instance(&self, instance: &InstanceRef) -> Result<Operation, ComputeError> {
        let url = format!("{}/stop", self.instance_url(instance));
        self.operation(self.http.post(url)).await
    }

    async fn create_snapshot(
        &self,
        instance: &InstanceRef,
        disk: &str,
        snapshot_name: &str,
        description: &str,
    ) -> Result<Operation, ComputeError> {
        let url = format!(
            "{}/projects/{}/zones/{}/disks/{disk}/createSnapshot",
            self.base_url, instance.project, instance.zone
        );
        let body = json!({
            "name": snapshot_name,
            "description": description,
        });
        self.operation(self.http.post(url).json(&body)).await
    }

    async fn list_snapshots(
        &self,
        project: &str,
        prefix: &str,
    ) -> Result<Vec<SnapshotInfo>, ComputeError> {
        let url = format!("{}/projects/{project}/global/snapshots", self.base_url);

        let mut snapshots = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.http.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: SnapshotList = self.send(request).await?.json().await?;

            for item in page.items {
                if !item.name.starts_with(prefix) {
                    continue;
                }
                match DateTime::parse_from_rfc3339(&item.creation_timestamp) {
                    Ok(created_at) => snapshots.push(SnapshotInfo {
                        name: item.name,
                        created_at,
                    }),
                    Err(err) => warn!(
                        "couldn't parse creationTimestamp {:?} of snapshot {}: {err}",
                        item.creation_timestamp, item.name
                    ),
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(snapshots)
    }

    async fn delete_snapshot(&self, project: &str, name: &str) -> Result<Operation, ComputeError> {
        let url = format!("{}/projects/{project}/global/snapshots/{name}", self.base_url);
        self.operation(self.http.delete(url)).await
    }
}
