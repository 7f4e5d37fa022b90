//! Seams to the compute fleet: provisioning hosts and launching agents on them.
//!
//! Only the contracts live here. Concrete clients (cloud APIs, remote
//! shells) implement [`Provisioner`] and [`RemoteLauncher`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::job::JobPayload;
use crate::types::{Error, Result};

/// Opaque provider handle for a provisioned host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostHandle(pub String);

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Building,
    Active,
    Error,
    Deleted,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create(&self, name: &str, image: &str, flavor: &str) -> Result<HostHandle>;

    /// Network address once assigned.
    async fn address(&self, handle: &HostHandle) -> Result<Option<String>>;

    async fn status(&self, handle: &HostHandle) -> Result<HostStatus>;

    async fn close(&self, handle: &HostHandle) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteLauncher: Send + Sync {
    /// Start `payload` on `host`; `false` when the host refused it.
    async fn submit(&self, host: &str, payload: &JobPayload) -> Result<bool>;

    async fn kill(&self, host: &str, pid: u32) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub name: String,
    pub image: String,
    pub flavor: String,
    /// Command that starts an agent on the new host.
    pub payload: JobPayload,
    pub poll_attempts: usize,
    pub poll_interval: Duration,
}

impl BootstrapRequest {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        flavor: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            flavor: flavor.into(),
            payload,
            poll_attempts: 30,
            poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrappedHost {
    pub handle: HostHandle,
    pub address: String,
}

/// Provision a host, wait for its address and launch an agent on it.
///
/// The host is closed again if any step after creation fails.
pub async fn bootstrap_host(
    provisioner: &dyn Provisioner,
    launcher: &dyn RemoteLauncher,
    request: &BootstrapRequest,
) -> Result<BootstrappedHost> {
    let handle = provisioner
        .create(&request.name, &request.image, &request.flavor)
        .await?;
    tracing::info!(host = %handle, name = %request.name, "host_created");

    match launch(provisioner, launcher, request, &handle).await {
        Ok(address) => Ok(BootstrappedHost { handle, address }),
        Err(e) => {
            tracing::warn!("host_bootstrap_failed: host={}, error={}", handle, e);
            if let Err(close) = provisioner.close(&handle).await {
                tracing::error!("host_close_failed: host={}, error={}", handle, close);
            }
            Err(e)
        }
    }
}

async fn launch(
    provisioner: &dyn Provisioner,
    launcher: &dyn RemoteLauncher,
    request: &BootstrapRequest,
    handle: &HostHandle,
) -> Result<String> {
    let address = wait_for_address(provisioner, request, handle).await?;
    if !launcher.submit(&address, &request.payload).await? {
        return Err(Error::provision(format!(
            "host {} at {} refused the agent",
            handle, address
        )));
    }
    tracing::info!(host = %handle, address = %address, "agent_launched");
    Ok(address)
}

async fn wait_for_address(
    provisioner: &dyn Provisioner,
    request: &BootstrapRequest,
    handle: &HostHandle,
) -> Result<String> {
    for attempt in 0..request.poll_attempts {
        if let Some(address) = provisioner.address(handle).await? {
            return Ok(address);
        }
        match provisioner.status(handle).await? {
            HostStatus::Error | HostStatus::Deleted => {
                return Err(Error::provision(format!("host {} failed to build", handle)));
            }
            HostStatus::Building | HostStatus::Active => {}
        }
        tracing::debug!(host = %handle, attempt, "host_address_pending");
        tokio::time::sleep(request.poll_interval).await;
    }
    Err(Error::provision(format!(
        "host {} had no address after {} polls",
        handle, request.poll_attempts
    )))
}
