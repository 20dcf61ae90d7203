//! Container engine adapter
//!
//! Typed wrapper over the local container daemon. Workspace containers
//! are created with hard resource limits, a reduced capability set, and
//! no published ports; they are attached only to the internal bridge
//! network shared with the control plane.

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// CPU quota base period, in microseconds.
pub const CPU_PERIOD_MICROS: i64 = 100_000;
/// Largest CPU quota a workspace may request.
pub const MAX_CPU_QUOTA: f64 = 8.0;
/// Smallest memory limit a workspace may request (128 MiB).
pub const MIN_MEMORY_BYTES: i64 = 128 * 1024 * 1024;
/// Largest memory limit a workspace may request (8 GiB).
pub const MAX_MEMORY_BYTES: i64 = 8 * 1024 * 1024 * 1024;

/// Errors from the engine adapter.
#[derive(Debug)]
pub enum EngineError {
    /// The configured workspace image is not available on the host.
    ImageMissing(String),
    /// Resource limits failed validation at the adapter boundary.
    InvalidLimits(String),
    /// The daemon rejected or failed the operation.
    Daemon(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ImageMissing(image) => write!(f, "image not available: {}", image),
            EngineError::InvalidLimits(msg) => write!(f, "invalid resource limits: {}", msg),
            EngineError::Daemon(msg) => write!(f, "container engine error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        EngineError::Daemon(err.to_string())
    }
}

/// Validate resource limits against the adapter's hard bounds.
pub fn validate_limits(cpu_quota: f64, memory_bytes: i64) -> Result<(), EngineError> {
    if !cpu_quota.is_finite() || cpu_quota <= 0.0 || cpu_quota > MAX_CPU_QUOTA {
        return Err(EngineError::InvalidLimits(format!(
            "cpu quota must be in (0, {}], got {}",
            MAX_CPU_QUOTA, cpu_quota
        )));
    }
    if !(MIN_MEMORY_BYTES..=MAX_MEMORY_BYTES).contains(&memory_bytes) {
        return Err(EngineError::InvalidLimits(format!(
            "memory must be between {} and {} bytes, got {}",
            MIN_MEMORY_BYTES, MAX_MEMORY_BYTES, memory_bytes
        )));
    }
    Ok(())
}

/// Deterministic container name for a workspace.
pub fn container_name(workspace_id: Uuid) -> String {
    format!("wsp-{}", workspace_id)
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Internal bridge network shared by all workspace containers.
    pub network: String,
    /// Image every workspace container runs.
    pub image: String,
    /// Graceful stop timeout before the daemon escalates.
    pub stop_timeout: Duration,
}

/// Adapter over the container daemon.
pub struct Engine {
    client: Docker,
    settings: EngineSettings,
}

impl Engine {
    /// Connect to the daemon via `DOCKER_HOST` or the platform socket
    /// defaults, and verify it responds.
    pub async fn connect(settings: EngineSettings) -> anyhow::Result<Self> {
        let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
            if let Some(socket) = host.strip_prefix("unix://") {
                Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
            } else if host.starts_with("tcp://") || host.starts_with("http://") {
                Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)?
            } else {
                anyhow::bail!(
                    "Invalid DOCKER_HOST '{}': expected unix:///path or tcp://host:port",
                    host
                );
            }
        } else {
            Docker::connect_with_socket_defaults()?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!("Container daemon is not responding: {}", e)
        })?;

        debug!("Connected to container daemon");
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Idempotently create the internal network. Containers on it reach
    /// each other; nothing is published to the host.
    pub async fn ensure_network(&self) -> Result<(), EngineError> {
        let name = &self.settings.network;
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(network = %name, "Internal network already exists");
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        let options = CreateNetworkOptions {
            name: name.clone(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            ..Default::default()
        };

        match self.client.create_network(options).await {
            Ok(_) => {
                info!(network = %name, "Created internal network");
                Ok(())
            }
            // Lost a creation race; the network exists now
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a container for a workspace and return its engine handle.
    ///
    /// The container gets no port bindings, a hard memory cap with swap
    /// disabled, a CPU quota over a 100ms period, capabilities reduced
    /// to NET_BIND_SERVICE, no-new-privileges, and no restart policy.
    pub async fn create_workspace_container(
        &self,
        workspace_id: Uuid,
        cpu_quota: f64,
        memory_bytes: i64,
    ) -> Result<String, EngineError> {
        validate_limits(cpu_quota, memory_bytes)?;

        let name = container_name(workspace_id);

        // A stale container with the same name would make create fail
        // with a conflict; clear it first.
        self.remove_by_handle(&name).await?;

        let host_config = HostConfig {
            network_mode: Some(self.settings.network.clone()),
            cpu_period: Some(CPU_PERIOD_MICROS),
            cpu_quota: Some((cpu_quota * CPU_PERIOD_MICROS as f64) as i64),
            memory: Some(memory_bytes),
            // memory_swap == memory disables swap entirely
            memory_swap: Some(memory_bytes),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec!["NET_BIND_SERVICE".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.settings.image.clone()),
            hostname: Some(name.clone()),
            env: Some(vec![format!("WORKSPACE_ID={}", workspace_id)]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => EngineError::ImageMissing(self.settings.image.clone()),
                other => EngineError::Daemon(other.to_string()),
            })?;

        info!(
            workspace_id = %workspace_id,
            container_id = %response.id,
            "Created workspace container"
        );
        Ok(response.id)
    }

    /// Start a container. Starting a running container succeeds.
    pub async fn start_container(&self, handle: &str) -> Result<(), EngineError> {
        match self
            .client
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container_id = %handle, "Started workspace container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = %handle, "Container was already running");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop a container gracefully; the daemon escalates after the
    /// configured timeout. Stopping a stopped or absent container
    /// succeeds.
    pub async fn stop_container(&self, handle: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: self.settings.stop_timeout.as_secs() as i64,
        };

        match self.client.stop_container(handle, Some(options)).await {
            Ok(_) => {
                info!(container_id = %handle, "Stopped workspace container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = %handle, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %handle, "Container not found");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Force-remove a container. Removing an absent container succeeds.
    pub async fn remove_container(&self, handle: &str) -> Result<(), EngineError> {
        self.remove_by_handle(handle).await
    }

    async fn remove_by_handle(&self, handle: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(handle, Some(options)).await {
            Ok(_) => {
                debug!(container_id = %handle, "Removed workspace container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                warn!(container_id = %handle, error = %e, "Failed to remove container");
                Err(e.into())
            }
        }
    }

    /// Whether the container is currently running.
    pub async fn is_running(&self, handle: &str) -> bool {
        match self
            .client
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// The container's address on the internal network, if it has one.
    pub async fn container_ip(&self, handle: &str) -> Result<Option<String>, EngineError> {
        let info = match self
            .client
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let ip = info
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(&self.settings.network))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty());

        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_limits_bounds() {
        assert!(validate_limits(1.0, 512 * 1024 * 1024).is_ok());
        assert!(validate_limits(8.0, MIN_MEMORY_BYTES).is_ok());
        assert!(validate_limits(0.5, MAX_MEMORY_BYTES).is_ok());

        assert!(validate_limits(0.0, 512 * 1024 * 1024).is_err());
        assert!(validate_limits(-1.0, 512 * 1024 * 1024).is_err());
        assert!(validate_limits(8.01, 512 * 1024 * 1024).is_err());
        assert!(validate_limits(f64::NAN, 512 * 1024 * 1024).is_err());
        assert!(validate_limits(1.0, MIN_MEMORY_BYTES - 1).is_err());
        assert!(validate_limits(1.0, MAX_MEMORY_BYTES + 1).is_err());
    }

    #[test]
    fn test_invalid_limits_error_kind() {
        let err = validate_limits(9.0, 512 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, EngineError::InvalidLimits(_)));
    }

    #[test]
    fn test_container_name_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(container_name(id), format!("wsp-{}", id));
        assert_eq!(container_name(id), container_name(id));
    }

    #[test]
    fn test_cpu_quota_scaling() {
        let quota = (1.5 * CPU_PERIOD_MICROS as f64) as i64;
        assert_eq!(quota, 150_000);
    }

    #[test]
    fn test_engine_error_display() {
        assert!(EngineError::ImageMissing("img:latest".into())
            .to_string()
            .contains("img:latest"));
        assert!(EngineError::Daemon("boom".into())
            .to_string()
            .contains("boom"));
    }
}
