//! Environment-derived configuration
//!
//! Every tunable of the control plane is a process environment variable.
//! Required secrets fail startup loudly; everything else has a default
//! suitable for local development.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Default bounded database pool size; the primary backpressure mechanism.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
/// Default scrypt work factor (log2 N).
pub const DEFAULT_HASH_COST: u8 = 14;
/// Smallest acceptable scrypt work factor.
pub const MIN_HASH_COST: u8 = 10;
/// Default per-owner workspace cap.
pub const DEFAULT_MAX_WORKSPACES_PER_USER: i64 = 3;
/// Default CPU quota for new workspaces.
pub const DEFAULT_CPU_QUOTA: f64 = 1.0;
/// Default memory limit for new workspaces (512 MiB).
pub const DEFAULT_MEMORY_BYTES: i64 = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub frontend_origin: String,

    pub database_url: String,
    pub database_max_connections: u32,
    pub slow_query_threshold: Duration,

    pub token_secret: String,
    pub token_ttl_hours: i64,
    pub hash_cost: u8,

    pub payment_api_base: String,
    pub payment_key_id: String,
    pub payment_key_secret: String,
    pub payment_webhook_secret: String,
    pub payment_plan_id: String,

    pub workspace_network: String,
    pub workspace_image: String,
    pub workspace_container_port: u16,
    pub default_cpu_quota: f64,
    pub default_memory_bytes: i64,
    pub max_workspaces_per_user: i64,
    pub stop_timeout: Duration,
    pub upstream_connect_timeout: Duration,

    pub rate_limits: RateLimitSettings,
}

/// Fixed-window limits per route group.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub auth_max: u64,
    pub auth_window: Duration,
    pub api_max: u64,
    pub api_window: Duration,
    pub lifecycle_max: u64,
    pub lifecycle_window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            auth_max: 5,
            auth_window: Duration::from_secs(15 * 60),
            api_max: 100,
            api_window: Duration::from_secs(15 * 60),
            lifecycle_max: 10,
            lifecycle_window: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let bind_addr: SocketAddr = env_or("BIND_ADDR", "0.0.0.0:8000")
            .parse()
            .context("BIND_ADDR is not a valid socket address")?;

        let hash_cost: u8 = parse_env("HASH_COST", DEFAULT_HASH_COST)?;
        if hash_cost < MIN_HASH_COST {
            bail!(
                "HASH_COST must be at least {}, got {}",
                MIN_HASH_COST,
                hash_cost
            );
        }

        let rate_limits = RateLimitSettings {
            auth_max: parse_env("RATE_AUTH_MAX", 5)?,
            auth_window: Duration::from_secs(parse_env("RATE_AUTH_WINDOW_SECS", 15 * 60)?),
            api_max: parse_env("RATE_API_MAX", 100)?,
            api_window: Duration::from_secs(parse_env("RATE_API_WINDOW_SECS", 15 * 60)?),
            lifecycle_max: parse_env("RATE_LIFECYCLE_MAX", 10)?,
            lifecycle_window: Duration::from_secs(parse_env("RATE_LIFECYCLE_WINDOW_SECS", 5 * 60)?),
        };

        Ok(Self {
            bind_addr,
            frontend_origin: env_or("FRONTEND_ORIGIN", "http://localhost:5173"),

            database_url: required("DATABASE_URL")?,
            database_max_connections: parse_env(
                "DATABASE_MAX_CONNECTIONS",
                DEFAULT_DB_MAX_CONNECTIONS,
            )?,
            slow_query_threshold: Duration::from_millis(parse_env("SLOW_QUERY_MS", 1000u64)?),

            token_secret: required("TOKEN_SECRET")?,
            token_ttl_hours: parse_env("TOKEN_TTL_HOURS", 24i64)?,
            hash_cost,

            payment_api_base: env_or("PAYMENT_API_BASE", "https://api.payments.example"),
            payment_key_id: required("PAYMENT_KEY_ID")?,
            payment_key_secret: required("PAYMENT_KEY_SECRET")?,
            payment_webhook_secret: required("PAYMENT_WEBHOOK_SECRET")?,
            payment_plan_id: required("PAYMENT_PLAN_ID")?,

            workspace_network: env_or("WORKSPACE_NETWORK", "paddock-internal"),
            workspace_image: env_or("WORKSPACE_IMAGE", "paddock/workspace:latest"),
            workspace_container_port: parse_env("WORKSPACE_CONTAINER_PORT", 8080u16)?,
            default_cpu_quota: parse_env("DEFAULT_CPU_QUOTA", DEFAULT_CPU_QUOTA)?,
            default_memory_bytes: parse_env("DEFAULT_MEMORY_BYTES", DEFAULT_MEMORY_BYTES)?,
            max_workspaces_per_user: parse_env(
                "MAX_WORKSPACES_PER_USER",
                DEFAULT_MAX_WORKSPACES_PER_USER,
            )?,
            stop_timeout: Duration::from_secs(parse_env("STOP_TIMEOUT_SECS", 30u64)?),
            upstream_connect_timeout: Duration::from_secs(parse_env(
                "UPSTREAM_CONNECT_TIMEOUT_SECS",
                5u64,
            )?),

            rate_limits,
        })
    }
}

fn required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("required environment variable {} is not set", name),
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_limits() {
        let limits = RateLimitSettings::default();
        assert_eq!(limits.auth_max, 5);
        assert_eq!(limits.auth_window, Duration::from_secs(900));
        assert_eq!(limits.api_max, 100);
        assert_eq!(limits.lifecycle_max, 10);
        assert_eq!(limits.lifecycle_window, Duration::from_secs(300));
    }

    #[test]
    fn test_required_rejects_missing() {
        assert!(required("PADDOCK_TEST_UNSET_VARIABLE").is_err());
    }
}
