//! Workspace lifecycle manager
//!
//! State machine over the workspace record, independent of the actual
//! container runtime state. Every lifecycle operation runs inside a
//! transaction holding a row lock on the workspace, so concurrent
//! operations on the same workspace serialize; the entitlement gate
//! locks the active subscription row in the same transaction, so it
//! reads the subscription state at the moment of the mutation rather
//! than a pre-check a concurrent cancellation could invalidate.

use crate::credentials::generate_proxy_credential;
use crate::db::{self, Db, WorkspaceRecord};
use crate::engine::{self, Engine, EngineError};
use crate::error::{ApiError, ErrorKind};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Persisted workspace runtime states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Stopped,
    Creating,
    Running,
    Error,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Stopped => "stopped",
            RuntimeState::Creating => "creating",
            RuntimeState::Running => "running",
            RuntimeState::Error => "error",
        }
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RuntimeState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(RuntimeState::Stopped),
            "creating" => Ok(RuntimeState::Creating),
            "running" => Ok(RuntimeState::Running),
            "error" => Ok(RuntimeState::Error),
            _ => Err(()),
        }
    }
}

impl WorkspaceRecord {
    /// Parsed runtime state; unknown values read as `error`.
    pub fn state(&self) -> RuntimeState {
        self.runtime_state.parse().unwrap_or(RuntimeState::Error)
    }
}

/// Validate a workspace name: 1-100 chars of letters, digits, spaces,
/// dashes and underscores, not blank.
pub fn validate_name(name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::validation("workspace name must not be blank"));
    }
    if name.chars().count() > 100 {
        return Err(ApiError::validation(
            "workspace name must be at most 100 characters",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_')
    {
        return Err(ApiError::validation(
            "workspace name may only contain letters, digits, spaces, dashes and underscores",
        ));
    }
    Ok(())
}

/// Parse a memory limit string ("512m", "2g", "1048576") to bytes.
pub fn parse_memory_limit(limit: &str) -> Result<i64, ApiError> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        (limit.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        (limit.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        (limit.trim_end_matches("kb").trim_end_matches('k'), 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| ApiError::validation(format!("invalid memory limit: {}", limit)))?;
    if !num.is_finite() || num <= 0.0 {
        return Err(ApiError::validation(format!("invalid memory limit: {}", limit)));
    }

    Ok((num * multiplier as f64) as i64)
}

fn limits_error(err: EngineError) -> ApiError {
    match err {
        EngineError::InvalidLimits(msg) => ApiError::validation(msg),
        other => other.into(),
    }
}

/// Manages workspace records and their backing containers.
pub struct WorkspaceManager {
    db: Db,
    engine: Arc<Engine>,
    max_per_owner: i64,
}

impl WorkspaceManager {
    pub fn new(db: Db, engine: Arc<Engine>, max_per_owner: i64) -> Self {
        Self {
            db,
            engine,
            max_per_owner,
        }
    }

    /// Create a workspace record in `stopped` with a fresh proxy
    /// credential. Requires an active entitlement and a free slot under
    /// the per-owner cap.
    pub async fn create(
        &self,
        owner_id: Uuid,
        name: &str,
        cpu_quota: f64,
        memory_bytes: i64,
    ) -> Result<WorkspaceRecord, ApiError> {
        validate_name(name)?;
        engine::validate_limits(cpu_quota, memory_bytes).map_err(limits_error)?;

        let credential = generate_proxy_credential();

        let mut tx = self.db.begin().await?;

        // The user row lock serializes creation per owner so the cap
        // cannot be raced past.
        if !db::lock_user(&mut tx, owner_id).await? {
            return Err(ApiError::auth_failed());
        }
        if !db::lock_active_subscription_for_update(&mut tx, owner_id).await? {
            return Err(ApiError::unentitled());
        }

        let count = db::count_workspaces(&mut *tx, owner_id).await?;
        if count >= self.max_per_owner {
            return Err(ApiError::new(
                ErrorKind::LimitReached,
                format!("workspace limit reached (max {})", self.max_per_owner),
            ));
        }

        let workspace = db::insert_workspace(
            &mut *tx,
            owner_id,
            name,
            &credential,
            cpu_quota,
            memory_bytes,
        )
        .await
        .map_err(|e| {
            if db::is_unique_violation(&e, "owner_name") {
                ApiError::conflict("a workspace with this name already exists")
            } else {
                e.into()
            }
        })?;

        tx.commit().await?;

        info!(workspace_id = %workspace.id, owner_id = %owner_id, "Created workspace");
        Ok(workspace)
    }

    /// Start a workspace, creating its container first if it has none.
    /// Starting a running workspace is a no-op success.
    pub async fn start(&self, owner_id: Uuid, id: Uuid) -> Result<WorkspaceRecord, ApiError> {
        let mut tx = self.db.begin().await?;

        let workspace = db::find_workspace_for_update(&mut tx, id)
            .await?
            .filter(|ws| ws.owner_id == owner_id)
            .ok_or_else(|| ApiError::not_found("workspace"))?;

        if !db::lock_active_subscription_for_update(&mut tx, owner_id).await? {
            return Err(ApiError::unentitled());
        }

        if workspace.state() == RuntimeState::Running {
            tx.commit().await?;
            return Ok(workspace);
        }

        let handle = match workspace.engine_handle.clone() {
            Some(handle) => handle,
            None => {
                db::set_workspace_state(&mut *tx, id, RuntimeState::Creating.as_str()).await?;
                match self
                    .engine
                    .create_workspace_container(id, workspace.cpu_quota, workspace.memory_bytes)
                    .await
                {
                    Ok(handle) => {
                        db::record_engine_handle(&mut *tx, id, &handle).await?;
                        handle
                    }
                    Err(e) => {
                        error!(workspace_id = %id, error = %e, "Container creation failed");
                        db::set_workspace_state(&mut *tx, id, RuntimeState::Error.as_str())
                            .await?;
                        tx.commit().await?;
                        return Err(e.into());
                    }
                }
            }
        };

        if let Err(e) = self.engine.start_container(&handle).await {
            error!(workspace_id = %id, error = %e, "Container start failed");
            db::set_workspace_state(&mut *tx, id, RuntimeState::Error.as_str()).await?;
            tx.commit().await?;
            return Err(e.into());
        }

        db::mark_workspace_started(&mut *tx, id).await?;
        tx.commit().await?;

        info!(workspace_id = %id, "Workspace running");
        self.fetch(id).await
    }

    /// Stop a workspace's container gracefully. Stopping an already
    /// stopped workspace is a no-op success.
    pub async fn stop(&self, owner_id: Uuid, id: Uuid) -> Result<WorkspaceRecord, ApiError> {
        let mut tx = self.db.begin().await?;

        let workspace = db::find_workspace_for_update(&mut tx, id)
            .await?
            .filter(|ws| ws.owner_id == owner_id)
            .ok_or_else(|| ApiError::not_found("workspace"))?;

        if !db::lock_active_subscription_for_update(&mut tx, owner_id).await? {
            return Err(ApiError::unentitled());
        }

        if let Some(handle) = &workspace.engine_handle {
            if let Err(e) = self.engine.stop_container(handle).await {
                error!(workspace_id = %id, error = %e, "Container stop failed");
                db::set_workspace_state(&mut *tx, id, RuntimeState::Error.as_str()).await?;
                tx.commit().await?;
                return Err(e.into());
            }
        }

        db::set_workspace_state(&mut *tx, id, RuntimeState::Stopped.as_str()).await?;
        tx.commit().await?;

        info!(workspace_id = %id, "Workspace stopped");
        self.fetch(id).await
    }

    /// Delete a workspace and force-remove its container. Succeeds even
    /// if the container is already gone.
    pub async fn delete(&self, owner_id: Uuid, id: Uuid) -> Result<(), ApiError> {
        let mut tx = self.db.begin().await?;

        let workspace = db::find_workspace_for_update(&mut tx, id)
            .await?
            .filter(|ws| ws.owner_id == owner_id)
            .ok_or_else(|| ApiError::not_found("workspace"))?;

        if let Some(handle) = &workspace.engine_handle {
            // A daemon failure here aborts the delete so no container is
            // orphaned; removal of an absent container is a success.
            self.engine.remove_container(handle).await?;
        }

        db::delete_workspace(&mut *tx, id).await?;
        tx.commit().await?;

        info!(workspace_id = %id, "Deleted workspace");
        Ok(())
    }

    /// Stop every running workspace of a user. Used by the terminal
    /// subscription transitions; skips the entitlement gate and never
    /// fails the caller.
    pub async fn suspend_all_for_user(&self, user_id: Uuid) {
        let running = match db::list_running_workspaces_for_user(self.db.pool(), user_id).await {
            Ok(list) => list,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to list workspaces for suspension");
                return;
            }
        };

        for workspace in running {
            if let Err(e) = self.suspend_one(workspace.id).await {
                warn!(
                    workspace_id = %workspace.id,
                    error = %e,
                    "Failed to suspend workspace"
                );
            }
        }
    }

    async fn suspend_one(&self, id: Uuid) -> Result<(), ApiError> {
        let mut tx = self.db.begin().await?;

        let workspace = match db::find_workspace_for_update(&mut tx, id).await? {
            Some(ws) if ws.state() == RuntimeState::Running => ws,
            _ => return Ok(()),
        };

        if let Some(handle) = &workspace.engine_handle {
            self.engine.stop_container(handle).await?;
        }

        db::set_workspace_state(&mut *tx, id, RuntimeState::Stopped.as_str()).await?;
        tx.commit().await?;

        info!(workspace_id = %id, "Workspace suspended");
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<WorkspaceRecord, ApiError> {
        db::find_workspace(self.db.pool(), id)
            .await?
            .ok_or_else(|| ApiError::not_found("workspace"))
    }
}
