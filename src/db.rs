//! Persistence gateway over a bounded Postgres pool
//!
//! All SQL lives in this module. Values travel exclusively through `$n`
//! bind parameters; no query string is ever composed with user input.
//! Accessors come in two flavors: pool-executed one-shots on [`Db`] and
//! free functions over any executor so the same queries run inside a
//! transaction holding `SELECT ... FOR UPDATE` row locks.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, PgExecutor, Postgres, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Queries slower than this are logged. Overridable at startup.
static SLOW_QUERY_MS: AtomicU64 = AtomicU64::new(1000);

pub fn set_slow_query_threshold(threshold: Duration) {
    SLOW_QUERY_MS.store(threshold.as_millis() as u64, Ordering::Relaxed);
}

fn observe(label: &str, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed.as_millis() as u64 >= SLOW_QUERY_MS.load(Ordering::Relaxed) {
        warn!(query = label, elapsed_ms = elapsed.as_millis() as u64, "slow query");
    }
}

/// Connection pool handle shared across the control plane.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect with a bounded pool; the pool size is the primary
    /// backpressure mechanism for the whole service.
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        info!(max_connections, "Connected to database");
        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction. Dropping the returned handle without commit
    /// rolls back, which is what makes abandoned requests safe.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// True for Postgres serialization failures (SQLSTATE 40001), which the
/// webhook transaction retries once.
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("40001"),
        _ => false,
    }
}

/// True when `err` is a unique violation on a constraint whose name
/// contains `constraint`.
pub fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23505")
                && db.constraint().map_or(false, |c| c.contains(constraint))
        }
        _ => false,
    }
}

// ==================== Row Types ====================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub password_digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkspaceRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub engine_handle: Option<String>,
    pub runtime_state: String,
    pub proxy_credential: String,
    pub cpu_quota: f64,
    pub memory_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_subscription_id: Option<String>,
    pub state: String,
    pub plan_id: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, email, password_digest, created_at, updated_at";
const WORKSPACE_COLUMNS: &str = "id, owner_id, name, engine_handle, runtime_state, \
     proxy_credential, cpu_quota, memory_bytes, created_at, updated_at, last_started_at";
const SUBSCRIPTION_COLUMNS: &str = "id, user_id, provider_subscription_id, state, plan_id, \
     period_start, period_end, cancelled_at, created_at, updated_at";

// ==================== Users ====================

pub async fn insert_user<'e>(
    ex: impl PgExecutor<'e>,
    email: &str,
    password_digest: &str,
) -> Result<UserRecord, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, UserRecord>(&format!(
        "INSERT INTO users (email, password_digest) VALUES ($1, $2) RETURNING {USER_COLUMNS}"
    ))
    .bind(email)
    .bind(password_digest)
    .fetch_one(ex)
    .await;
    observe("users.insert", started);
    out
}

pub async fn find_user<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
) -> Result<Option<UserRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, UserRecord>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(ex)
    .await;
    observe("users.find", started);
    out
}

pub async fn find_user_by_email<'e>(
    ex: impl PgExecutor<'e>,
    email: &str,
) -> Result<Option<UserRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, UserRecord>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
    ))
    .bind(email)
    .fetch_optional(ex)
    .await;
    observe("users.find_by_email", started);
    out
}

/// Take a row lock on the user, serializing per-owner workspace creation.
pub async fn lock_user(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    let started = Instant::now();
    let row: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    observe("users.lock", started);
    Ok(row.is_some())
}

// ==================== Workspaces ====================

pub async fn insert_workspace<'e>(
    ex: impl PgExecutor<'e>,
    owner_id: Uuid,
    name: &str,
    proxy_credential: &str,
    cpu_quota: f64,
    memory_bytes: i64,
) -> Result<WorkspaceRecord, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, WorkspaceRecord>(&format!(
        "INSERT INTO workspaces (owner_id, name, proxy_credential, cpu_quota, memory_bytes) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {WORKSPACE_COLUMNS}"
    ))
    .bind(owner_id)
    .bind(name)
    .bind(proxy_credential)
    .bind(cpu_quota)
    .bind(memory_bytes)
    .fetch_one(ex)
    .await;
    observe("workspaces.insert", started);
    out
}

pub async fn find_workspace<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
) -> Result<Option<WorkspaceRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, WorkspaceRecord>(&format!(
        "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(ex)
    .await;
    observe("workspaces.find", started);
    out
}

/// Lock the workspace row; lifecycle operations on the same workspace
/// serialize on this lock.
pub async fn find_workspace_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<WorkspaceRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, WorkspaceRecord>(&format!(
        "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await;
    observe("workspaces.find_for_update", started);
    out
}

/// Constant lookup on the unique credential column; used by the proxy.
pub async fn find_workspace_by_credential<'e>(
    ex: impl PgExecutor<'e>,
    credential: &str,
) -> Result<Option<WorkspaceRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, WorkspaceRecord>(&format!(
        "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE proxy_credential = $1"
    ))
    .bind(credential)
    .fetch_optional(ex)
    .await;
    observe("workspaces.find_by_credential", started);
    out
}

pub async fn list_workspaces<'e>(
    ex: impl PgExecutor<'e>,
    owner_id: Uuid,
) -> Result<Vec<WorkspaceRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, WorkspaceRecord>(&format!(
        "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE owner_id = $1 ORDER BY created_at"
    ))
    .bind(owner_id)
    .fetch_all(ex)
    .await;
    observe("workspaces.list", started);
    out
}

pub async fn count_workspaces<'e>(
    ex: impl PgExecutor<'e>,
    owner_id: Uuid,
) -> Result<i64, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_scalar("SELECT COUNT(*) FROM workspaces WHERE owner_id = $1")
        .bind(owner_id)
        .fetch_one(ex)
        .await;
    observe("workspaces.count", started);
    out
}

pub async fn list_running_workspaces_for_user<'e>(
    ex: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<Vec<WorkspaceRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, WorkspaceRecord>(&format!(
        "SELECT {WORKSPACE_COLUMNS} FROM workspaces \
         WHERE owner_id = $1 AND runtime_state = 'running'"
    ))
    .bind(user_id)
    .fetch_all(ex)
    .await;
    observe("workspaces.list_running", started);
    out
}

pub async fn set_workspace_state<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    state: &str,
) -> Result<(), sqlx::Error> {
    let started = Instant::now();
    sqlx::query("UPDATE workspaces SET runtime_state = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(state)
        .execute(ex)
        .await?;
    observe("workspaces.set_state", started);
    Ok(())
}

pub async fn record_engine_handle<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    handle: &str,
) -> Result<(), sqlx::Error> {
    let started = Instant::now();
    sqlx::query(
        "UPDATE workspaces SET engine_handle = $2, runtime_state = 'stopped', \
         updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(handle)
    .execute(ex)
    .await?;
    observe("workspaces.record_handle", started);
    Ok(())
}

pub async fn mark_workspace_started<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    let started = Instant::now();
    sqlx::query(
        "UPDATE workspaces SET runtime_state = 'running', last_started_at = now(), \
         updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .execute(ex)
    .await?;
    observe("workspaces.mark_started", started);
    Ok(())
}

pub async fn delete_workspace<'e>(ex: impl PgExecutor<'e>, id: Uuid) -> Result<(), sqlx::Error> {
    let started = Instant::now();
    sqlx::query("DELETE FROM workspaces WHERE id = $1")
        .bind(id)
        .execute(ex)
        .await?;
    observe("workspaces.delete", started);
    Ok(())
}

// ==================== Subscriptions ====================

/// The entitlement predicate: an `active` subscription whose period has
/// not lapsed. Read-only; used by the proxy and status views. Workspace-
/// mutating transactions use [`lock_active_subscription_for_update`]
/// instead, because this plain SELECT does not synchronize with a
/// concurrent cancellation.
pub async fn user_is_entitled<'e>(
    ex: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let started = Instant::now();
    let row: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM subscriptions \
         WHERE user_id = $1 AND state = 'active' AND period_end > now() LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(ex)
    .await?;
    observe("subscriptions.entitled", started);
    Ok(row.is_some())
}

/// Entitlement gate for workspace-mutating transactions: takes a row
/// lock on the active subscription, so a webhook transaction cancelling
/// it cannot commit between this check and the caller's commit. The
/// state read here is the state at the moment of the mutation.
pub async fn lock_active_subscription_for_update(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let started = Instant::now();
    let row: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM subscriptions \
         WHERE user_id = $1 AND state = 'active' AND period_end > now() \
         LIMIT 1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    observe("subscriptions.lock_active", started);
    Ok(row.is_some())
}

pub async fn insert_subscription<'e>(
    ex: impl PgExecutor<'e>,
    user_id: Uuid,
    provider_subscription_id: &str,
    plan_id: &str,
) -> Result<SubscriptionRecord, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, SubscriptionRecord>(&format!(
        "INSERT INTO subscriptions (user_id, provider_subscription_id, plan_id) \
         VALUES ($1, $2, $3) RETURNING {SUBSCRIPTION_COLUMNS}"
    ))
    .bind(user_id)
    .bind(provider_subscription_id)
    .bind(plan_id)
    .fetch_one(ex)
    .await;
    observe("subscriptions.insert", started);
    out
}

pub async fn latest_subscription<'e>(
    ex: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<Option<SubscriptionRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, SubscriptionRecord>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(ex)
    .await;
    observe("subscriptions.latest", started);
    out
}

/// The at-most-one-non-terminal-per-user invariant is enforced against
/// this lookup at checkout time.
pub async fn find_nonterminal_subscription<'e>(
    ex: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<Option<SubscriptionRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, SubscriptionRecord>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE user_id = $1 AND state NOT IN ('cancelled', 'expired') LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(ex)
    .await;
    observe("subscriptions.find_nonterminal", started);
    out
}

/// Lock the subscription row for the duration of a webhook transaction;
/// this serializes concurrent deliveries for the same subscription.
pub async fn find_subscription_by_provider_for_update(
    conn: &mut PgConnection,
    provider_subscription_id: &str,
) -> Result<Option<SubscriptionRecord>, sqlx::Error> {
    let started = Instant::now();
    let out = sqlx::query_as::<_, SubscriptionRecord>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE provider_subscription_id = $1 FOR UPDATE"
    ))
    .bind(provider_subscription_id)
    .fetch_optional(&mut *conn)
    .await;
    observe("subscriptions.find_by_provider_for_update", started);
    out
}

/// Apply a state transition; period fields and `cancelled_at` only move
/// when a new value is supplied.
pub async fn apply_subscription_update<'e>(
    ex: impl PgExecutor<'e>,
    id: Uuid,
    state: &str,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    let started = Instant::now();
    sqlx::query(
        "UPDATE subscriptions SET state = $2, \
         period_start = COALESCE($3, period_start), \
         period_end = COALESCE($4, period_end), \
         cancelled_at = COALESCE($5, cancelled_at), \
         updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(state)
    .bind(period_start)
    .bind(period_end)
    .bind(cancelled_at)
    .execute(ex)
    .await?;
    observe("subscriptions.apply_update", started);
    Ok(())
}

// ==================== Payment Events ====================

/// Append an event to the ledger. Returns false when the provider event
/// id is already present (duplicate delivery); the table is never
/// updated or deleted.
#[allow(clippy::too_many_arguments)]
pub async fn insert_payment_event<'e>(
    ex: impl PgExecutor<'e>,
    provider_subscription_id: Option<&str>,
    provider_event_id: &str,
    event_type: &str,
    provider_payment_id: Option<&str>,
    amount_minor_units: Option<i64>,
    currency: Option<&str>,
    occurred_at: Option<DateTime<Utc>>,
    raw_payload: &serde_json::Value,
) -> Result<bool, sqlx::Error> {
    let started = Instant::now();
    let result = sqlx::query(
        "INSERT INTO payment_events \
         (subscription_id, provider_event_id, event_type, provider_payment_id, \
          amount_minor_units, currency, occurred_at, raw_payload) \
         VALUES \
         ((SELECT id FROM subscriptions WHERE provider_subscription_id = $1), \
          $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (provider_event_id) DO NOTHING",
    )
    .bind(provider_subscription_id)
    .bind(provider_event_id)
    .bind(event_type)
    .bind(provider_payment_id)
    .bind(amount_minor_units)
    .bind(currency)
    .bind(occurred_at)
    .bind(raw_payload)
    .execute(ex)
    .await?;
    observe("payment_events.insert", started);
    Ok(result.rows_affected() == 1)
}

/// Newest provider timestamp among previously recorded events for the
/// subscription, excluding the event currently being processed. Feeds
/// the latest-provider-timestamp-wins rule for period fields.
pub async fn newest_recorded_event_at<'e>(
    ex: impl PgExecutor<'e>,
    subscription_id: Uuid,
    exclude_provider_event_id: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let started = Instant::now();
    let out: Option<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT MAX(occurred_at) FROM payment_events \
         WHERE subscription_id = $1 AND provider_event_id <> $2",
    )
    .bind(subscription_id)
    .bind(exclude_provider_event_id)
    .fetch_one(ex)
    .await?;
    observe("payment_events.newest_recorded", started);
    Ok(out)
}
