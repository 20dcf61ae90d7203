//! Subscription state machine and payment webhook processing
//!
//! Webhook events from the payment provider are the sole authoritative
//! source of subscription-state transitions. Every inbound event is
//! verified against a keyed MAC of the raw body, appended to the
//! append-only ledger (which doubles as the idempotency key store), and
//! applied under a row lock so concurrent deliveries for the same
//! subscription serialize. Terminal states are sticky.

use crate::db::{self, Db};
use crate::error::{ApiError, ErrorKind};
use crate::redact::redacted;
use crate::workspace::WorkspaceManager;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw webhook body.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

// ==================== States and Transitions ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::PastDue => "past_due",
            SubscriptionState::Cancelled => "cancelled",
            SubscriptionState::Expired => "expired",
        }
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Cancelled | SubscriptionState::Expired)
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriptionState::Pending),
            "active" => Ok(SubscriptionState::Active),
            "past_due" => Ok(SubscriptionState::PastDue),
            "cancelled" => Ok(SubscriptionState::Cancelled),
            "expired" => Ok(SubscriptionState::Expired),
            _ => Err(()),
        }
    }
}

/// The transition graph. Cancellation is handled separately because it
/// overrides the graph from any non-terminal state.
pub fn transition_allowed(from: SubscriptionState, to: SubscriptionState) -> bool {
    use SubscriptionState::*;
    matches!(
        (from, to),
        (Pending, Active)
            | (Active, PastDue)
            | (Active, Cancelled)
            | (Active, Expired)
            | (PastDue, Active)
            | (PastDue, Cancelled)
            | (PastDue, Expired)
    )
}

/// What an event type asks the state machine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Activate,
    Charge,
    Complete,
    Cancel,
    Hold,
    Resume,
    RecordOnly,
}

pub fn classify(event_type: &str) -> EventAction {
    match event_type {
        "subscription.activated" => EventAction::Activate,
        "subscription.charged" => EventAction::Charge,
        "subscription.completed" => EventAction::Complete,
        "subscription.cancelled" => EventAction::Cancel,
        "subscription.pending" | "subscription.halted" | "subscription.paused" => {
            EventAction::Hold
        }
        "subscription.resumed" => EventAction::Resume,
        // payment.failed and anything unknown only land in the ledger
        _ => EventAction::RecordOnly,
    }
}

/// The changes an event may make to a subscription row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub new_state: Option<SubscriptionState>,
    pub refresh_periods: bool,
    pub set_cancelled_at: bool,
}

impl TransitionPlan {
    const NOOP: TransitionPlan = TransitionPlan {
        new_state: None,
        refresh_periods: false,
        set_cancelled_at: false,
    };

    pub fn is_noop(&self) -> bool {
        self.new_state.is_none() && !self.refresh_periods && !self.set_cancelled_at
    }
}

/// Decide what an action does given the current state. Disallowed
/// transitions degrade to a no-op; the event is still recorded.
pub fn plan_transition(current: SubscriptionState, action: EventAction) -> TransitionPlan {
    use SubscriptionState::*;
    match action {
        EventAction::Activate if transition_allowed(current, Active) => TransitionPlan {
            new_state: Some(Active),
            refresh_periods: true,
            set_cancelled_at: false,
        },
        // Charges never change state; in a terminal state they do not
        // touch the period fields either.
        EventAction::Charge if !current.is_terminal() => TransitionPlan {
            new_state: None,
            refresh_periods: true,
            set_cancelled_at: false,
        },
        EventAction::Complete if transition_allowed(current, Expired) => TransitionPlan {
            new_state: Some(Expired),
            refresh_periods: false,
            set_cancelled_at: false,
        },
        // Cancellation takes priority over the graph: any non-terminal
        // state may cancel.
        EventAction::Cancel if !current.is_terminal() => TransitionPlan {
            new_state: Some(Cancelled),
            refresh_periods: false,
            set_cancelled_at: true,
        },
        EventAction::Hold if current == Active => TransitionPlan {
            new_state: Some(PastDue),
            refresh_periods: false,
            set_cancelled_at: false,
        },
        EventAction::Resume if current == PastDue => TransitionPlan {
            new_state: Some(Active),
            refresh_periods: false,
            set_cancelled_at: false,
        },
        _ => TransitionPlan::NOOP,
    }
}

/// Latest-provider-timestamp-wins: period fields only move when the
/// incoming event is not older than every previously recorded event for
/// the subscription. Events without a timestamp apply in arrival order.
pub fn period_refresh_allowed(
    event_at: Option<DateTime<Utc>>,
    newest_recorded: Option<DateTime<Utc>>,
) -> bool {
    match (event_at, newest_recorded) {
        (Some(event), Some(newest)) => event >= newest,
        _ => true,
    }
}

// ==================== Webhook Verification and Parsing ====================

/// Verify the hex HMAC-SHA256 of the raw body. Constant-time.
pub fn verify_signature(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    expected
        .as_bytes()
        .ct_eq(signature_hex.trim().as_bytes())
        .into()
}

/// A verified webhook body from the payment provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl ProviderEvent {
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.and_then(unix_to_datetime)
    }
}

fn unix_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

// ==================== Payment Provider Client ====================

/// Subscription created at the provider during checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub short_url: String,
}

/// Thin client for the payment provider's REST API.
pub struct PaymentClient {
    http: reqwest::Client,
    base: String,
    key_id: String,
    key_secret: String,
}

impl PaymentClient {
    pub fn new(base: &str, key_id: &str, key_secret: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client with static configuration"),
            base: base.trim_end_matches('/').to_string(),
            key_id: key_id.to_string(),
            key_secret: key_secret.to_string(),
        }
    }

    pub async fn create_subscription(
        &self,
        plan_id: &str,
    ) -> Result<ProviderSubscription, ApiError> {
        let url = format!("{}/v1/subscriptions", self.base);
        let body = json!({ "plan_id": plan_id, "customer_notify": true });

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(provider_down)?;

        if !response.status().is_success() {
            let status = response.status();
            error!(%status, "Provider rejected subscription creation");
            return Err(ApiError::new(
                ErrorKind::ProviderDown,
                "payment provider rejected the request",
            ));
        }

        response.json().await.map_err(provider_down)
    }

    pub async fn cancel_subscription(&self, provider_id: &str) -> Result<(), ApiError> {
        let url = format!("{}/v1/subscriptions/{}/cancel", self.base, provider_id);

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(provider_down)?;

        if !response.status().is_success() {
            let status = response.status();
            error!(%status, "Provider rejected subscription cancellation");
            return Err(ApiError::new(
                ErrorKind::ProviderDown,
                "payment provider rejected the request",
            ));
        }

        Ok(())
    }
}

fn provider_down(err: reqwest::Error) -> ApiError {
    // reqwest errors can embed URLs with credentials; log only the kind
    error!(timeout = err.is_timeout(), connect = err.is_connect(), "Provider request failed");
    ApiError::new(ErrorKind::ProviderDown, "payment provider unreachable")
}

// ==================== Billing Service ====================

/// Outcome reported to the provider in the webhook response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// A transition or period refresh was applied.
    Processed,
    /// Duplicate delivery; ledger already contains the event.
    Duplicate,
    /// Recorded in the ledger with no subscription change.
    Recorded,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Recorded => "recorded",
        }
    }
}

pub struct Billing {
    db: Db,
    workspaces: Arc<WorkspaceManager>,
    client: PaymentClient,
    webhook_secret: String,
    plan_id: String,
}

impl Billing {
    pub fn new(
        db: Db,
        workspaces: Arc<WorkspaceManager>,
        client: PaymentClient,
        webhook_secret: String,
        plan_id: String,
    ) -> Self {
        Self {
            db,
            workspaces,
            client,
            webhook_secret,
            plan_id,
        }
    }

    /// Start a checkout: create the subscription at the provider and a
    /// `pending` row locally. At most one non-terminal subscription may
    /// exist per user.
    pub async fn checkout(&self, user_id: Uuid) -> Result<(Uuid, String), ApiError> {
        if db::find_nonterminal_subscription(self.db.pool(), user_id)
            .await?
            .is_some()
        {
            return Err(ApiError::conflict(
                "an active or pending subscription already exists",
            ));
        }

        let provider = self.client.create_subscription(&self.plan_id).await?;

        let record = db::insert_subscription(self.db.pool(), user_id, &provider.id, &self.plan_id)
            .await
            .map_err(|e| {
                if db::is_unique_violation(&e, "provider_subscription_id") {
                    ApiError::conflict("subscription already registered")
                } else {
                    e.into()
                }
            })?;

        info!(user_id = %user_id, subscription_id = %record.id, "Checkout started");
        Ok((record.id, provider.short_url))
    }

    /// Current subscription view for the dashboard.
    pub async fn subscription_status(&self, user_id: Uuid) -> Result<serde_json::Value, ApiError> {
        let sub = db::latest_subscription(self.db.pool(), user_id)
            .await?
            .ok_or_else(|| ApiError::not_found("subscription"))?;

        let now = Utc::now();
        let is_active = sub.state == SubscriptionState::Active.as_str()
            && sub.period_end.map_or(false, |end| end > now);
        let days_remaining = if is_active {
            sub.period_end
                .map(|end| (end - now).num_days().max(0))
                .unwrap_or(0)
        } else {
            0
        };

        Ok(json!({
            "state": sub.state,
            "plan": sub.plan_id,
            "period_start": sub.period_start,
            "period_end": sub.period_end,
            "is_active": is_active,
            "days_remaining": days_remaining,
        }))
    }

    /// Request cancellation at the provider. The local state changes
    /// only when the provider's webhook confirms it.
    pub async fn cancel(&self, user_id: Uuid) -> Result<Option<DateTime<Utc>>, ApiError> {
        let sub = db::find_nonterminal_subscription(self.db.pool(), user_id)
            .await?
            .ok_or_else(|| ApiError::not_found("subscription"))?;

        let provider_id = sub
            .provider_subscription_id
            .as_deref()
            .ok_or_else(|| ApiError::conflict("subscription has no provider reference"))?;

        self.client.cancel_subscription(provider_id).await?;

        info!(user_id = %user_id, subscription_id = %sub.id, "Cancellation requested");
        Ok(sub.period_end)
    }

    /// Process an inbound webhook request per the verification,
    /// idempotency and transition rules. Side effects run after commit.
    pub async fn process_webhook(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, ApiError> {
        let signature = signature.ok_or_else(ApiError::auth_failed)?;
        if !verify_signature(&self.webhook_secret, raw_body, signature) {
            warn!("Webhook signature verification failed");
            return Err(ApiError::auth_failed());
        }

        let payload: serde_json::Value = serde_json::from_slice(raw_body)
            .map_err(|e| ApiError::validation(format!("malformed webhook body: {}", e)))?;
        let event: ProviderEvent = serde_json::from_value(payload.clone())
            .map_err(|e| ApiError::validation(format!("malformed webhook event: {}", e)))?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            payload = %redacted(payload.clone()),
            "Webhook received"
        );

        // One retry on serialization failure, then surface the error so
        // the provider redelivers.
        let mut attempt = 0;
        let (outcome, suspend_user) = loop {
            match self.process_once(&event, &payload).await {
                Ok(done) => break done,
                Err(e) if db::is_serialization_failure(&e) && attempt == 0 => {
                    warn!(event_id = %event.id, "Serialization failure, retrying webhook transaction");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Terminal transitions fan out container stops outside the
        // transaction; failures are logged and do not fail the webhook.
        if let Some(user_id) = suspend_user {
            let workspaces = Arc::clone(&self.workspaces);
            tokio::spawn(async move {
                workspaces.suspend_all_for_user(user_id).await;
            });
        }

        Ok(outcome)
    }

    async fn process_once(
        &self,
        event: &ProviderEvent,
        payload: &serde_json::Value,
    ) -> Result<(WebhookOutcome, Option<Uuid>), sqlx::Error> {
        let mut tx = self.db.begin().await?;

        let inserted = db::insert_payment_event(
            &mut *tx,
            event.data.subscription_id.as_deref(),
            &event.id,
            &event.event_type,
            event.data.payment_id.as_deref(),
            event.data.amount,
            event.data.currency.as_deref(),
            event.occurred_at(),
            payload,
        )
        .await?;

        if !inserted {
            tx.commit().await?;
            debug!(event_id = %event.id, "Duplicate webhook event");
            return Ok((WebhookOutcome::Duplicate, None));
        }

        let provider_sub_id = match event.data.subscription_id.as_deref() {
            Some(id) => id,
            None => {
                info!(event_id = %event.id, "Event without subscription reference recorded");
                tx.commit().await?;
                return Ok((WebhookOutcome::Recorded, None));
            }
        };

        let sub = match db::find_subscription_by_provider_for_update(&mut tx, provider_sub_id)
            .await?
        {
            Some(sub) => sub,
            None => {
                info!(event_id = %event.id, "Event for unknown subscription recorded");
                tx.commit().await?;
                return Ok((WebhookOutcome::Recorded, None));
            }
        };

        let current: SubscriptionState = match sub.state.parse() {
            Ok(state) => state,
            Err(()) => {
                error!(subscription_id = %sub.id, state = %sub.state, "Unparseable subscription state");
                tx.commit().await?;
                return Ok((WebhookOutcome::Recorded, None));
            }
        };

        let plan = plan_transition(current, classify(&event.event_type));
        if plan.is_noop() {
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                state = %current,
                "Transition not applicable, event recorded"
            );
            tx.commit().await?;
            return Ok((WebhookOutcome::Recorded, None));
        }

        let refresh = plan.refresh_periods
            && period_refresh_allowed(
                event.occurred_at(),
                db::newest_recorded_event_at(&mut *tx, sub.id, &event.id).await?,
            );

        let new_state = plan.new_state.unwrap_or(current);
        let (period_start, period_end) = if refresh {
            (
                event.data.period_start.and_then(unix_to_datetime),
                event.data.period_end.and_then(unix_to_datetime),
            )
        } else {
            (None, None)
        };
        let cancelled_at = if plan.set_cancelled_at { Some(Utc::now()) } else { None };

        db::apply_subscription_update(
            &mut *tx,
            sub.id,
            new_state.as_str(),
            period_start,
            period_end,
            cancelled_at,
        )
        .await?;

        tx.commit().await?;

        info!(
            subscription_id = %sub.id,
            from = %current,
            to = %new_state,
            event_type = %event.event_type,
            "Subscription updated"
        );

        let became_terminal = new_state.is_terminal() && new_state != current;
        Ok((
            WebhookOutcome::Processed,
            became_terminal.then_some(sub.user_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionState::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature_roundtrip() {
        let payload = br#"{"id":"evt_1","type":"subscription.activated"}"#;
        let sig = sign("whsec", payload);
        assert!(verify_signature("whsec", payload, &sig));
        assert!(!verify_signature("other", payload, &sig));
        assert!(!verify_signature("whsec", payload, "deadbeef"));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let payload = br#"{"id":"evt_1","amount":100}"#.to_vec();
        let sig = sign("whsec", &payload);
        let mut tampered = payload.clone();
        tampered[15] ^= 0x01;
        assert!(!verify_signature("whsec", &tampered, &sig));
    }

    #[test]
    fn test_transition_graph() {
        assert!(transition_allowed(Pending, Active));
        assert!(transition_allowed(Active, PastDue));
        assert!(transition_allowed(Active, Cancelled));
        assert!(transition_allowed(Active, Expired));
        assert!(transition_allowed(PastDue, Active));
        assert!(transition_allowed(PastDue, Expired));

        assert!(!transition_allowed(Pending, Expired));
        assert!(!transition_allowed(Cancelled, Active));
        assert!(!transition_allowed(Expired, Active));
        assert!(!transition_allowed(Active, Pending));
    }

    #[test]
    fn test_classify_event_types() {
        assert_eq!(classify("subscription.activated"), EventAction::Activate);
        assert_eq!(classify("subscription.charged"), EventAction::Charge);
        assert_eq!(classify("subscription.completed"), EventAction::Complete);
        assert_eq!(classify("subscription.cancelled"), EventAction::Cancel);
        assert_eq!(classify("subscription.halted"), EventAction::Hold);
        assert_eq!(classify("subscription.paused"), EventAction::Hold);
        assert_eq!(classify("subscription.resumed"), EventAction::Resume);
        assert_eq!(classify("payment.failed"), EventAction::RecordOnly);
        assert_eq!(classify("totally.unknown"), EventAction::RecordOnly);
    }

    #[test]
    fn test_activation_only_from_pending() {
        let plan = plan_transition(Pending, EventAction::Activate);
        assert_eq!(plan.new_state, Some(Active));
        assert!(plan.refresh_periods);

        assert!(plan_transition(Active, EventAction::Activate).is_noop());
        assert!(plan_transition(Cancelled, EventAction::Activate).is_noop());
    }

    #[test]
    fn test_cancel_takes_priority_from_any_nonterminal() {
        for state in [Pending, Active, PastDue] {
            let plan = plan_transition(state, EventAction::Cancel);
            assert_eq!(plan.new_state, Some(Cancelled));
            assert!(plan.set_cancelled_at);
        }
        assert!(plan_transition(Cancelled, EventAction::Cancel).is_noop());
        assert!(plan_transition(Expired, EventAction::Cancel).is_noop());
    }

    #[test]
    fn test_charge_refreshes_periods_without_state_change() {
        let plan = plan_transition(Active, EventAction::Charge);
        assert_eq!(plan.new_state, None);
        assert!(plan.refresh_periods);

        // Terminal stickiness extends to period fields
        assert!(plan_transition(Cancelled, EventAction::Charge).is_noop());
        assert!(plan_transition(Expired, EventAction::Charge).is_noop());
    }

    #[test]
    fn test_hold_and_resume() {
        assert_eq!(
            plan_transition(Active, EventAction::Hold).new_state,
            Some(PastDue)
        );
        assert!(plan_transition(Pending, EventAction::Hold).is_noop());
        assert_eq!(
            plan_transition(PastDue, EventAction::Resume).new_state,
            Some(Active)
        );
        assert!(plan_transition(Active, EventAction::Resume).is_noop());
    }

    #[test]
    fn test_terminal_states_never_leave() {
        for terminal in [Cancelled, Expired] {
            for action in [
                EventAction::Activate,
                EventAction::Charge,
                EventAction::Complete,
                EventAction::Cancel,
                EventAction::Hold,
                EventAction::Resume,
            ] {
                assert!(
                    plan_transition(terminal, action).is_noop(),
                    "{:?} must stay terminal under {:?}",
                    terminal,
                    action
                );
            }
        }
    }

    #[test]
    fn test_period_refresh_ordering() {
        let older = unix_to_datetime(1_700_000_000);
        let newer = unix_to_datetime(1_700_100_000);

        assert!(period_refresh_allowed(newer, older));
        assert!(period_refresh_allowed(newer, newer));
        assert!(!period_refresh_allowed(older, newer));
        assert!(period_refresh_allowed(None, newer));
        assert!(period_refresh_allowed(newer, None));
    }

    #[test]
    fn test_event_parsing() {
        let raw = serde_json::json!({
            "id": "evt_123",
            "type": "subscription.charged",
            "created_at": 1_722_550_000,
            "data": {
                "subscription_id": "psub_9",
                "period_start": 1_722_550_000,
                "period_end": 1_725_228_400,
                "payment_id": "pay_1",
                "amount": 4900,
                "currency": "USD",
            },
        });
        let event: ProviderEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, "subscription.charged");
        assert_eq!(event.data.subscription_id.as_deref(), Some("psub_9"));
        assert!(event.occurred_at().is_some());
    }

    #[test]
    fn test_event_parsing_tolerates_sparse_data() {
        let raw = serde_json::json!({ "id": "evt_1", "type": "payment.failed" });
        let event: ProviderEvent = serde_json::from_value(raw).unwrap();
        assert!(event.data.subscription_id.is_none());
        assert!(event.occurred_at().is_none());
    }
}
