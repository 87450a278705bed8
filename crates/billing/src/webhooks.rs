//! Provider webhook handling
//!
//! Payloads are stored as opaque bytes. Only two correlation fields are
//! extracted for deduplication: the event id and the resource (agreement) id.
//!
//! The event id is the dedup key. The resource id only stands in for it when
//! a payload carries no event id, since one agreement receives many distinct
//! events over its life.
//!
//! Ordering per delivery: check the ledger for an already-processed event
//! with the same key, store the event unprocessed, apply the side effect,
//! stamp `processed_at`. A crash before the stamp leads to a redelivery that
//! re-runs an idempotent side effect, never to a lost one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::agreements::{AgreementLink, AgreementStatus};
use crate::error::BillingResult;
use crate::pending::ChangeStatus;
use crate::store::BillingStore;

/// Ledger row for one inbound notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_id: Option<String>,
    pub resource_id: Option<String>,
    pub payload: Vec<u8>,
    pub received_at: OffsetDateTime,
    /// `None` until processing completes; stamped once
    pub processed_at: Option<OffsetDateTime>,
}

impl WebhookEvent {
    pub fn received(payload: Vec<u8>, now: OffsetDateTime) -> Self {
        let (event_id, resource_id) = extract_correlation(&payload);
        Self {
            id: Uuid::new_v4(),
            event_id,
            resource_id,
            payload,
            received_at: now,
            processed_at: None,
        }
    }
}

/// What a notification asks us to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookKind {
    /// Payer completed checkout; the matching change becomes PAID
    PaymentConfirmed,
    /// Provider-side agreement status changed
    AgreementUpdated,
    Unknown(String),
}

impl WebhookKind {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "payment.confirmed" | "agreement.authorized" => WebhookKind::PaymentConfirmed,
            "agreement.updated" => WebhookKind::AgreementUpdated,
            other => WebhookKind::Unknown(other.to_string()),
        }
    }
}

/// Decoded view of a provider notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookNotification {
    pub event_id: Option<String>,
    pub resource_id: Option<String>,
    pub kind: WebhookKind,
    pub external_reference: Option<String>,
    pub status: Option<AgreementStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    data: Option<EnvelopeData>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    external_reference: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Ids may arrive as strings or numbers
fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl WebhookNotification {
    /// Decode a payload. Anything that is not the expected JSON shape becomes
    /// an `Unknown` notification with no correlation ids.
    pub fn parse(payload: &[u8]) -> Self {
        let envelope: Envelope = serde_json::from_slice(payload).unwrap_or_default();
        let data = envelope.data.unwrap_or_default();
        Self {
            event_id: id_string(envelope.id.as_ref()),
            resource_id: id_string(data.id.as_ref()),
            kind: envelope
                .event_type
                .as_deref()
                .map(WebhookKind::parse)
                .unwrap_or_else(|| WebhookKind::Unknown(String::new())),
            external_reference: data.external_reference.filter(|r| !r.is_empty()),
            status: data.status.as_deref().map(AgreementStatus::parse),
        }
    }
}

impl WebhookNotification {
    /// Ledger lookup key: the event id when present, otherwise the resource id
    pub fn dedup_key(&self) -> (Option<&str>, Option<&str>) {
        match self.event_id.as_deref() {
            Some(event_id) => (Some(event_id), None),
            None => (None, self.resource_id.as_deref()),
        }
    }
}

/// `(event_id, resource_id)` for a raw payload
pub fn extract_correlation(payload: &[u8]) -> (Option<String>, Option<String>) {
    let notification = WebhookNotification::parse(payload);
    (notification.event_id, notification.resource_id)
}

/// Result of handling one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Already processed; nothing was done
    Duplicate,
    ChangePaid { change_id: Uuid },
    AgreementUpdated {
        agreement_id: String,
        status: AgreementStatus,
    },
    /// Recorded and stamped, no side effect
    Ignored { reason: String },
}

pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Handle one delivery. An error leaves the event unprocessed so a redelivery can retry it.
    pub async fn handle(&self, payload: &[u8], now: OffsetDateTime) -> BillingResult<WebhookOutcome> {
        let notification = WebhookNotification::parse(payload);

        let (event_key, resource_key) = notification.dedup_key();
        if event_key.is_some() || resource_key.is_some() {
            if let Some(existing) = self
                .store
                .find_processed_webhook(event_key, resource_key)
                .await?
            {
                tracing::info!(
                    event_id = ?notification.event_id,
                    resource_id = ?notification.resource_id,
                    processed_event = %existing.id,
                    "Duplicate webhook delivery, ignoring"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        let event = WebhookEvent::received(payload.to_vec(), now);
        self.store.insert_webhook(&event).await?;

        let outcome = self.apply(&notification, now).await.map_err(|e| {
            tracing::error!(
                webhook_id = %event.id,
                event_id = ?notification.event_id,
                error = %e,
                "Webhook side effect failed, left unprocessed"
            );
            e
        })?;

        self.store.mark_webhook_processed(event.id, now).await?;

        tracing::info!(
            webhook_id = %event.id,
            event_id = ?notification.event_id,
            resource_id = ?notification.resource_id,
            outcome = ?outcome,
            "Webhook processed"
        );
        Ok(outcome)
    }

    async fn apply(
        &self,
        notification: &WebhookNotification,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        if notification.event_id.is_none() && notification.resource_id.is_none() {
            return Ok(ignored("no correlation ids"));
        }

        match &notification.kind {
            WebhookKind::PaymentConfirmed => self.confirm_payment(notification, now).await,
            WebhookKind::AgreementUpdated => self.mirror_status(notification, now).await,
            WebhookKind::Unknown(kind) => Ok(ignored(format!("unhandled event type '{}'", kind))),
        }
    }

    async fn confirm_payment(
        &self,
        notification: &WebhookNotification,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let by_reference = match notification.external_reference.as_deref() {
            Some(reference) => self.store.find_change_by_reference(reference).await?,
            None => None,
        };
        let change = match (by_reference, notification.resource_id.as_deref()) {
            (Some(change), _) => Some(change),
            (None, Some(agreement_id)) => self.store.find_change_by_agreement(agreement_id).await?,
            (None, None) => None,
        };

        let Some(change) = change else {
            tracing::warn!(
                external_reference = ?notification.external_reference,
                resource_id = ?notification.resource_id,
                "Payment confirmation matches no pending change"
            );
            return Ok(ignored("no matching pending change"));
        };

        if !self
            .store
            .transition_change(change.id, ChangeStatus::Paid, now)
            .await?
        {
            return Ok(ignored(format!("pending change already {}", change.status)));
        }

        let agreement_id = notification
            .resource_id
            .clone()
            .or_else(|| change.external_agreement_id.clone());

        if let Some(agreement_id) = agreement_id {
            match self.store.get_subscription_by_id(change.subscription_id).await? {
                Some(subscription) => {
                    let link = AgreementLink::new(
                        subscription.tenant_id,
                        agreement_id.clone(),
                        AgreementStatus::Authorized,
                        now,
                    );
                    self.store.upsert_agreement_link(&link).await?;
                }
                None => {
                    tracing::warn!(
                        change_id = %change.id,
                        subscription_id = %change.subscription_id,
                        agreement_id = %agreement_id,
                        "Paid change has no subscription, agreement not registered"
                    );
                }
            }
        }

        tracing::info!(
            change_id = %change.id,
            change_type = %change.change_type,
            "Pending change marked paid"
        );
        Ok(WebhookOutcome::ChangePaid {
            change_id: change.id,
        })
    }

    async fn mirror_status(
        &self,
        notification: &WebhookNotification,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let (Some(agreement_id), Some(status)) =
            (notification.resource_id.as_deref(), notification.status.as_ref())
        else {
            return Ok(ignored("agreement update without id or status"));
        };

        if !self
            .store
            .update_agreement_status(agreement_id, status, now)
            .await?
        {
            return Ok(ignored(format!("unknown agreement {}", agreement_id)));
        }

        Ok(WebhookOutcome::AgreementUpdated {
            agreement_id: agreement_id.to_string(),
            status: status.clone(),
        })
    }
}

fn ignored(reason: impl Into<String>) -> WebhookOutcome {
    WebhookOutcome::Ignored {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{ChangeType, PendingSubscriptionChange};
    use crate::store::{AgreementStore, InMemoryBillingStore, PendingChangeStore};
    use crate::test_support::{seed_plan, seed_tenant, NOW};
    use serde_json::json;

    #[test]
    fn test_extract_correlation() {
        let payload = json!({"id": 991, "type": "payment.confirmed", "data": {"id": "agr_1"}});
        let (event_id, resource_id) = extract_correlation(payload.to_string().as_bytes());
        assert_eq!(event_id.as_deref(), Some("991"));
        assert_eq!(resource_id.as_deref(), Some("agr_1"));
    }

    #[test]
    fn test_non_json_payload_has_no_ids() {
        let notification = WebhookNotification::parse(b"<xml>nope</xml>");
        assert!(notification.event_id.is_none());
        assert!(notification.resource_id.is_none());
        assert_eq!(notification.kind, WebhookKind::Unknown(String::new()));
    }

    #[tokio::test]
    async fn test_payment_confirmation_falls_back_to_agreement_id() {
        let store = Arc::new(InMemoryBillingStore::new());
        let (tenant, sub) = seed_tenant(&store).await;
        let plan = seed_plan(&store, 1, "months").await;
        let mut change =
            PendingSubscriptionChange::new(sub.id, ChangeType::Renewal, plan.id, None, NOW);
        change.status = ChangeStatus::CheckoutStarted;
        change.external_agreement_id = Some("agr_77".into());
        store.insert_change(&change).await.unwrap();

        let payload = json!({"id": "evt_1", "type": "payment.confirmed", "data": {"id": "agr_77"}});
        let outcome = WebhookHandler::new(store.clone())
            .handle(payload.to_string().as_bytes(), NOW)
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::ChangePaid { change_id: change.id });
        let link = store.get_agreement_link("agr_77").await.unwrap().unwrap();
        assert_eq!(link.tenant_id, tenant);
        assert_eq!(link.status, AgreementStatus::Authorized);
        assert!(!link.is_primary);
    }

    #[tokio::test]
    async fn test_agreement_update_mirrors_status() {
        let store = Arc::new(InMemoryBillingStore::new());
        let (tenant, _) = seed_tenant(&store).await;
        let link = AgreementLink::new(tenant, "agr_9", AgreementStatus::Authorized, NOW);
        store.upsert_agreement_link(&link).await.unwrap();

        let payload = json!({"id": "evt_9", "type": "agreement.updated", "data": {"id": "agr_9", "status": "paused"}});
        let outcome = WebhookHandler::new(store.clone())
            .handle(payload.to_string().as_bytes(), NOW)
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::AgreementUpdated { .. }));
        let stored = store.get_agreement_link("agr_9").await.unwrap().unwrap();
        assert_eq!(stored.status, AgreementStatus::Paused);
    }

    #[tokio::test]
    async fn test_unknown_event_is_recorded_and_stamped() {
        let store = Arc::new(InMemoryBillingStore::new());
        let payload = json!({"id": "evt_x", "type": "invoice.created", "data": {"id": "inv_1"}});

        let outcome = WebhookHandler::new(store.clone())
            .handle(payload.to_string().as_bytes(), NOW)
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        let events = store.webhook_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].processed_at, Some(NOW));
        assert_eq!(events[0].payload, payload.to_string().into_bytes());
    }

    #[tokio::test]
    async fn test_duplicate_matches_resource_id_without_event_id() {
        let store = Arc::new(InMemoryBillingStore::new());
        let handler = WebhookHandler::new(store.clone());
        let payload = json!({"type": "invoice.created", "data": {"id": "res_1"}});

        handler.handle(payload.to_string().as_bytes(), NOW).await.unwrap();
        let outcome = handler.handle(payload.to_string().as_bytes(), NOW).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Duplicate);
        assert_eq!(store.webhook_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_new_event_for_same_resource_is_processed() {
        let store = Arc::new(InMemoryBillingStore::new());
        let handler = WebhookHandler::new(store.clone());
        let first = json!({"id": "evt_a", "type": "invoice.created", "data": {"id": "res_1"}});
        let second = json!({"id": "evt_b", "type": "invoice.created", "data": {"id": "res_1"}});
        let unkeyed = json!({"type": "invoice.created", "data": {"id": "res_1"}});

        handler.handle(first.to_string().as_bytes(), NOW).await.unwrap();
        let outcome = handler.handle(second.to_string().as_bytes(), NOW).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));

        // Keyed events never shadow a payload that only has a resource id
        let outcome = handler.handle(unkeyed.to_string().as_bytes(), NOW).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert_eq!(store.webhook_events().await.len(), 3);
    }

    async fn checkout_started(store: &InMemoryBillingStore, agreement_id: &str) -> PendingSubscriptionChange {
        let (tenant, sub) = seed_tenant(store).await;
        let plan = seed_plan(store, 1, "months").await;
        let mut change =
            PendingSubscriptionChange::new(sub.id, ChangeType::Upgrade, plan.id, None, NOW);
        change.status = ChangeStatus::CheckoutStarted;
        change.external_agreement_id = Some(agreement_id.into());
        store.insert_change(&change).await.unwrap();
        let link = AgreementLink::new(tenant, agreement_id, AgreementStatus::Pending, NOW);
        store.upsert_agreement_link(&link).await.unwrap();
        change
    }

    #[tokio::test]
    async fn test_payment_after_status_update_for_same_agreement() {
        let store = Arc::new(InMemoryBillingStore::new());
        let change = checkout_started(&store, "agr_new_0").await;
        let handler = WebhookHandler::new(store.clone());

        let update = json!({"id": "evt_upd", "type": "agreement.updated", "data": {"id": "agr_new_0", "status": "pending"}});
        let paid = json!({
            "id": "evt_paid",
            "type": "payment.confirmed",
            "data": {"id": "agr_new_0", "external_reference": change.id.to_string()}
        });

        let first = handler.handle(update.to_string().as_bytes(), NOW).await.unwrap();
        assert!(matches!(first, WebhookOutcome::AgreementUpdated { .. }));
        let second = handler.handle(paid.to_string().as_bytes(), NOW).await.unwrap();
        assert_eq!(second, WebhookOutcome::ChangePaid { change_id: change.id });

        let stored = store.get_change(change.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Paid);
    }

    #[tokio::test]
    async fn test_payment_after_unknown_event_for_same_agreement() {
        let store = Arc::new(InMemoryBillingStore::new());
        let change = checkout_started(&store, "agr_new_0").await;
        let handler = WebhookHandler::new(store.clone());

        let created = json!({"id": "evt_created", "type": "agreement.created", "data": {"id": "agr_new_0"}});
        let paid = json!({
            "id": "evt_paid",
            "type": "payment.confirmed",
            "data": {"id": "agr_new_0", "external_reference": change.id.to_string()}
        });

        let first = handler.handle(created.to_string().as_bytes(), NOW).await.unwrap();
        assert!(matches!(first, WebhookOutcome::Ignored { .. }));
        let second = handler.handle(paid.to_string().as_bytes(), NOW).await.unwrap();
        assert_eq!(second, WebhookOutcome::ChangePaid { change_id: change.id });

        let stored = store.get_change(change.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Paid);
    }

    #[test]
    fn test_dedup_key_prefers_event_id() {
        let keyed = WebhookNotification::parse(br#"{"id": "evt_1", "data": {"id": "agr_1"}}"#);
        assert_eq!(keyed.dedup_key(), (Some("evt_1"), None));

        let unkeyed = WebhookNotification::parse(br#"{"data": {"id": "agr_1"}}"#);
        assert_eq!(unkeyed.dedup_key(), (None, Some("agr_1")));
    }
}
