use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{PaymentFailure, SubscriptionEvent, SubscriptionEventKind};
use crate::error::ActionError;
use crate::gateway::{Filter, Order, Query, RemoteGateway};

pub const EVENTS_TABLE: &str = "subscription_events";
pub const PAYMENT_FAILURES_TABLE: &str = "payment_failures";

impl SubscriptionEvent {
    pub fn new(user_id: impl Into<String>, event_type: SubscriptionEventKind, metadata: Value) -> Self {
        Self {
            id: None,
            user_id: user_id.into(),
            event_type,
            old_tier: None,
            new_tier: None,
            metadata,
            created_at: None,
        }
    }
}

/// Append-only subscription funnel log.
#[derive(Clone)]
pub struct AuditLog {
    gateway: Arc<dyn RemoteGateway>,
}

impl AuditLog {
    pub fn new(gateway: Arc<dyn RemoteGateway>) -> Self {
        Self { gateway }
    }

    /// Best-effort: a failed write is logged and otherwise ignored.
    pub async fn record(&self, event: SubscriptionEvent) {
        let row = match serde_json::to_value(&event) {
            Ok(row) => row,
            Err(e) => {
                warn!("Failed to encode audit event: {}", e);
                return;
            }
        };
        match self.gateway.insert_row(EVENTS_TABLE, row).await {
            Ok(()) => debug!("Recorded {:?} for {}", event.event_type, event.user_id),
            Err(e) => warn!("Failed to record {:?}: {}", event.event_type, e),
        }
    }

    /// Newest events first.
    pub async fn recent_events(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SubscriptionEvent>, ActionError> {
        let query = Query::new()
            .filter(Filter::eq("user_id", user_id))
            .order(Order::desc("created_at"))
            .limit(limit);
        let rows = self.gateway.query_table(EVENTS_TABLE, &query).await?;
        serde_json::from_value(rows).map_err(|e| {
            warn!("Unexpected {} rows: {}", EVENTS_TABLE, e);
            ActionError::remote(String::new())
        })
    }

    /// Failed payments for `user_id`, newest first.
    pub async fn payment_failures(&self, user_id: &str) -> Result<Vec<PaymentFailure>, ActionError> {
        let query = Query::new()
            .filter(Filter::eq("user_id", user_id))
            .order(Order::desc("created_at"));
        let rows = self.gateway.query_table(PAYMENT_FAILURES_TABLE, &query).await?;
        serde_json::from_value(rows).map_err(|e| {
            warn!("Unexpected {} rows: {}", PAYMENT_FAILURES_TABLE, e);
            ActionError::remote(String::new())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_swallows_insert_failures() {
        let gateway = InMemoryGateway::new();
        gateway.fail_inserts(true);
        let audit = AuditLog::new(Arc::new(gateway.clone()));
        audit
            .record(SubscriptionEvent::new("u1", SubscriptionEventKind::CheckoutInitiated, json!({})))
            .await;
        assert!(gateway.rows(EVENTS_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_recent_events_newest_first() {
        let gateway = InMemoryGateway::new();
        gateway.set_rows(
            EVENTS_TABLE,
            vec![
                json!({ "user_id": "u1", "event_type": "checkout_initiated", "created_at": "2025-01-01T00:00:00Z" }),
                json!({ "user_id": "u1", "event_type": "subscription_created", "created_at": "2025-01-02T00:00:00Z" }),
                json!({ "user_id": "u2", "event_type": "payment_failed", "created_at": "2025-01-03T00:00:00Z" }),
                json!({ "user_id": "u1", "event_type": "plan_migrated", "created_at": "2025-01-04T00:00:00Z" }),
            ],
        );
        let audit = AuditLog::new(Arc::new(gateway));
        let events = audit.recent_events("u1", 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, SubscriptionEventKind::Other);
        assert_eq!(events[1].event_type, SubscriptionEventKind::SubscriptionCreated);
    }

    #[tokio::test]
    async fn test_payment_failures_filtered_by_user() {
        let gateway = InMemoryGateway::new();
        gateway.set_rows(
            PAYMENT_FAILURES_TABLE,
            vec![
                json!({ "user_id": "u1", "amount": 9.99, "currency": "usd", "failure_reason": "card_declined" }),
                json!({ "user_id": "u2", "amount": 19.99 }),
            ],
        );
        let audit = AuditLog::new(Arc::new(gateway));
        let failures = audit.payment_failures("u1").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failure_reason.as_deref(), Some("card_declined"));
    }
}
