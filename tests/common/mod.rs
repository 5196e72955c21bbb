#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use promptlib::auth::{AuthUser, Session};
use promptlib::billing::subscription::{PLANS_TABLE, SUBSCRIPTIONS_TABLE};
use promptlib::gateway::InMemoryGateway;
use promptlib::navigation::Navigator;
use promptlib::notify::{Notice, NoticeLevel, Notifier};
use promptlib::{ClientConfig, ClientContext};

pub const USER_ID: &str = "user-1";

/// Collects every notice for later assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn count(&self, level: NoticeLevel) -> usize {
        self.notices().iter().filter(|n| n.level == level).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

/// Records redirects instead of opening a browser.
#[derive(Default)]
pub struct RecordingNavigator {
    urls: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, url: &str) -> anyhow::Result<()> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

/// In-memory backend plus recording seams, wired into a context.
pub struct TestEnvironment {
    pub gateway: InMemoryGateway,
    pub notifier: Arc<RecordingNotifier>,
    pub navigator: Arc<RecordingNavigator>,
    pub ctx: ClientContext,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let gateway = InMemoryGateway::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let navigator = Arc::new(RecordingNavigator::default());
        let config = ClientConfig {
            supabase_url: "https://test.supabase.co".to_string(),
            supabase_anon_key: "anon".to_string(),
            site_url: "https://prompts.test/".to_string(),
            ..Default::default()
        };
        let ctx = ClientContext::new(
            Arc::new(gateway.clone()),
            notifier.clone(),
            navigator.clone(),
            config,
        );
        Self {
            gateway,
            notifier,
            navigator,
            ctx,
        }
    }

    /// Environment with the standard plan catalog and a signed-in user.
    pub fn with_catalog() -> Self {
        let env = Self::new();
        env.gateway.set_rows(PLANS_TABLE, plan_rows());
        env.gateway.set_session(Some(session()));
        env
    }

    pub fn set_subscription(&self, row: Value) {
        self.gateway.set_rows(SUBSCRIPTIONS_TABLE, vec![row]);
    }
}

pub fn user() -> AuthUser {
    AuthUser {
        id: USER_ID.to_string(),
        email: Some("ada@example.com".to_string()),
    }
}

pub fn session() -> Session {
    Session {
        access_token: "access".to_string(),
        refresh_token: "refresh".to_string(),
        expires_at: 4_000_000_000,
        user: user(),
    }
}

pub fn plan_rows() -> Vec<Value> {
    vec![
        json!({
            "id": 3, "tier": "premium", "name": "Premium",
            "price_monthly": 19.99, "price_yearly": 199.99,
            "stripe_price_id_monthly": "price_premium_m",
            "stripe_price_id_yearly": null,
            "features": { "description": "For teams", "unlimited_prompts": true }
        }),
        json!({
            "id": 1, "tier": "free", "name": "Free",
            "price_monthly": 0, "price_yearly": 0,
            "features": { "prompt_limit": "10 prompts / month" }
        }),
        json!({
            "id": 2, "tier": "pro", "name": "Pro",
            "price_monthly": 9.99, "price_yearly": 99.99,
            "stripe_price_id_monthly": "price_pro_m",
            "stripe_price_id_yearly": "price_pro_y",
            "features": { "export": { "description": "Export to PDF", "value": true } }
        }),
    ]
}

pub fn subscription_row(tier: &str, period_end: Option<DateTime<Utc>>) -> Value {
    json!({
        "user_id": USER_ID,
        "tier": tier,
        "stripe_customer_id": "cus_123",
        "stripe_subscription_id": "sub_123",
        "current_period_start": null,
        "current_period_end": period_end.map(|end| end.to_rfc3339()),
        "cancel_at_period_end": false
    })
}

/// Helper to wait for async operations with timeout
pub async fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    false
}

/// Let background listeners drain anything already queued.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
