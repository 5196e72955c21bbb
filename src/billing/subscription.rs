use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use super::{SubscriptionPlan, Tier, UserSubscription};
use crate::context::ClientContext;
use crate::gateway::{Filter, Order};
use crate::sync::{LiveQuery, QuerySpec, QueryState};

pub const SUBSCRIPTIONS_TABLE: &str = "user_subscriptions";
pub const PLANS_TABLE: &str = "subscription_plans";

/// Live view of the signed-in user's subscription and the plan catalog.
pub struct SubscriptionState {
    ctx: ClientContext,
    user_id: Option<String>,
    subscription: Option<LiveQuery<Option<UserSubscription>>>,
    plans: LiveQuery<Vec<SubscriptionPlan>>,
}

fn subscription_spec(user_id: &str) -> QuerySpec<Option<UserSubscription>> {
    QuerySpec::new(SUBSCRIPTIONS_TABLE)
        .filter(Filter::eq("user_id", user_id))
        .single()
}

impl SubscriptionState {
    /// Mount the plan catalog and, when signed in, the user's subscription row.
    pub async fn mount(ctx: &ClientContext, user_id: Option<&str>) -> Self {
        let subscription = match user_id {
            Some(user_id) => Some(LiveQuery::mount(ctx, subscription_spec(user_id)).await),
            None => None,
        };
        let plans = LiveQuery::mount(
            ctx,
            QuerySpec::new(PLANS_TABLE).order(Order::asc("price_monthly")),
        )
        .await;

        Self {
            ctx: ctx.clone(),
            user_id: user_id.map(str::to_string),
            subscription,
            plans,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Follow a sign-in, sign-out or account switch.
    pub async fn set_user(&mut self, user_id: Option<&str>) {
        if self.user_id.as_deref() == user_id {
            return;
        }
        debug!("Subscription state switching user to {:?}", user_id);
        self.user_id = user_id.map(str::to_string);

        match user_id {
            Some(user_id) => match self.subscription.as_mut() {
                Some(query) => {
                    query.set_filter(Some(Filter::eq("user_id", user_id))).await;
                }
                None => {
                    let query = LiveQuery::mount(&self.ctx, subscription_spec(user_id)).await;
                    self.subscription = Some(query);
                }
            },
            None => {
                if let Some(query) = self.subscription.take() {
                    query.unmount().await;
                }
            }
        }
    }

    /// `None` until the subscription row has been fetched at least once.
    fn loaded(&self) -> Option<Option<UserSubscription>> {
        self.subscription.as_ref()?.data()
    }

    /// The user's row, if signed in and one exists.
    pub fn current_subscription(&self) -> Option<UserSubscription> {
        self.loaded().flatten()
    }

    /// Active catalog entries, cheapest first.
    pub fn plans(&self) -> Vec<SubscriptionPlan> {
        let mut plans = self.plans.data().unwrap_or_default();
        plans.retain(|plan| plan.is_active);
        plans
    }

    /// Active plan with id `plan_id`.
    pub fn plan(&self, plan_id: &str) -> Option<SubscriptionPlan> {
        self.plans().into_iter().find(|plan| plan.id == plan_id)
    }

    /// True while either query is fetching.
    pub fn is_loading(&self) -> bool {
        let subscription_loading = self
            .subscription
            .as_ref()
            .map(|query| query.is_loading())
            .unwrap_or(false);
        subscription_loading || self.plans.is_loading()
    }

    /// First error of the subscription or catalog query.
    pub fn error(&self) -> Option<String> {
        self.subscription
            .as_ref()
            .and_then(|query| query.error())
            .or_else(|| self.plans.error())
    }

    /// Stored tier; a signed-in user without a subscription row is free.
    pub fn current_tier(&self) -> Option<Tier> {
        self.loaded()
            .map(|row| row.map(|subscription| subscription.tier).unwrap_or(Tier::Free))
    }

    /// Catalog entry for the current tier, or `None` if the catalog has not
    /// loaded.
    pub fn get_current_plan(&self) -> Option<SubscriptionPlan> {
        let tier = self.current_tier()?;
        self.plans().into_iter().find(|plan| plan.tier == tier)
    }

    /// Whether the subscription counts as active at `now`. Fails closed until loaded.
    pub fn is_subscription_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.loaded() {
            Some(Some(subscription)) => subscription.is_active_at(now),
            Some(None) => true,
            None => false,
        }
    }

    /// Evaluated against the clock on every call.
    pub fn is_subscription_active(&self) -> bool {
        self.is_subscription_active_at(Utc::now())
    }

    /// Whether the effective tier reaches `required`. False while the
    /// subscription has not loaded or nobody is signed in.
    pub fn has_access_at(&self, required: Tier, now: DateTime<Utc>) -> bool {
        let effective = match self.loaded() {
            Some(Some(subscription)) => subscription.effective_tier_at(now),
            Some(None) => Tier::Free,
            None => return false,
        };
        effective.satisfies(required)
    }

    /// [`Self::has_access_at`] evaluated now.
    pub fn has_access(&self, required: Tier) -> bool {
        self.has_access_at(required, Utc::now())
    }

    pub fn formatted_period_end(&self) -> Option<String> {
        self.current_subscription()?.formatted_period_end()
    }

    /// Days left in the current period.
    pub fn days_remaining(&self) -> Option<i64> {
        self.current_subscription()?.days_remaining_at(Utc::now())
    }

    /// Generation of the subscription row; see [`LiveQuery::generation`].
    pub fn subscription_generation(&self) -> Option<u64> {
        self.subscription.as_ref().map(|query| query.generation())
    }

    pub fn watch_subscription(&self) -> Option<watch::Receiver<QueryState<Option<UserSubscription>>>> {
        self.subscription.as_ref().map(|query| query.subscribe())
    }

    /// Re-fetch the subscription row and the catalog.
    pub async fn refresh(&self) {
        if let Some(query) = &self.subscription {
            query.refetch().await;
        }
        self.plans.refetch().await;
    }

    /// Release both change feeds.
    pub async fn unmount(self) {
        if let Some(query) = self.subscription {
            query.unmount().await;
        }
        self.plans.unmount().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::gateway::InMemoryGateway;
    use crate::navigation::BrowserNavigator;
    use crate::notify::LogNotifier;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;

    async fn mount_with(rows: Vec<serde_json::Value>) -> (InMemoryGateway, SubscriptionState) {
        let gateway = InMemoryGateway::new();
        gateway.set_rows(SUBSCRIPTIONS_TABLE, rows);
        gateway.set_rows(
            PLANS_TABLE,
            vec![
                json!({ "id": 2, "tier": "pro", "price_monthly": 9.0, "price_yearly": 90.0, "features": {} }),
                json!({ "id": 1, "tier": "free", "price_monthly": 0.0, "price_yearly": 0.0, "features": {} }),
            ],
        );
        let ctx = ClientContext::new(
            Arc::new(gateway.clone()),
            Arc::new(LogNotifier),
            Arc::new(BrowserNavigator),
            ClientConfig::default(),
        );
        let state = SubscriptionState::mount(&ctx, Some("u1")).await;
        (gateway, state)
    }

    #[tokio::test]
    async fn test_plans_are_ordered_by_monthly_price() {
        let (_, state) = mount_with(vec![]).await;
        let tiers: Vec<Tier> = state.plans().iter().map(|p| p.tier).collect();
        assert_eq!(tiers, vec![Tier::Free, Tier::Pro]);
    }

    #[tokio::test]
    async fn test_missing_row_means_free() {
        let (_, state) = mount_with(vec![]).await;
        assert_eq!(state.current_tier(), Some(Tier::Free));
        assert!(state.is_subscription_active());
        assert!(state.has_access(Tier::Free));
        assert!(!state.has_access(Tier::Pro));
        assert_eq!(state.get_current_plan().unwrap().id, "1");
    }

    #[tokio::test]
    async fn test_current_plan_follows_tier() {
        let end = Utc::now() + Duration::days(10);
        let (_, state) = mount_with(vec![json!({
            "user_id": "u1",
            "tier": "pro",
            "stripe_subscription_id": "sub_1",
            "current_period_end": end.to_rfc3339(),
            "cancel_at_period_end": null
        })])
        .await;
        assert_eq!(state.get_current_plan().unwrap().tier, Tier::Pro);
        assert!(state.days_remaining().unwrap() >= 9);
        assert!(state.formatted_period_end().is_some());
    }

    #[tokio::test]
    async fn test_signed_out_fails_closed() {
        let gateway = InMemoryGateway::new();
        let ctx = ClientContext::new(
            Arc::new(gateway.clone()),
            Arc::new(LogNotifier),
            Arc::new(BrowserNavigator),
            ClientConfig::default(),
        );
        let state = SubscriptionState::mount(&ctx, None).await;
        assert!(!state.has_access(Tier::Free));
        assert!(!state.is_subscription_active());
        assert_eq!(gateway.query_count(SUBSCRIPTIONS_TABLE), 0);
    }
}
