pub mod audit;
pub mod change;
pub mod checkout;
pub mod manage;
pub mod plan;
pub mod subscription;
pub mod usage;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

pub use audit::AuditLog;
pub use change::{ChangeStatus, SubscriptionChanger};
pub use checkout::CheckoutAction;
pub use manage::{ManageAction, ManageOutcome, SubscriptionManager};
pub use plan::{Feature, SubscriptionPlan};
pub use subscription::SubscriptionState;
pub use usage::UsageTracker;

/// Subscription tiers, ordered from least to most access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Premium,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Pro, Tier::Premium, Tier::Enterprise];

    /// Capitalized name for display.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Pro => "Pro",
            Self::Premium => "Premium",
            Self::Enterprise => "Enterprise",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    /// Position in the access ordering.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Pro => 1,
            Self::Premium => 2,
            Self::Enterprise => 3,
        }
    }

    /// Every tier except free is billed.
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }

    /// True when this tier grants everything `required` grants.
    pub fn satisfies(&self, required: Tier) -> bool {
        self.rank() >= required.rank()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// Billing period of a paid plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[serde(alias = "monthly")]
    Month,
    #[serde(alias = "yearly")]
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// `"monthly"` or `"yearly"`, for messages.
    pub fn adjective(&self) -> &'static str {
        match self {
            Self::Month => "monthly",
            Self::Year => "yearly",
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "month" | "monthly" => Ok(Self::Month),
            "year" | "yearly" | "annual" => Ok(Self::Year),
            other => Err(format!("unknown billing interval: {}", other)),
        }
    }
}

/// Row of the `user_subscriptions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSubscription {
    pub user_id: String,
    pub tier: Tier,
    #[serde(default)]
    pub stripe_customer_id: Option<String>,
    #[serde(default)]
    pub stripe_subscription_id: Option<String>,
    #[serde(default)]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cancel_at_period_end: bool,
}

impl UserSubscription {
    pub fn new_free(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: Tier::Free,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
        }
    }

    /// Free is always active; a paid tier is active only while its period end
    /// lies strictly after `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.tier == Tier::Free {
            return true;
        }
        matches!(self.current_period_end, Some(end) if end > now)
    }

    /// Tier used for access checks. A lapsed paid period counts as free even
    /// before the billing webhook has reconciled the stored tier.
    pub fn effective_tier_at(&self, now: DateTime<Utc>) -> Tier {
        if self.is_active_at(now) {
            self.tier
        } else {
            Tier::Free
        }
    }

    /// Whole days until the period ends; negative once it has lapsed.
    pub fn days_remaining_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.current_period_end.map(|end| (end - now).num_days())
    }

    /// Period end rendered for display, e.g. "March 5, 2025".
    pub fn formatted_period_end(&self) -> Option<String> {
        self.current_period_end
            .map(|end| end.format("%B %-d, %Y").to_string())
    }

    /// Billing provider subscription id, ignoring blanks.
    pub fn external_subscription_id(&self) -> Option<&str> {
        non_empty(self.stripe_subscription_id.as_deref())
    }

    /// Billing provider customer id, ignoring blanks.
    pub fn external_customer_id(&self) -> Option<&str> {
        non_empty(self.stripe_customer_id.as_deref())
    }
}

/// Calendar month a usage counter belongs to. Boundaries are taken in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub month: u32,
    pub year: i32,
}

impl UsageKey {
    /// Calendar month containing `now`, in UTC.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            month: now.month(),
            year: now.year(),
        }
    }

    pub fn current() -> Self {
        Self::at(Utc::now())
    }
}

/// Row of the `prompt_usage` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptUsage {
    pub user_id: String,
    pub month: u32,
    pub year: i32,
    #[serde(default)]
    pub prompt_count: i64,
    pub monthly_limit: i64,
}

impl PromptUsage {
    /// A month with no recorded usage yet.
    pub fn fresh(user_id: impl Into<String>, key: UsageKey, limit: i64) -> Self {
        Self {
            user_id: user_id.into(),
            month: key.month,
            year: key.year,
            prompt_count: 0,
            monthly_limit: limit,
        }
    }

    pub fn key(&self) -> UsageKey {
        UsageKey {
            month: self.month,
            year: self.year,
        }
    }

    /// Prompts left this month, never negative.
    pub fn remaining(&self) -> i64 {
        (self.monthly_limit - self.prompt_count).max(0)
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Share of the monthly limit used, in percent.
    pub fn percentage_used(&self) -> f32 {
        if self.monthly_limit <= 0 {
            return 0.0;
        }
        (self.prompt_count as f32 / self.monthly_limit as f32) * 100.0
    }

    pub fn is_near_limit(&self) -> bool {
        self.percentage_used() > 80.0
    }
}

/// Kinds of entries in the subscription audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEventKind {
    CheckoutInitiated,
    CheckoutAbandoned,
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    SubscriptionReactivated,
    PaymentFailed,
    #[serde(other)]
    Other,
}

/// Append-only row of `subscription_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub event_type: SubscriptionEventKind,
    #[serde(default)]
    pub old_tier: Option<Tier>,
    #[serde(default)]
    pub new_tier: Option<Tier>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Append-only row of `payment_failures`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailure {
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Free < Tier::Pro);
        assert!(Tier::Pro < Tier::Premium);
        assert!(Tier::Premium < Tier::Enterprise);
        assert!(Tier::Enterprise.satisfies(Tier::Free));
        assert!(!Tier::Pro.satisfies(Tier::Premium));
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert!("gold".parse::<Tier>().is_err());
        let tier: Tier = serde_json::from_str("\"enterprise\"").unwrap();
        assert_eq!(tier, Tier::Enterprise);
    }

    #[test]
    fn test_interval_aliases() {
        let month: BillingInterval = serde_json::from_str("\"monthly\"").unwrap();
        let year: BillingInterval = serde_json::from_str("\"year\"").unwrap();
        assert_eq!(month, BillingInterval::Month);
        assert_eq!(year, BillingInterval::Year);
        assert_eq!("annual".parse::<BillingInterval>().unwrap(), BillingInterval::Year);
    }

    #[test]
    fn test_free_subscription_always_active() {
        let sub = UserSubscription::new_free("u1");
        assert!(sub.is_active_at(Utc::now()));
        assert_eq!(sub.effective_tier_at(Utc::now()), Tier::Free);
    }

    #[test]
    fn test_paid_subscription_activity_follows_period_end() {
        let now = Utc::now();
        let mut sub = UserSubscription {
            tier: Tier::Pro,
            current_period_end: Some(now - Duration::days(1)),
            ..UserSubscription::new_free("u1")
        };
        assert!(!sub.is_active_at(now));
        assert_eq!(sub.effective_tier_at(now), Tier::Free);

        sub.current_period_end = Some(now + Duration::hours(1));
        assert!(sub.is_active_at(now));
        assert_eq!(sub.effective_tier_at(now), Tier::Pro);

        sub.current_period_end = Some(now);
        assert!(!sub.is_active_at(now));

        sub.current_period_end = None;
        assert!(!sub.is_active_at(now));
    }

    #[test]
    fn test_subscription_row_with_nulls() {
        let row = serde_json::json!({
            "user_id": "u1",
            "tier": "premium",
            "stripe_customer_id": null,
            "stripe_subscription_id": "sub_1",
            "current_period_end": "2030-01-01T00:00:00Z",
            "cancel_at_period_end": null
        });
        let sub: UserSubscription = serde_json::from_value(row).unwrap();
        assert_eq!(sub.tier, Tier::Premium);
        assert!(!sub.cancel_at_period_end);
        assert_eq!(sub.external_subscription_id(), Some("sub_1"));
        assert_eq!(sub.external_customer_id(), None);
    }

    #[test]
    fn test_formatted_period_end() {
        let sub = UserSubscription {
            current_period_end: Some(Utc.with_ymd_and_hms(2025, 3, 5, 12, 0, 0).unwrap()),
            ..UserSubscription::new_free("u1")
        };
        assert_eq!(sub.formatted_period_end().as_deref(), Some("March 5, 2025"));
    }

    #[test]
    fn test_usage_remaining_never_negative() {
        let key = UsageKey { month: 4, year: 2025 };
        let mut usage = PromptUsage::fresh("u1", key, 10);
        assert_eq!(usage.remaining(), 10);
        usage.prompt_count = 9;
        assert_eq!(usage.remaining(), 1);
        assert!(usage.is_near_limit());
        usage.prompt_count = 14;
        assert_eq!(usage.remaining(), 0);
        assert!(!usage.has_remaining());
    }

    #[test]
    fn test_usage_key_follows_calendar_month() {
        let end_of_jan = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap();
        let start_of_feb = end_of_jan + Duration::seconds(1);
        assert_eq!(UsageKey::at(end_of_jan), UsageKey { month: 1, year: 2025 });
        assert_eq!(UsageKey::at(start_of_feb), UsageKey { month: 2, year: 2025 });
    }

    #[test]
    fn test_unknown_event_kind_is_tolerated() {
        let kind: SubscriptionEventKind = serde_json::from_str("\"trial_started\"").unwrap();
        assert_eq!(kind, SubscriptionEventKind::Other);
    }
}
