use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::{BillingInterval, Tier};

/// A single entry of a plan's feature map.
///
/// The catalog stores features as bare booleans, bare strings, or
/// `{ "description": .., "value": .. }` objects; they are normalized into this
/// type when the plan is deserialized, and written back in the object form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    Flag { enabled: bool },
    NamedFlag { description: String, enabled: bool },
}

impl Feature {
    /// Normalize one raw feature value. `null` and arrays are dropped.
    pub fn from_value(key: &str, value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(enabled) => Some(Self::Flag { enabled: *enabled }),
            Value::String(text) => Some(Self::NamedFlag {
                description: text.clone(),
                enabled: true,
            }),
            Value::Number(n) => Some(Self::NamedFlag {
                description: n.to_string(),
                enabled: true,
            }),
            Value::Object(object) => {
                let description = object
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or(key)
                    .to_string();
                let enabled = match object.get("value") {
                    Some(Value::Bool(b)) => *b,
                    Some(Value::Null) => false,
                    Some(_) | None => true,
                };
                Some(Self::NamedFlag {
                    description,
                    enabled,
                })
            }
            Value::Array(_) => None,
        }
    }

    /// Catalog form: a bare boolean for flags, an object otherwise.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Flag { enabled } => Value::Bool(*enabled),
            Self::NamedFlag {
                description,
                enabled,
            } => json!({ "description": description, "value": enabled }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Flag { enabled } | Self::NamedFlag { enabled, .. } => *enabled,
        }
    }

    /// Label to show for this feature; falls back to the map key.
    pub fn label<'a>(&'a self, key: &'a str) -> &'a str {
        match self {
            Self::Flag { .. } => key,
            Self::NamedFlag { description, .. } => description,
        }
    }
}

/// Row of the `subscription_plans` catalog. Serializes back to the row shape
/// it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPlan", into = "RawPlan")]
pub struct SubscriptionPlan {
    pub id: String,
    pub tier: Tier,
    pub name: String,
    pub description: Option<String>,
    pub price_monthly: f64,
    pub price_yearly: f64,
    pub stripe_price_id_monthly: Option<String>,
    pub stripe_price_id_yearly: Option<String>,
    pub features: BTreeMap<String, Feature>,
    pub is_active: bool,
}

#[derive(Serialize, Deserialize)]
struct RawPlan {
    id: Value,
    tier: Tier,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    price_monthly: Option<f64>,
    #[serde(default)]
    price_yearly: Option<f64>,
    #[serde(default)]
    stripe_price_id_monthly: Option<String>,
    #[serde(default)]
    stripe_price_id_yearly: Option<String>,
    #[serde(default)]
    features: Option<Map<String, Value>>,
    #[serde(default)]
    is_active: Option<bool>,
}

impl From<RawPlan> for SubscriptionPlan {
    fn from(raw: RawPlan) -> Self {
        let id = match raw.id {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let mut description = None;
        let mut features = BTreeMap::new();
        for (key, value) in raw.features.unwrap_or_default() {
            if key == "description" {
                description = value.as_str().map(str::to_string);
                continue;
            }
            if let Some(feature) = Feature::from_value(&key, &value) {
                features.insert(key, feature);
            }
        }

        Self {
            id,
            tier: raw.tier,
            name: raw.name.unwrap_or_else(|| raw.tier.display_name().to_string()),
            description,
            price_monthly: raw.price_monthly.unwrap_or(0.0),
            price_yearly: raw.price_yearly.unwrap_or(0.0),
            stripe_price_id_monthly: raw.stripe_price_id_monthly,
            stripe_price_id_yearly: raw.stripe_price_id_yearly,
            features,
            is_active: raw.is_active.unwrap_or(true),
        }
    }
}

impl From<SubscriptionPlan> for RawPlan {
    fn from(plan: SubscriptionPlan) -> Self {
        let mut features: Map<String, Value> = plan
            .features
            .iter()
            .map(|(key, feature)| (key.clone(), feature.to_value()))
            .collect();
        if let Some(description) = plan.description {
            features.insert("description".to_string(), Value::String(description));
        }

        Self {
            id: Value::String(plan.id),
            tier: plan.tier,
            name: Some(plan.name),
            price_monthly: Some(plan.price_monthly),
            price_yearly: Some(plan.price_yearly),
            stripe_price_id_monthly: plan.stripe_price_id_monthly,
            stripe_price_id_yearly: plan.stripe_price_id_yearly,
            features: Some(features),
            is_active: Some(plan.is_active),
        }
    }
}

impl SubscriptionPlan {
    /// External price identifier for `interval`. Never falls back to the
    /// other interval.
    pub fn price_id(&self, interval: BillingInterval) -> Option<&str> {
        let id = match interval {
            BillingInterval::Month => self.stripe_price_id_monthly.as_deref(),
            BillingInterval::Year => self.stripe_price_id_yearly.as_deref(),
        };
        id.filter(|id| !id.trim().is_empty())
    }

    /// List price for one billing period of `interval`.
    pub fn price(&self, interval: BillingInterval) -> f64 {
        match interval {
            BillingInterval::Month => self.price_monthly,
            BillingInterval::Year => self.price_yearly,
        }
    }

    /// Whole-percent saving of yearly over twelve monthly payments, clamped at 0.
    pub fn yearly_discount_percent(&self) -> u8 {
        yearly_discount_percent(self.price_monthly, self.price_yearly)
    }

    /// Labels of the enabled features, in key order.
    pub fn enabled_features(&self) -> impl Iterator<Item = &str> {
        self.features
            .iter()
            .filter(|(_, feature)| feature.is_enabled())
            .map(|(key, feature)| feature.label(key))
    }

    /// Whether `key` is present and enabled.
    pub fn has_feature(&self, key: &str) -> bool {
        self.features.get(key).map(Feature::is_enabled).unwrap_or(false)
    }
}

/// Whole-percent saving of `yearly` over twelve `monthly` payments.
pub fn yearly_discount_percent(monthly: f64, yearly: f64) -> u8 {
    let full_year = monthly * 12.0;
    if full_year <= 0.0 || !full_year.is_finite() || !yearly.is_finite() {
        return 0;
    }
    let percent = ((full_year - yearly) / full_year * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_row() -> Value {
        json!({
            "id": 2,
            "tier": "pro",
            "name": "Pro",
            "price_monthly": 9.99,
            "price_yearly": 99.99,
            "stripe_price_id_monthly": "price_pro_m",
            "stripe_price_id_yearly": "",
            "features": {
                "description": "For power users",
                "unlimited_prompts": true,
                "api_access": false,
                "prompt_limit": "500 prompts / month",
                "export": { "description": "Export to PDF", "value": true },
                "teams": { "description": "Team sharing", "value": false },
                "beta": null
            }
        })
    }

    #[test]
    fn test_features_normalized_once() {
        let plan: SubscriptionPlan = serde_json::from_value(plan_row()).unwrap();
        assert_eq!(plan.id, "2");
        assert_eq!(plan.description.as_deref(), Some("For power users"));
        assert!(!plan.features.contains_key("description"));
        assert!(!plan.features.contains_key("beta"));
        assert_eq!(
            plan.features["unlimited_prompts"],
            Feature::Flag { enabled: true }
        );
        assert_eq!(
            plan.features["export"],
            Feature::NamedFlag {
                description: "Export to PDF".to_string(),
                enabled: true
            }
        );
        assert!(plan.has_feature("prompt_limit"));
        assert!(!plan.has_feature("teams"));

        let enabled: Vec<&str> = plan.enabled_features().collect();
        assert_eq!(
            enabled,
            vec!["Export to PDF", "500 prompts / month", "unlimited_prompts"]
        );
    }

    #[test]
    fn test_serialized_plan_reads_back_unchanged() {
        let plan: SubscriptionPlan = serde_json::from_value(plan_row()).unwrap();
        let written = serde_json::to_value(&plan).unwrap();
        assert_eq!(written["features"]["api_access"], json!(false));
        assert_eq!(written["features"]["description"], "For power users");

        let back: SubscriptionPlan = serde_json::from_value(written).unwrap();
        assert_eq!(back, plan);
        assert!(!back.has_feature("api_access"));
        assert_eq!(back.description.as_deref(), Some("For power users"));
    }

    #[test]
    fn test_price_id_does_not_fall_back() {
        let plan: SubscriptionPlan = serde_json::from_value(plan_row()).unwrap();
        assert_eq!(plan.price_id(BillingInterval::Month), Some("price_pro_m"));
        assert_eq!(plan.price_id(BillingInterval::Year), None);
    }

    #[test]
    fn test_yearly_discount() {
        assert_eq!(yearly_discount_percent(10.0, 100.0), 17);
        assert_eq!(yearly_discount_percent(10.0, 120.0), 0);
        assert_eq!(yearly_discount_percent(10.0, 150.0), 0);
        assert_eq!(yearly_discount_percent(0.0, 0.0), 0);
        assert_eq!(yearly_discount_percent(10.0, 0.0), 100);
    }

    #[test]
    fn test_plan_discount_clamped() {
        let plan: SubscriptionPlan = serde_json::from_value(json!({
            "id": "p",
            "tier": "premium",
            "price_monthly": 20.0,
            "price_yearly": 240.0
        }))
        .unwrap();
        assert_eq!(plan.yearly_discount_percent(), 0);
        assert_eq!(plan.name, "Premium");
        assert!(plan.features.is_empty());
    }
}
