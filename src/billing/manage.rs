use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::{info, warn};

use super::subscription::{SubscriptionState, SUBSCRIPTIONS_TABLE};
use crate::context::ClientContext;
use crate::error::ActionError;
use crate::gateway::FunctionRequest;
use crate::navigation::Redirect;
use crate::notify::Notice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageAction {
    Portal,
    Cancel,
    Reactivate,
}

impl ManageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Portal => "portal",
            Self::Cancel => "cancel",
            Self::Reactivate => "reactivate",
        }
    }

    fn function(&self) -> &'static str {
        match self {
            Self::Portal => "create-portal-session",
            Self::Cancel => "cancel-subscription",
            Self::Reactivate => "reactivate-subscription",
        }
    }
}

impl fmt::Display for ManageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManageAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "portal" => Ok(Self::Portal),
            "cancel" => Ok(Self::Cancel),
            "reactivate" => Ok(Self::Reactivate),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManageOutcome {
    /// The user was sent to the billing portal.
    Redirected(Redirect),
    /// Cancel or reactivate went through; carries the new local flag.
    Updated { cancel_at_period_end: bool },
}

/// Billing portal, cancel-at-period-end and reactivation.
///
/// The three actions share one in-flight flag. It is not a lock: a second
/// call while one is pending is not rejected.
pub struct SubscriptionManager {
    ctx: ClientContext,
    in_flight: watch::Sender<bool>,
    cancel_at_period_end: watch::Sender<Option<PendingFlag>>,
}

/// Flag set by a successful cancel/reactivate, valid until the subscription
/// row is fetched again.
#[derive(Debug, Clone, Copy)]
struct PendingFlag {
    value: bool,
    generation: Option<u64>,
}

impl SubscriptionManager {
    pub fn new(ctx: &ClientContext) -> Self {
        Self {
            ctx: ctx.clone(),
            in_flight: watch::channel(false).0,
            cancel_at_period_end: watch::channel(None).0,
        }
    }

    /// True while a portal, cancel or reactivate call is pending.
    pub fn is_loading(&self) -> bool {
        *self.in_flight.borrow()
    }

    pub fn watch_loading(&self) -> watch::Receiver<bool> {
        self.in_flight.subscribe()
    }

    /// Cancel-at-period-end flag. Right after a successful cancel/reactivate
    /// this is the value that call set; once the subscription row has been
    /// fetched again the stored row decides.
    pub fn cancel_at_period_end(&self, state: &SubscriptionState) -> bool {
        let pending = *self.cancel_at_period_end.borrow();
        match pending {
            Some(flag) if flag.generation == state.subscription_generation() => flag.value,
            _ => state
                .current_subscription()
                .map(|subscription| subscription.cancel_at_period_end)
                .unwrap_or(false),
        }
    }

    /// Run `action` against the current subscription.
    pub async fn manage_subscription(
        &self,
        state: &SubscriptionState,
        action: ManageAction,
    ) -> Result<ManageOutcome, ActionError> {
        let result = match action {
            ManageAction::Portal => self.open_portal(state).await,
            ManageAction::Cancel => self.set_cancellation(state, action, true).await,
            ManageAction::Reactivate => self.set_cancellation(state, action, false).await,
        };

        if let Err(e) = &result {
            warn!("{} failed: {}", action, e);
            self.in_flight.send_replace(false);
            let title = match action {
                ManageAction::Portal => "Could not open billing portal",
                ManageAction::Cancel => "Could not cancel subscription",
                ManageAction::Reactivate => "Could not reactivate subscription",
            };
            self.ctx
                .notifier
                .notify(Notice::error(title, e.user_message()));
        }
        result
    }

    /// Ends in navigation, so the in-flight flag stays set on success.
    async fn open_portal(&self, state: &SubscriptionState) -> Result<ManageOutcome, ActionError> {
        let customer_id = state
            .current_subscription()
            .and_then(|s| s.external_customer_id().map(str::to_string))
            .ok_or(ActionError::NoBillingCustomer)?;

        self.in_flight.send_replace(true);
        let body = json!({
            "customerId": customer_id,
            "returnUrl": format!("{}/account", self.ctx.config.origin()),
        });
        let data = self.invoke(ManageAction::Portal, body).await?;
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ActionError::remote("No billing portal URL was returned."))?;

        self.ctx
            .navigator
            .redirect(url)
            .map_err(|e| ActionError::remote(e.to_string()))?;
        info!("Opened billing portal");
        Ok(ManageOutcome::Redirected(Redirect {
            url: url.to_string(),
        }))
    }

    async fn set_cancellation(
        &self,
        state: &SubscriptionState,
        action: ManageAction,
        cancel: bool,
    ) -> Result<ManageOutcome, ActionError> {
        let subscription = state
            .current_subscription()
            .ok_or(ActionError::NoActiveSubscription)?;
        let subscription_id = subscription
            .external_subscription_id()
            .ok_or(ActionError::NoActiveSubscription)?
            .to_string();

        self.in_flight.send_replace(true);
        self.invoke(action, json!({ "subscriptionId": subscription_id }))
            .await?;

        self.cancel_at_period_end.send_replace(Some(PendingFlag {
            value: cancel,
            generation: state.subscription_generation(),
        }));
        self.ctx.bus.invalidate(SUBSCRIPTIONS_TABLE);
        self.in_flight.send_replace(false);

        let notice = if cancel {
            let until = subscription
                .formatted_period_end()
                .map(|end| format!(" You keep access until {}.", end))
                .unwrap_or_default();
            Notice::success(
                "Subscription canceled",
                format!("Your subscription will not renew.{}", until),
            )
        } else {
            Notice::success("Subscription reactivated", "Your subscription will renew as usual.")
        };
        self.ctx.notifier.notify(notice);
        info!("{} succeeded for {}", action, subscription.user_id);

        Ok(ManageOutcome::Updated {
            cancel_at_period_end: cancel,
        })
    }

    async fn invoke(&self, action: ManageAction, body: Value) -> Result<Value, ActionError> {
        self.ctx
            .gateway
            .invoke_function(action.function(), FunctionRequest::post(body))
            .await?
            .into_result()
            .map_err(ActionError::remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parsing() {
        assert_eq!("Cancel".parse::<ManageAction>(), Ok(ManageAction::Cancel));
        assert_eq!("portal".parse::<ManageAction>(), Ok(ManageAction::Portal));
        assert!("refund".parse::<ManageAction>().is_err());
        assert_eq!(ManageAction::Reactivate.function(), "reactivate-subscription");
    }
}
