use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use super::subscription::{SubscriptionState, SUBSCRIPTIONS_TABLE};
use super::BillingInterval;
use crate::context::ClientContext;
use crate::error::ActionError;
use crate::gateway::FunctionRequest;
use crate::notify::Notice;

const UPDATE_FUNCTION: &str = "update-subscription";

/// Transient state of the last plan change; reset at every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeStatus {
    pub is_changing: bool,
    pub error: Option<String>,
    pub success: bool,
}

/// Moves an existing paid subscription to another plan or interval.
pub struct SubscriptionChanger {
    ctx: ClientContext,
    status: watch::Sender<ChangeStatus>,
}

impl SubscriptionChanger {
    pub fn new(ctx: &ClientContext) -> Self {
        Self {
            ctx: ctx.clone(),
            status: watch::channel(ChangeStatus::default()).0,
        }
    }

    /// Status of the most recent change.
    pub fn status(&self) -> ChangeStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChangeStatus> {
        self.status.subscribe()
    }

    /// Switch to `plan_id` billed per `interval`. The subscription state is
    /// re-fetched on success rather than edited locally, since proration and
    /// period fields are computed server-side.
    pub async fn change_subscription(
        &self,
        state: &SubscriptionState,
        plan_id: &str,
        interval: BillingInterval,
    ) -> Result<(), ActionError> {
        self.status.send_replace(ChangeStatus {
            is_changing: true,
            error: None,
            success: false,
        });

        match self.apply(state, plan_id, interval).await {
            Ok(plan_name) => {
                info!("Subscription changed to {} ({})", plan_name, interval);
                self.ctx.bus.invalidate(SUBSCRIPTIONS_TABLE);
                self.status.send_replace(ChangeStatus {
                    is_changing: false,
                    error: None,
                    success: true,
                });
                self.ctx.notifier.notify(Notice::success(
                    "Subscription updated",
                    format!("You're now on the {} plan, billed {}.", plan_name, interval.adjective()),
                ));
                Ok(())
            }
            Err(e) => {
                warn!("Subscription change failed: {}", e);
                let message = e.user_message();
                self.status.send_replace(ChangeStatus {
                    is_changing: false,
                    error: Some(message.clone()),
                    success: false,
                });
                self.ctx
                    .notifier
                    .notify(Notice::error("Could not change plan", message));
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        state: &SubscriptionState,
        plan_id: &str,
        interval: BillingInterval,
    ) -> Result<String, ActionError> {
        let subscription = state
            .current_subscription()
            .ok_or(ActionError::NoActiveSubscription)?;
        let subscription_id = subscription
            .external_subscription_id()
            .ok_or(ActionError::NoActiveSubscription)?
            .to_string();

        let plan = state
            .plan(plan_id)
            .ok_or_else(|| ActionError::PlanNotFound(plan_id.to_string()))?;
        let price_id = plan
            .price_id(interval)
            .ok_or_else(|| ActionError::PriceUnavailable {
                plan_id: plan.id.clone(),
                interval,
            })?;

        self.ctx
            .gateway
            .invoke_function(
                UPDATE_FUNCTION,
                FunctionRequest::post(json!({
                    "subscriptionId": subscription_id,
                    "newPriceId": price_id,
                })),
            )
            .await?
            .into_result()
            .map_err(ActionError::remote)?;
        Ok(plan.name)
    }
}
