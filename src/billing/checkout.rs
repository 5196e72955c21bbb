use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use super::audit::AuditLog;
use super::{BillingInterval, SubscriptionEvent, SubscriptionEventKind};
use crate::auth::{validate_email, AuthUser};
use crate::context::ClientContext;
use crate::error::ActionError;
use crate::gateway::FunctionRequest;
use crate::navigation::Redirect;
use crate::notify::Notice;

const CHECKOUT_FUNCTION: &str = "create-checkout-session";

/// Starts a hosted checkout for a plan price.
pub struct CheckoutAction {
    ctx: ClientContext,
    audit: AuditLog,
    in_flight: watch::Sender<bool>,
}

impl CheckoutAction {
    pub fn new(ctx: &ClientContext) -> Self {
        Self {
            ctx: ctx.clone(),
            audit: AuditLog::new(ctx.gateway.clone()),
            in_flight: watch::channel(false).0,
        }
    }

    /// True while a checkout is being created.
    pub fn is_loading(&self) -> bool {
        *self.in_flight.borrow()
    }

    pub fn watch_loading(&self) -> watch::Receiver<bool> {
        self.in_flight.subscribe()
    }

    /// Create a checkout session and send the user to it.
    ///
    /// A successful call ends in navigation, so the in-flight flag is left
    /// set; only failures clear it.
    pub async fn subscribe(
        &self,
        user: Option<&AuthUser>,
        price_id: &str,
        interval: BillingInterval,
    ) -> Result<Redirect, ActionError> {
        let (user_id, email) = match self.validate(user, price_id) {
            Ok(identity) => identity,
            Err(e) => {
                self.fail_notice(&e);
                return Err(e);
            }
        };

        self.in_flight.send_replace(true);
        let metadata = json!({ "price_id": price_id, "interval": interval.as_str() });
        self.audit
            .record(SubscriptionEvent::new(
                &user_id,
                SubscriptionEventKind::CheckoutInitiated,
                metadata.clone(),
            ))
            .await;

        match self.start_session(&user_id, &email, price_id, interval).await {
            Ok(redirect) => {
                info!("Checkout started for {} ({} {})", user_id, price_id, interval);
                Ok(redirect)
            }
            Err(e) => {
                warn!("Checkout failed for {}: {}", user_id, e);
                let mut metadata = metadata;
                metadata["error"] = Value::String(e.user_message());
                self.audit
                    .record(SubscriptionEvent::new(
                        &user_id,
                        SubscriptionEventKind::CheckoutAbandoned,
                        metadata,
                    ))
                    .await;
                self.fail_notice(&e);
                self.in_flight.send_replace(false);
                Err(e)
            }
        }
    }

    fn validate(
        &self,
        user: Option<&AuthUser>,
        price_id: &str,
    ) -> Result<(String, String), ActionError> {
        let user = user.ok_or(ActionError::AuthenticationRequired)?;
        let email = user
            .email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .ok_or(ActionError::AuthenticationRequired)?;
        if user.id.trim().is_empty() {
            return Err(ActionError::AuthenticationRequired);
        }
        validate_email(email)?;
        if price_id.trim().is_empty() {
            return Err(ActionError::Validation("Please choose a plan.".to_string()));
        }
        Ok((user.id.clone(), email.to_string()))
    }

    async fn start_session(
        &self,
        user_id: &str,
        email: &str,
        price_id: &str,
        interval: BillingInterval,
    ) -> Result<Redirect, ActionError> {
        let origin = self.ctx.config.origin();
        let body = json!({
            "priceId": price_id,
            "userId": user_id,
            "email": email,
            "interval": interval.as_str(),
            "successUrl": format!("{}/subscription/success?session_id={{CHECKOUT_SESSION_ID}}", origin),
            "cancelUrl": format!("{}/pricing?canceled=true", origin),
        });

        let data = self
            .ctx
            .gateway
            .invoke_function(CHECKOUT_FUNCTION, FunctionRequest::post(body))
            .await?
            .into_result()
            .map_err(ActionError::remote)?;
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ActionError::remote("No checkout URL was returned."))?;

        self.ctx
            .navigator
            .redirect(url)
            .map_err(|e| ActionError::remote(e.to_string()))?;
        Ok(Redirect {
            url: url.to_string(),
        })
    }

    fn fail_notice(&self, error: &ActionError) {
        let title = match error {
            ActionError::AuthenticationRequired => "Sign in required",
            ActionError::Validation(_) => "Check your details",
            _ => "Checkout failed",
        };
        self.ctx
            .notifier
            .notify(Notice::error(title, error.user_message()));
    }
}
