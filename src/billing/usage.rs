use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::subscription::SUBSCRIPTIONS_TABLE;
use super::{PromptUsage, UsageKey};
use crate::context::ClientContext;
use crate::error::ActionError;
use crate::gateway::Filter;
use crate::notify::Notice;
use crate::sync::{LiveQuery, QuerySpec};

pub const USAGE_TABLE: &str = "prompt_usage";

/// Picks the current month's row out of a user's usage history.
fn current_usage(rows: Value, user_id: &str, default_limit: i64) -> anyhow::Result<PromptUsage> {
    let rows: Vec<PromptUsage> = serde_json::from_value(rows)?;
    let key = UsageKey::current();
    Ok(rows
        .into_iter()
        .find(|row| row.key() == key)
        .unwrap_or_else(|| PromptUsage::fresh(user_id, key, default_limit)))
}

fn rpc_bool(value: &Value, name: &str) -> Result<bool, ActionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => {
            warn!("Unexpected {} response: {}", name, other);
            Err(ActionError::remote(String::new()))
        }
    }
}

/// Monthly prompt quota for one user.
pub struct UsageTracker {
    ctx: ClientContext,
    user_id: Option<String>,
    usage: Option<LiveQuery<PromptUsage>>,
}

impl UsageTracker {
    /// Mount the usage summary for `user_id`; nothing is fetched when signed out.
    pub async fn mount(ctx: &ClientContext, user_id: Option<&str>) -> Self {
        let usage = match user_id {
            Some(user_id) => {
                let owner = user_id.to_string();
                let default_limit = ctx.config.default_prompt_limit;
                let spec = QuerySpec::shaped(USAGE_TABLE, move |rows| {
                    current_usage(rows, &owner, default_limit)
                })
                .filter(Filter::eq("user_id", user_id))
                .depends_on(SUBSCRIPTIONS_TABLE);
                Some(LiveQuery::mount(ctx, spec).await)
            }
            None => None,
        };

        Self {
            ctx: ctx.clone(),
            user_id: user_id.map(str::to_string),
            usage,
        }
    }

    /// Usage for the current calendar month (UTC).
    pub fn usage(&self) -> Option<PromptUsage> {
        self.usage.as_ref()?.data()
    }

    /// Prompts left this month, once loaded.
    pub fn remaining(&self) -> Option<i64> {
        self.usage().map(|usage| usage.remaining())
    }

    /// Cached view for display; [`track_prompt_usage`](Self::track_prompt_usage)
    /// always asks the server.
    pub fn has_remaining_prompts(&self) -> bool {
        self.usage().map(|usage| usage.has_remaining()).unwrap_or(false)
    }

    pub fn is_loading(&self) -> bool {
        self.usage.as_ref().map(|q| q.is_loading()).unwrap_or(false)
    }

    /// Re-fetch the usage summary.
    pub async fn refresh(&self) {
        if let Some(usage) = &self.usage {
            usage.refetch().await;
        }
    }

    /// Record one prompt. Returns `false` when the quota is exhausted or the
    /// call failed; both cases are reported through the notifier.
    pub async fn track_prompt_usage(&self) -> bool {
        let Some(user_id) = self.user_id.as_deref() else {
            self.ctx.notifier.notify(Notice::error(
                "Sign in required",
                ActionError::AuthenticationRequired.user_message(),
            ));
            return false;
        };

        match self.record(user_id).await {
            Ok(true) => {
                self.ctx.bus.invalidate(USAGE_TABLE);
                true
            }
            Ok(false) => {
                info!("Prompt quota exhausted for {}", user_id);
                self.ctx.notifier.notify(Notice::warning(
                    "Monthly limit reached",
                    "You've used all your prompts for this month. Upgrade your plan to keep going.",
                ));
                false
            }
            Err(e) => {
                warn!("Failed to track prompt usage: {}", e);
                self.ctx
                    .notifier
                    .notify(Notice::error("Could not record usage", e.user_message()));
                false
            }
        }
    }

    async fn record(&self, user_id: &str) -> Result<bool, ActionError> {
        let args = json!({ "p_user_id": user_id });

        let remaining = self.ctx.gateway.rpc("has_remaining_prompts", args.clone()).await?;
        if !rpc_bool(&remaining, "has_remaining_prompts")? {
            return Ok(false);
        }

        // The increment re-checks the limit atomically; `false` means another
        // client used the last prompt in the meantime.
        let incremented = self.ctx.gateway.rpc("increment_prompt_usage", args).await?;
        let recorded = match incremented {
            Value::Null => true,
            other => rpc_bool(&other, "increment_prompt_usage")?,
        };
        debug!("Prompt usage recorded for {}: {}", user_id, recorded);
        Ok(recorded)
    }

    /// Release the change feed.
    pub async fn unmount(self) {
        if let Some(usage) = self.usage {
            usage.unmount().await;
        }
    }
}
