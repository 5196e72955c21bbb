//! Site-wide settings editable by administrators.

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::context::ClientContext;
use crate::error::ActionError;
use crate::gateway::FunctionRequest;
use crate::notify::Notice;

const STATUS_FUNCTION: &str = "check-admin-status";
const SETTINGS_FUNCTION: &str = "admin-settings";

pub type SettingsMap = Map<String, Value>;

pub struct AdminSettings {
    ctx: ClientContext,
}

impl AdminSettings {
    pub fn new(ctx: &ClientContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    async fn require_session(&self) -> Result<(), ActionError> {
        match self.ctx.gateway.session().await {
            Some(_) => Ok(()),
            None => Err(ActionError::AuthenticationRequired),
        }
    }

    /// Whether the signed-in user may edit settings. Signed-out users are not.
    pub async fn is_admin(&self) -> Result<bool, ActionError> {
        if self.require_session().await.is_err() {
            return Ok(false);
        }
        let data = self
            .ctx
            .gateway
            .invoke_function(STATUS_FUNCTION, FunctionRequest::get())
            .await?
            .into_result()
            .map_err(ActionError::remote)?;
        let is_admin = data
            .get("isAdmin")
            .or_else(|| data.get("is_admin"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        debug!("Admin status: {}", is_admin);
        Ok(is_admin)
    }

    /// Current settings map; empty when none are stored.
    pub async fn get(&self) -> Result<SettingsMap, ActionError> {
        self.require_session().await?;
        let data = self
            .ctx
            .gateway
            .invoke_function(SETTINGS_FUNCTION, FunctionRequest::get())
            .await?
            .into_result()
            .map_err(ActionError::remote)?;

        match data.get("settings").cloned().unwrap_or(data) {
            Value::Object(settings) => Ok(settings),
            Value::Null => Ok(SettingsMap::new()),
            other => {
                warn!("Unexpected admin settings payload: {}", other);
                Err(ActionError::remote(String::new()))
            }
        }
    }

    /// Save `settings` and report the outcome as a notice.
    pub async fn update(&self, settings: SettingsMap) -> Result<(), ActionError> {
        let result = self.save(settings).await;
        match &result {
            Ok(()) => {
                info!("Admin settings saved");
                self.ctx
                    .notifier
                    .notify(Notice::success("Settings saved", "Your changes are live."));
            }
            Err(e) => {
                warn!("Failed to save admin settings: {}", e);
                self.ctx
                    .notifier
                    .notify(Notice::error("Could not save settings", e.user_message()));
            }
        }
        result
    }

    async fn save(&self, settings: SettingsMap) -> Result<(), ActionError> {
        self.require_session().await?;
        if settings.is_empty() {
            return Err(ActionError::Validation("Nothing to save.".to_string()));
        }
        self.ctx
            .gateway
            .invoke_function(
                SETTINGS_FUNCTION,
                FunctionRequest::post(json!({ "settings": settings })),
            )
            .await?
            .into_result()
            .map_err(ActionError::remote)?;
        Ok(())
    }
}
