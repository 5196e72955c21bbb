pub mod token_store;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ActionError, GatewayError, GatewayResult};

pub use token_store::TokenStore;

/// Seconds before expiry at which a session is treated as stale.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Signed-in principal plus its tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp (seconds).
    pub expires_at: i64,
    pub user: AuthUser,
}

impl Session {
    /// Expired, or within a minute of expiring, at unix time `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at - EXPIRY_MARGIN_SECS <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl From<TokenResponse> for Session {
    fn from(response: TokenResponse) -> Self {
        let expires_at = response.expires_at.unwrap_or_else(|| {
            chrono::Utc::now().timestamp() + response.expires_in.unwrap_or(3600)
        });
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at,
            user: response.user,
        }
    }
}

/// Rejects obviously malformed addresses before any network call.
pub fn validate_email(email: &str) -> Result<(), ActionError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ActionError::Validation("Email is required.".to_string()));
    }
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ActionError::Validation(
            "Please enter a valid email address.".to_string(),
        ))
    }
}

fn validate_password(password: &str) -> Result<(), ActionError> {
    if password.len() < 6 {
        return Err(ActionError::Validation(
            "Password must be at least 6 characters.".to_string(),
        ));
    }
    Ok(())
}

/// Owns the current session and publishes every change on a watch channel.
pub struct AuthManager {
    http: Client,
    auth_url: String,
    anon_key: String,
    store: Option<TokenStore>,
    session: watch::Sender<Option<Session>>,
}

impl AuthManager {
    pub fn new(config: &ClientConfig, store: Option<TokenStore>) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            http: Client::new(),
            auth_url: config.auth_url(),
            anon_key: config.supabase_anon_key.clone(),
            store,
            session,
        }
    }

    /// Restore a stored session, refreshing it when it has expired.
    pub async fn init(&self) -> anyhow::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(stored) = store.load()? else {
            debug!("No stored session");
            return Ok(());
        };

        if !stored.is_expired() {
            info!("Restored session for {}", stored.user.id);
            self.publish(Some(stored));
            return Ok(());
        }

        match self.refresh_with(&stored.refresh_token).await {
            Ok(session) => {
                info!("Refreshed stored session for {}", session.user.id);
                self.persist(&session);
                self.publish(Some(session));
            }
            Err(e) if e.is_auth_rejection() => {
                warn!("Stored session was rejected: {}", e);
                store.clear()?;
            }
            Err(e) => {
                warn!("Could not refresh stored session, keeping it: {}", e);
                self.publish(Some(stored));
            }
        }
        Ok(())
    }

    /// Session as last published.
    pub fn current_session(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    /// Receive every sign-in, refresh and sign-out.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    /// Access token of the current session, refreshed first if it is stale.
    ///
    /// Only a server rejection of the refresh token ends the session. On a
    /// transport or server fault the stale token is returned and the next
    /// call tries again.
    pub async fn access_token(&self) -> Option<String> {
        let session = self.current_session()?;
        if !session.is_expired() {
            return Some(session.access_token);
        }
        match self.refresh_with(&session.refresh_token).await {
            Ok(fresh) => {
                let token = fresh.access_token.clone();
                self.persist(&fresh);
                self.publish(Some(fresh));
                Some(token)
            }
            Err(e) if e.is_auth_rejection() => {
                warn!("Session refresh rejected, signing out: {}", e);
                if let Some(store) = &self.store {
                    if let Err(e) = store.clear() {
                        warn!("Failed to clear stored session: {}", e);
                    }
                }
                self.publish(None);
                None
            }
            Err(e) => {
                warn!("Session refresh failed, keeping session: {}", e);
                Some(session.access_token)
            }
        }
    }

    /// Password sign-in. Input is validated before any request is made.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ActionError> {
        validate_email(email)?;
        if password.is_empty() {
            return Err(ActionError::Validation("Password is required.".to_string()));
        }

        let session = self
            .token_request(
                "password",
                json!({ "email": email.trim(), "password": password }),
            )
            .await?;
        info!("Signed in as {}", session.user.id);
        self.persist(&session);
        self.publish(Some(session.clone()));
        Ok(session)
    }

    /// Create an account. Returns `None` while email confirmation is pending.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, ActionError> {
        validate_email(email)?;
        validate_password(password)?;

        let response = self
            .http
            .post(format!("{}/signup", self.auth_url))
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email.trim(), "password": password }))
            .send()
            .await
            .map_err(GatewayError::from)?;
        let body = check_status(response).await?;

        // With email confirmation enabled the response carries no tokens.
        match serde_json::from_value::<TokenResponse>(body) {
            Ok(tokens) => {
                let session = Session::from(tokens);
                self.persist(&session);
                self.publish(Some(session.clone()));
                Ok(Some(session))
            }
            Err(_) => {
                info!("Sign-up pending email confirmation");
                Ok(None)
            }
        }
    }

    /// End the session locally and on the server, and forget the stored copy.
    pub async fn sign_out(&self) -> anyhow::Result<()> {
        if let Some(session) = self.current_session() {
            let _ = self
                .http
                .post(format!("{}/logout", self.auth_url))
                .header("apikey", &self.anon_key)
                .bearer_auth(&session.access_token)
                .send()
                .await;
        }
        if let Some(store) = &self.store {
            store.clear()?;
        }
        self.publish(None);
        info!("Signed out");
        Ok(())
    }

    async fn refresh_with(&self, refresh_token: &str) -> GatewayResult<Session> {
        self.token_request("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
    }

    async fn token_request(&self, grant_type: &str, body: serde_json::Value) -> GatewayResult<Session> {
        let response = self
            .http
            .post(format!("{}/token?grant_type={}", self.auth_url, grant_type))
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;
        let body = check_status(response).await?;
        let tokens: TokenResponse = serde_json::from_value(body)?;
        Ok(tokens.into())
    }

    fn persist(&self, session: &Session) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(session) {
                warn!("Failed to persist session: {}", e);
            }
        }
    }

    fn publish(&self, session: Option<Session>) {
        self.session.send_replace(session);
    }
}

/// Turn a non-2xx response into [`GatewayError::Status`] carrying the
/// server's message (401 becomes [`GatewayError::NotAuthenticated`]),
/// otherwise return the JSON body.
pub(crate) async fn check_status(response: reqwest::Response) -> GatewayResult<serde_json::Value> {
    let status = response.status();
    let text = response.text().await?;
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(GatewayError::NotAuthenticated(error_message(&text)));
    }
    if !status.is_success() {
        return Err(GatewayError::Status {
            status: status.as_u16(),
            message: error_message(&text),
        });
    }
    if text.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// Best human-readable message from an error body.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error_description", "msg", "message", "error"] {
            if let Some(message) = value.get(key).and_then(|v| v.as_str()) {
                return message.to_string();
            }
        }
    }
    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ada@example.com").is_ok());
        assert!(validate_email("  ada@example.com ").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("ada").is_err());
        assert!(validate_email("ada@example").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("a da@example.com").is_err());
        assert!(validate_email("ada@@example.com").is_err());
    }

    #[test]
    fn test_session_expiry_margin() {
        let session = Session {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: 1_000,
            user: AuthUser {
                id: "u".to_string(),
                email: None,
            },
        };
        assert!(!session.is_expired_at(900));
        assert!(session.is_expired_at(940));
        assert!(session.is_expired_at(2_000));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#),
            "Invalid login credentials"
        );
        assert_eq!(error_message(r#"{"message":"JWT expired"}"#), "JWT expired");
        assert_eq!(error_message("  plain text "), "plain text");
    }

    #[test]
    fn test_token_response_expiry() {
        let response: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_at": 42,
            "user": { "id": "u1", "email": "u@example.com" }
        }))
        .unwrap();
        let session = Session::from(response);
        assert_eq!(session.expires_at, 42);
        assert_eq!(session.user.email.as_deref(), Some("u@example.com"));
    }

    #[tokio::test]
    async fn test_sign_in_validates_before_network() {
        let config = ClientConfig {
            supabase_url: "http://127.0.0.1:9".to_string(),
            supabase_anon_key: "anon".to_string(),
            ..Default::default()
        };
        let auth = AuthManager::new(&config, None);
        let err = auth.sign_in("not-an-email", "secret").await.unwrap_err();
        assert!(matches!(err, ActionError::Validation(_)));
        assert!(auth.current_session().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_refresh_keeps_stored_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("session.json"));
        let expired = Session {
            access_token: "stale".to_string(),
            refresh_token: "r".to_string(),
            expires_at: 1_000,
            user: AuthUser {
                id: "u1".to_string(),
                email: None,
            },
        };
        store.save(&expired).unwrap();

        let config = ClientConfig {
            supabase_url: "http://127.0.0.1:9".to_string(),
            supabase_anon_key: "anon".to_string(),
            ..Default::default()
        };
        let auth = AuthManager::new(&config, Some(TokenStore::new(store.path())));
        auth.init().await.unwrap();
        assert_eq!(auth.current_session(), Some(expired.clone()));

        assert_eq!(auth.access_token().await.as_deref(), Some("stale"));
        assert!(auth.current_session().is_some());
        assert_eq!(store.load().unwrap(), Some(expired));
    }
}
