use thiserror::Error;

use crate::billing::BillingInterval;

/// Failures talking to the hosted backend.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("realtime channel error: {0}")]
    Realtime(String),

    /// The backend rejected the caller's credentials (HTTP 401).
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Whether the server refused the credentials themselves, as opposed to a
    /// transport or server fault that may go away on retry. Refresh tokens
    /// that are revoked or unknown come back as 400 `invalid_grant`.
    pub fn is_auth_rejection(&self) -> bool {
        match self {
            Self::NotAuthenticated(_) => true,
            Self::Status { status, .. } => matches!(status, 400 | 403),
            _ => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Outcome of an action hook that did not complete.
///
/// Every variant carries enough context to render a human-readable message;
/// see [`ActionError::user_message`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("authentication required")]
    AuthenticationRequired,

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("no active subscription")]
    NoActiveSubscription,

    #[error("no billing customer on file")]
    NoBillingCustomer,

    #[error("plan {0} not found")]
    PlanNotFound(String),

    #[error("plan {plan_id} has no {interval} price")]
    PriceUnavailable {
        plan_id: String,
        interval: BillingInterval,
    },

    #[error("remote call failed: {0}")]
    Remote(String),
}

pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong. Please try again.";

impl ActionError {
    /// Message suitable for a notification.
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthenticationRequired => "Please sign in to continue.".to_string(),
            Self::Validation(reason) => reason.clone(),
            Self::NoActiveSubscription => "You don't have an active subscription.".to_string(),
            Self::NoBillingCustomer => "No billing account found for this user.".to_string(),
            Self::PlanNotFound(_) => "The selected plan is no longer available.".to_string(),
            Self::PriceUnavailable { interval, .. } => {
                format!("This plan is not offered with {} billing.", interval.adjective())
            }
            Self::Remote(message) if message.trim().is_empty() => {
                GENERIC_FAILURE_MESSAGE.to_string()
            }
            Self::Remote(message) => message.clone(),
        }
    }

    /// Wraps a remote failure, falling back to the generic text when the
    /// backend gave no message.
    pub fn remote(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() {
            Self::Remote(GENERIC_FAILURE_MESSAGE.to_string())
        } else {
            Self::Remote(message)
        }
    }
}

impl From<GatewayError> for ActionError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotAuthenticated(_) => Self::AuthenticationRequired,
            GatewayError::Status { message, .. } => Self::remote(message),
            other => Self::remote(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration value: {0}")]
    Missing(&'static str),

    #[error("invalid url for {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_falls_back_to_generic_text() {
        assert_eq!(ActionError::remote("  ").user_message(), GENERIC_FAILURE_MESSAGE);
        assert_eq!(
            ActionError::Remote(String::new()).user_message(),
            GENERIC_FAILURE_MESSAGE
        );
        assert_eq!(ActionError::remote("card declined").user_message(), "card declined");
    }

    #[test]
    fn test_gateway_errors_map_to_action_errors() {
        assert_eq!(
            ActionError::from(GatewayError::NotAuthenticated("JWT expired".to_string())),
            ActionError::AuthenticationRequired
        );
        let status = GatewayError::Status {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(ActionError::from(status), ActionError::Remote("boom".to_string()));
    }

    #[test]
    fn test_auth_rejection_is_told_apart_from_outages() {
        assert!(GatewayError::NotAuthenticated(String::new()).is_auth_rejection());
        let invalid_grant = GatewayError::Status {
            status: 400,
            message: "Invalid Refresh Token: Refresh Token Not Found".to_string(),
        };
        assert!(invalid_grant.is_auth_rejection());
        let outage = GatewayError::Status {
            status: 503,
            message: String::new(),
        };
        assert!(!outage.is_auth_rejection());
        assert!(!GatewayError::Realtime("closed".to_string()).is_auth_rejection());
    }
}
