//! Access to the hosted backend: table queries, inserts, the live change
//! feed, serverless functions and remote procedures.
//!
//! Everything above this module talks to a [`RemoteGateway`] trait object so
//! that the HTTP implementation can be swapped for [`memory::InMemoryGateway`]
//! in tests.

pub mod memory;
pub mod realtime;
pub mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::{mpsc, watch};

use crate::auth::Session;
use crate::error::GatewayResult;

pub use memory::InMemoryGateway;
pub use realtime::RealtimeClient;
pub use rest::HttpGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Like => "like",
            Self::ILike => "ilike",
        }
    }
}

/// Single-column row filter, e.g. `user_id = eq.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Equality filter, the common case.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    /// Right-hand side of a query-string filter: `eq.42`.
    pub fn to_query_value(&self) -> String {
        format!("{}.{}", self.op.as_str(), self.value)
    }

    /// Filter expression understood by the realtime service: `user_id=eq.42`.
    pub fn to_realtime(&self) -> String {
        format!("{}={}.{}", self.column, self.op.as_str(), self.value)
    }

    /// Evaluate the filter against a JSON row.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(field) = row.get(&self.column) else {
            return false;
        };
        let actual = match field {
            Value::String(s) => s.clone(),
            Value::Null => return false,
            other => other.to_string(),
        };

        match self.op {
            FilterOp::Eq => actual == self.value,
            FilterOp::Neq => actual != self.value,
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                let ordering = match (actual.parse::<f64>(), self.value.parse::<f64>()) {
                    (Ok(a), Ok(b)) => a.partial_cmp(&b),
                    _ => Some(actual.as_str().cmp(self.value.as_str())),
                };
                let Some(ordering) = ordering else {
                    return false;
                };
                match self.op {
                    FilterOp::Gt => ordering.is_gt(),
                    FilterOp::Gte => ordering.is_ge(),
                    FilterOp::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }
            }
            FilterOp::Like => like_match(&actual, &self.value),
            FilterOp::ILike => like_match(&actual.to_lowercase(), &self.value.to_lowercase()),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_realtime())
    }
}

/// `%`-wildcard matching as used by SQL `LIKE`.
fn like_match(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }

    /// PostgREST `order` value, e.g. `price_monthly.asc`.
    pub fn to_query_value(&self) -> String {
        format!(
            "{}.{}",
            self.column,
            if self.ascending { "asc" } else { "desc" }
        )
    }
}

/// Read criteria for [`RemoteGateway::query_table`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub select: Option<String>,
    pub filter: Option<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
    /// Return one row (or `null`) instead of an array.
    pub single: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Row-level notification from the live change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Option<Value>,
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind, record: Option<Value>) -> Self {
        Self {
            table: table.into(),
            kind,
            record,
            old_record: None,
        }
    }
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Handle on one live change-feed subscription.
///
/// The subscription is released exactly once: by [`ChangeFeed::unsubscribe`]
/// or, failing that, when the handle is dropped.
pub struct ChangeFeed {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    unsubscribe: Option<Unsubscribe>,
}

impl ChangeFeed {
    pub fn new<F>(events: mpsc::UnboundedReceiver<ChangeEvent>, unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            events,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Next event, or `None` once the feed has been closed by the server.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Stop receiving events and release the subscription.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            self.events.close();
            unsubscribe();
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Arguments to a serverless function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRequest {
    pub method: HttpMethod,
    pub body: Option<Value>,
}

impl FunctionRequest {
    pub fn get() -> Self {
        Self {
            method: HttpMethod::Get,
            body: None,
        }
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
        }
    }
}

/// `{ data, error }` envelope returned by a serverless function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl FunctionResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }

    /// Collapse the envelope. An `error` string inside `data` counts as a
    /// failure too, since functions report domain errors that way.
    pub fn into_result(self) -> Result<Value, String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let data = self.data.unwrap_or(Value::Null);
        if let Some(error) = data.get("error").and_then(Value::as_str) {
            return Err(error.to_string());
        }
        Ok(data)
    }
}

/// Contract of the hosted backend as seen by this client.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Current authenticated principal, if any.
    async fn session(&self) -> Option<Session>;

    /// Stream of principal changes (sign-in, refresh, sign-out).
    fn auth_changes(&self) -> watch::Receiver<Option<Session>>;

    /// Rows of `table` matching `query`: an array, or an object/`null` when
    /// `query.single` is set.
    async fn query_table(&self, table: &str, query: &Query) -> GatewayResult<Value>;

    async fn insert_row(&self, table: &str, row: Value) -> GatewayResult<()>;

    /// Open a live subscription on `table`; `event == None` means every kind.
    async fn subscribe_to_table(
        &self,
        table: &str,
        filter: Option<&Filter>,
        event: Option<ChangeKind>,
    ) -> GatewayResult<ChangeFeed>;

    async fn invoke_function(
        &self,
        name: &str,
        request: FunctionRequest,
    ) -> GatewayResult<FunctionResponse>;

    async fn rpc(&self, name: &str, args: Value) -> GatewayResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_filter_rendering() {
        let filter = Filter::eq("user_id", "abc");
        assert_eq!(filter.to_query_value(), "eq.abc");
        assert_eq!(filter.to_realtime(), "user_id=eq.abc");
        assert_eq!(Order::desc("created_at").to_query_value(), "created_at.desc");
    }

    #[test]
    fn test_filter_matches_rows() {
        let row = json!({ "user_id": "abc", "count": 5, "title": "Write a Haiku" });
        assert!(Filter::eq("user_id", "abc").matches(&row));
        assert!(!Filter::eq("user_id", "xyz").matches(&row));
        assert!(Filter::new("count", FilterOp::Gte, "5").matches(&row));
        assert!(!Filter::new("count", FilterOp::Gt, "5").matches(&row));
        assert!(Filter::new("count", FilterOp::Lt, "10").matches(&row));
        assert!(Filter::new("title", FilterOp::ILike, "%haiku").matches(&row));
        assert!(Filter::new("title", FilterOp::Like, "Write%").matches(&row));
        assert!(!Filter::new("title", FilterOp::Like, "write%").matches(&row));
        assert!(!Filter::eq("missing", "x").matches(&row));
    }

    #[test]
    fn test_function_response_errors() {
        assert_eq!(
            FunctionResponse::err("nope").into_result(),
            Err("nope".to_string())
        );
        assert_eq!(
            FunctionResponse::ok(json!({ "error": "Invalid price" })).into_result(),
            Err("Invalid price".to_string())
        );
        assert_eq!(
            FunctionResponse::ok(json!({ "url": "https://x" })).into_result(),
            Ok(json!({ "url": "https://x" }))
        );
    }

    #[tokio::test]
    async fn test_change_feed_unsubscribes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel();
        let counter = calls.clone();
        let feed = ChangeFeed::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        feed.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (_tx, rx) = mpsc::unbounded_channel();
        let counter = calls.clone();
        let feed = ChangeFeed::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(feed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
