//! Generic query hook: fetch a table, keep it fresh from the change feed.
//!
//! A mounted [`LiveQuery`] owns exactly one change-feed subscription and one
//! background task. Every change event, and every invalidation of a table the
//! query depends on, causes one full re-fetch; events are never patched into
//! the cached data.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::InvalidationBus;
use crate::context::ClientContext;
use crate::error::ActionError;
use crate::gateway::{ChangeEvent, ChangeFeed, ChangeKind, Filter, Order, Query, RemoteGateway};
use crate::notify::{Notice, Notifier};

pub type Shape<T> = Arc<dyn Fn(Value) -> anyhow::Result<T> + Send + Sync>;

/// What to fetch and how to turn the rows into `T`.
pub struct QuerySpec<T> {
    table: String,
    query: Query,
    event: Option<ChangeKind>,
    depends_on: Vec<String>,
    shape: Shape<T>,
}

impl<T: DeserializeOwned + 'static> QuerySpec<T> {
    /// Rows are decoded straight into `T`.
    pub fn new(table: impl Into<String>) -> Self {
        Self::shaped(table, |rows| Ok(serde_json::from_value(rows)?))
    }
}

impl<T> QuerySpec<T> {
    /// Rows are passed through `shape` to build `T`.
    pub fn shaped<F>(table: impl Into<String>, shape: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            table: table.into(),
            query: Query::new(),
            event: None,
            depends_on: Vec::new(),
            shape: Arc::new(shape),
        }
    }

    /// Columns to return, in PostgREST select syntax.
    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.query = self.query.select(columns);
        self
    }

    /// Scope the rows and the change feed to one column condition.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.query = self.query.filter(filter);
        self
    }

    /// Sort order of the returned rows.
    pub fn order(mut self, order: Order) -> Self {
        self.query = self.query.order(order);
        self
    }

    /// Cap the number of rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.query = self.query.limit(limit);
        self
    }

    /// Expect at most one row; `T` receives an object or `null`.
    pub fn single(mut self) -> Self {
        self.query = self.query.single();
        self
    }

    /// Only listen for one kind of change.
    pub fn on_event(mut self, kind: ChangeKind) -> Self {
        self.event = Some(kind);
        self
    }

    /// Re-fetch when `table` is invalidated too.
    pub fn depends_on(mut self, table: impl Into<String>) -> Self {
        self.depends_on.push(table.into());
        self
    }
}

/// Observable state of a [`LiveQuery`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// Last good result; `None` until the first success.
    pub data: Option<T>,
    /// True from mount until the first fetch settles, and during re-fetches.
    pub is_loading: bool,
    /// User-facing message of the last failure.
    pub error: Option<String>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: true,
            error: None,
        }
    }
}

struct Core<T> {
    gateway: Arc<dyn RemoteGateway>,
    notifier: Arc<dyn Notifier>,
    table: String,
    query: Mutex<Query>,
    event: Option<ChangeKind>,
    depends_on: Vec<String>,
    shape: Shape<T>,
    state: watch::Sender<QueryState<T>>,
    issued: AtomicU64,
    applied: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Core<T> {
    fn query(&self) -> MutexGuard<'_, Query> {
        self.query.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn depends_on(&self, table: &str) -> bool {
        self.table == table || self.depends_on.iter().any(|t| t == table)
    }

    /// Fetch and publish. A result is applied only when no newer fetch has
    /// been issued in the meantime; older results are dropped.
    async fn fetch(&self) {
        let sequence = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let query = self.query().clone();
        self.state.send_modify(|state| state.is_loading = true);

        let result = match self.gateway.query_table(&self.table, &query).await {
            Ok(rows) => (self.shape)(rows).map_err(|e| {
                warn!("Unexpected {} data: {}", self.table, e);
                ActionError::remote(String::new()).user_message()
            }),
            Err(e) => {
                warn!("Failed to fetch {}: {}", self.table, e);
                Err(ActionError::from(e).user_message())
            }
        };

        if sequence != self.issued.load(Ordering::SeqCst) {
            debug!("Discarding superseded fetch #{} of {}", sequence, self.table);
            return;
        }

        match result {
            Ok(data) => {
                self.applied.fetch_add(1, Ordering::SeqCst);
                self.state.send_modify(|state| {
                    state.data = Some(data);
                    state.is_loading = false;
                    state.error = None;
                });
            }
            Err(message) => {
                self.notifier.notify(Notice::error(
                    format!("Could not load {}", self.table.replace('_', " ")),
                    message.clone(),
                ));
                self.state.send_modify(|state| {
                    state.is_loading = false;
                    state.error = Some(message);
                });
            }
        }
    }

    /// Forget cached data and supersede any fetch still in flight.
    fn reset(&self) {
        self.issued.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(QueryState::default());
    }

    async fn open_feed(&self) -> Option<ChangeFeed> {
        let filter = self.query().filter.clone();
        match self
            .gateway
            .subscribe_to_table(&self.table, filter.as_ref(), self.event)
            .await
        {
            Ok(feed) => {
                debug!("Subscribed to {} changes", self.table);
                Some(feed)
            }
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", self.table, e);
                None
            }
        }
    }
}

async fn next_change(feed: &mut Option<ChangeFeed>) -> Option<ChangeEvent> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

async fn listen<T: Clone + Send + Sync + 'static>(
    core: Arc<Core<T>>,
    mut feed: Option<ChangeFeed>,
    mut invalidations: broadcast::Receiver<String>,
) {
    loop {
        tokio::select! {
            change = next_change(&mut feed) => match change {
                Some(change) => {
                    debug!("{} {} event, refetching", change.table, change.kind.as_str());
                    core.fetch().await;
                }
                None => {
                    warn!("Change feed for {} closed", core.table);
                    feed = None;
                }
            },
            table = invalidations.recv() => match table {
                Ok(table) if core.depends_on(&table) => core.fetch().await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Missed {} invalidations, refetching {}", missed, core.table);
                    core.fetch().await;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

/// A mounted, self-refreshing query.
pub struct LiveQuery<T> {
    core: Arc<Core<T>>,
    bus: InvalidationBus,
    listener: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> LiveQuery<T> {
    /// Fetch once, then subscribe to changes scoped to the table and filter.
    pub async fn mount(ctx: &ClientContext, spec: QuerySpec<T>) -> Self {
        let core = Arc::new(Core {
            gateway: ctx.gateway.clone(),
            notifier: ctx.notifier.clone(),
            table: spec.table,
            query: Mutex::new(spec.query),
            event: spec.event,
            depends_on: spec.depends_on,
            shape: spec.shape,
            state: watch::channel(QueryState::default()).0,
            issued: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        });

        let mut query = Self {
            core,
            bus: ctx.bus.clone(),
            listener: None,
        };
        query.core.fetch().await;
        query.start_listener().await;
        query
    }

    /// Table this query reads.
    pub fn table(&self) -> &str {
        &self.core.table
    }

    /// Filter currently scoping both the fetch and the change feed.
    pub fn filter(&self) -> Option<Filter> {
        self.core.query().filter.clone()
    }

    /// Snapshot of data, loading flag and last error.
    pub fn state(&self) -> QueryState<T> {
        self.core.state.borrow().clone()
    }

    /// Last successfully fetched data, kept across failed re-fetches.
    pub fn data(&self) -> Option<T> {
        self.core.state.borrow().data.clone()
    }

    /// True until the first fetch settles, and while a re-fetch is running.
    pub fn is_loading(&self) -> bool {
        self.core.state.borrow().is_loading
    }

    /// Message of the most recent failed fetch, cleared by the next success.
    pub fn error(&self) -> Option<String> {
        self.core.state.borrow().error.clone()
    }

    /// Count of fetch results applied so far. Grows by one per success, so a
    /// caller can tell whether fresh data arrived since it last looked.
    pub fn generation(&self) -> u64 {
        self.core.applied.load(Ordering::SeqCst)
    }

    /// Watch every state change.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.core.state.subscribe()
    }

    /// Fetch now, outside the change feed.
    pub async fn refetch(&self) {
        self.core.fetch().await;
    }

    /// Re-scope the query. A different filter replaces the change-feed
    /// subscription before re-fetching. Data cached under the old filter is
    /// dropped, so readers see a loading state rather than another scope's rows.
    pub async fn set_filter(&mut self, filter: Option<Filter>) {
        if self.core.query().filter == filter {
            return;
        }
        self.stop_listener().await;
        self.core.reset();
        self.core.query().filter = filter;
        self.start_listener().await;
        self.core.fetch().await;
    }

    /// Release the subscription. In-flight fetches are abandoned.
    pub async fn unmount(mut self) {
        self.stop_listener().await;
        debug!("Unmounted live query on {}", self.core.table);
    }

    async fn start_listener(&mut self) {
        let invalidations = self.bus.subscribe();
        let feed = self.core.open_feed().await;
        self.listener = Some(tokio::spawn(listen(self.core.clone(), feed, invalidations)));
    }

    async fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            let _ = listener.await;
        }
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::gateway::InMemoryGateway;
    use crate::navigation::BrowserNavigator;
    use crate::notify::LogNotifier;
    use serde_json::json;
    use tokio::time::{sleep, Duration};

    fn context(gateway: &InMemoryGateway) -> ClientContext {
        ClientContext::new(
            Arc::new(gateway.clone()),
            Arc::new(LogNotifier),
            Arc::new(BrowserNavigator),
            ClientConfig::default(),
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_mount_fetches_and_subscribes_once() {
        let gateway = InMemoryGateway::new();
        gateway.set_rows("prompts", vec![json!({ "id": 1 })]);
        let query = LiveQuery::<Vec<Value>>::mount(&context(&gateway), QuerySpec::new("prompts")).await;

        let state = query.state();
        assert!(!state.is_loading);
        assert_eq!(state.data.unwrap().len(), 1);
        assert_eq!(gateway.query_count("prompts"), 1);
        assert_eq!(gateway.active_feeds("prompts"), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_previous_data() {
        let gateway = InMemoryGateway::new();
        gateway.set_rows("prompts", vec![json!({ "id": 1 })]);
        let query = LiveQuery::<Vec<Value>>::mount(&context(&gateway), QuerySpec::new("prompts")).await;

        gateway.fail_queries("prompts", Some("boom"));
        query.refetch().await;

        let state = query.state();
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert_eq!(state.data.unwrap().len(), 1);
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_invalidation_only_hits_dependents() {
        let gateway = InMemoryGateway::new();
        let ctx = context(&gateway);
        let _usage = LiveQuery::<Vec<Value>>::mount(
            &ctx,
            QuerySpec::new("prompt_usage").depends_on("user_subscriptions"),
        )
        .await;
        let _plans = LiveQuery::<Vec<Value>>::mount(&ctx, QuerySpec::new("subscription_plans")).await;

        ctx.bus.invalidate("user_subscriptions");
        eventually(|| gateway.query_count("prompt_usage") == 2).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(gateway.query_count("subscription_plans"), 1);
    }

    #[tokio::test]
    async fn test_shape_failure_reports_generic_error() {
        let gateway = InMemoryGateway::new();
        gateway.set_rows("prompts", vec![json!({ "id": "not a number" })]);
        let query = LiveQuery::mount(
            &context(&gateway),
            QuerySpec::shaped("prompts", |rows| {
                let ids: Vec<u32> = serde_json::from_value(
                    rows.as_array()
                        .map(|rows| rows.iter().map(|r| r["id"].clone()).collect())
                        .unwrap_or(Value::Null),
                )?;
                Ok(ids)
            }),
        )
        .await;

        assert!(query.data().is_none());
        assert_eq!(
            query.error().as_deref(),
            Some(crate::error::GENERIC_FAILURE_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_superseded_result_is_discarded() {
        let gateway = InMemoryGateway::new();
        gateway.set_rows("prompts", vec![json!({ "id": 1 })]);
        let query = LiveQuery::<Vec<Value>>::mount(&context(&gateway), QuerySpec::new("prompts")).await;

        gateway.set_rows("prompts", vec![json!({ "id": 1 }), json!({ "id": 2 })]);
        tokio::join!(query.refetch(), query.refetch());
        assert_eq!(query.data().unwrap().len(), 2);
        assert!(!query.is_loading());
    }
}
