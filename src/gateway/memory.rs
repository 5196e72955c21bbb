//! In-process implementation of [`RemoteGateway`] backed by plain vectors of
//! JSON rows, used by the test suite and for offline runs.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{
    ChangeEvent, ChangeFeed, ChangeKind, Filter, FunctionRequest, FunctionResponse, Query,
    RemoteGateway,
};
use crate::auth::Session;
use crate::error::{GatewayError, GatewayResult};

type FunctionHandler = Arc<dyn Fn(&FunctionRequest) -> GatewayResult<FunctionResponse> + Send + Sync>;
type RpcHandler = Arc<dyn Fn(&Value) -> GatewayResult<Value> + Send + Sync>;

struct FeedEntry {
    id: u64,
    table: String,
    filter: Option<Filter>,
    event: Option<ChangeKind>,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

impl FeedEntry {
    fn wants(&self, event: &ChangeEvent) -> bool {
        if self.table != event.table {
            return false;
        }
        if matches!(self.event, Some(kind) if kind != event.kind) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => {
                let row = match event.kind {
                    ChangeKind::Delete => event.old_record.as_ref().or(event.record.as_ref()),
                    _ => event.record.as_ref(),
                };
                row.map(|row| filter.matches(row)).unwrap_or(false)
            }
        }
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Value>>,
    query_failures: HashMap<String, String>,
    queries: Vec<(String, Query)>,
    functions: HashMap<String, FunctionHandler>,
    function_calls: Vec<(String, FunctionRequest)>,
    rpcs: HashMap<String, RpcHandler>,
    rpc_calls: Vec<(String, Value)>,
    feeds: Vec<FeedEntry>,
    next_feed_id: u64,
    subscribe_count: usize,
    unsubscribe_count: usize,
    fail_inserts: bool,
}

/// Records every call it receives so tests can assert on traffic.
#[derive(Clone)]
pub struct InMemoryGateway {
    state: Arc<Mutex<State>>,
    session: Arc<watch::Sender<Option<Session>>>,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            session: Arc::new(session),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Session reported to callers; `None` means signed out.
    pub fn set_session(&self, session: Option<Session>) {
        self.session.send_replace(session);
    }

    /// Replace the contents of `table` without emitting change events.
    pub fn set_rows(&self, table: &str, rows: Vec<Value>) {
        self.lock().tables.insert(table.to_string(), rows);
    }

    /// Current rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Make every query against `table` fail with `message` (`None` clears).
    pub fn fail_queries(&self, table: &str, message: Option<&str>) {
        let mut state = self.lock();
        match message {
            Some(message) => {
                state
                    .query_failures
                    .insert(table.to_string(), message.to_string());
            }
            None => {
                state.query_failures.remove(table);
            }
        }
    }

    /// Make every insert fail with a server error.
    pub fn fail_inserts(&self, fail: bool) {
        self.lock().fail_inserts = fail;
    }

    /// Script the response of function `name`.
    pub fn on_function<F>(&self, name: &str, handler: F)
    where
        F: Fn(&FunctionRequest) -> GatewayResult<FunctionResponse> + Send + Sync + 'static,
    {
        self.lock()
            .functions
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Script the result of procedure `name`.
    pub fn on_rpc<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> GatewayResult<Value> + Send + Sync + 'static,
    {
        self.lock().rpcs.insert(name.to_string(), Arc::new(handler));
    }

    /// Push `event` to every live subscription that wants it; returns how many
    /// subscriptions received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for feed in state.feeds.iter().filter(|feed| feed.wants(&event)) {
            if feed.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!("Emitted {} on {} to {} feeds", event.kind.as_str(), event.table, delivered);
        delivered
    }

    /// Number of queries issued against `table`.
    pub fn query_count(&self, table: &str) -> usize {
        self.lock().queries.iter().filter(|(t, _)| t == table).count()
    }

    pub fn queries(&self, table: &str) -> Vec<Query> {
        self.lock()
            .queries
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, q)| q.clone())
            .collect()
    }

    /// Every function call so far, in order.
    pub fn function_calls(&self) -> Vec<(String, FunctionRequest)> {
        self.lock().function_calls.clone()
    }

    pub fn function_call_count(&self, name: &str) -> usize {
        self.lock()
            .function_calls
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    pub fn rpc_call_count(&self, name: &str) -> usize {
        self.lock().rpc_calls.iter().filter(|(n, _)| n == name).count()
    }

    /// Total network-equivalent calls: queries, inserts excluded.
    pub fn remote_call_count(&self) -> usize {
        let state = self.lock();
        state.queries.len() + state.function_calls.len() + state.rpc_calls.len()
    }

    /// Open change feeds on `table`.
    pub fn active_feeds(&self, table: &str) -> usize {
        self.lock().feeds.iter().filter(|f| f.table == table).count()
    }

    pub fn active_feed_filters(&self, table: &str) -> Vec<Option<Filter>> {
        self.lock()
            .feeds
            .iter()
            .filter(|f| f.table == table)
            .map(|f| f.filter.clone())
            .collect()
    }

    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribe_count
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.lock().unsubscribe_count
    }
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn session(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    fn auth_changes(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    async fn query_table(&self, table: &str, query: &Query) -> GatewayResult<Value> {
        tokio::task::yield_now().await;

        let mut rows = {
            let mut state = self.lock();
            state.queries.push((table.to_string(), query.clone()));
            if let Some(message) = state.query_failures.get(table) {
                return Err(GatewayError::Status {
                    status: 500,
                    message: message.clone(),
                });
            }
            state.tables.get(table).cloned().unwrap_or_default()
        };

        if let Some(filter) = &query.filter {
            rows.retain(|row| filter.matches(row));
        }
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_json(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        if query.single {
            Ok(rows.into_iter().next().unwrap_or(Value::Null))
        } else {
            Ok(Value::Array(rows))
        }
    }

    async fn insert_row(&self, table: &str, row: Value) -> GatewayResult<()> {
        {
            let mut state = self.lock();
            if state.fail_inserts {
                return Err(GatewayError::Status {
                    status: 500,
                    message: format!("insert into {} rejected", table),
                });
            }
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
        }
        self.emit(ChangeEvent::new(table, ChangeKind::Insert, Some(row)));
        Ok(())
    }

    async fn subscribe_to_table(
        &self,
        table: &str,
        filter: Option<&Filter>,
        event: Option<ChangeKind>,
    ) -> GatewayResult<ChangeFeed> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            state.next_feed_id += 1;
            let id = state.next_feed_id;
            state.subscribe_count += 1;
            state.feeds.push(FeedEntry {
                id,
                table: table.to_string(),
                filter: filter.cloned(),
                event,
                sender,
            });
            id
        };

        let state = self.state.clone();
        Ok(ChangeFeed::new(receiver, move || {
            let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.feeds.retain(|feed| feed.id != id);
            state.unsubscribe_count += 1;
        }))
    }

    async fn invoke_function(
        &self,
        name: &str,
        request: FunctionRequest,
    ) -> GatewayResult<FunctionResponse> {
        tokio::task::yield_now().await;
        let handler = {
            let mut state = self.lock();
            state.function_calls.push((name.to_string(), request.clone()));
            state.functions.get(name).cloned()
        };
        match handler {
            Some(handler) => handler(&request),
            None => Ok(FunctionResponse::err(format!("function {} not found", name))),
        }
    }

    async fn rpc(&self, name: &str, args: Value) -> GatewayResult<Value> {
        tokio::task::yield_now().await;
        let handler = {
            let mut state = self.lock();
            state.rpc_calls.push((name.to_string(), args.clone()));
            state.rpcs.get(name).cloned()
        };
        match handler {
            Some(handler) => handler(&args),
            None => Err(GatewayError::Status {
                status: 404,
                message: format!("rpc {} not found", name),
            }),
        }
    }
}
