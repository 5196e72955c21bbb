use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use super::{
    ChangeFeed, ChangeKind, Filter, FunctionRequest, FunctionResponse, HttpMethod, Query,
    RealtimeClient, RemoteGateway,
};
use crate::auth::{check_status, error_message, AuthManager, Session};
use crate::config::ClientConfig;
use crate::error::{GatewayError, GatewayResult};

/// [`RemoteGateway`] against the hosted backend: the REST table API, edge
/// functions, database procedures and the realtime socket.
pub struct HttpGateway {
    client: Client,
    rest_url: String,
    functions_url: String,
    anon_key: String,
    auth: Arc<AuthManager>,
    realtime: Arc<RealtimeClient>,
}

impl HttpGateway {
    pub fn new(config: &ClientConfig, auth: Arc<AuthManager>) -> Self {
        Self {
            client: Client::new(),
            rest_url: config.rest_url(),
            functions_url: config.functions_url(),
            anon_key: config.supabase_anon_key.clone(),
            auth,
            realtime: Arc::new(RealtimeClient::new(config)),
        }
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn realtime(&self) -> &Arc<RealtimeClient> {
        &self.realtime
    }

    /// Attach the API key and the caller's bearer token (the anon key when
    /// signed out).
    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .auth
            .access_token()
            .await
            .unwrap_or_else(|| self.anon_key.clone());
        request.header("apikey", &self.anon_key).bearer_auth(token)
    }

    fn table_url(&self, table: &str, query: &Query) -> GatewayResult<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.rest_url, table))
            .map_err(|e| GatewayError::InvalidRequest(format!("bad table url: {}", e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", query.select.as_deref().unwrap_or("*"));
            if let Some(filter) = &query.filter {
                pairs.append_pair(&filter.column, &filter.to_query_value());
            }
            if let Some(order) = &query.order {
                pairs.append_pair("order", &order.to_query_value());
            }
            let limit = if query.single { Some(1) } else { query.limit };
            if let Some(limit) = limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn session(&self) -> Option<Session> {
        self.auth.current_session()
    }

    fn auth_changes(&self) -> watch::Receiver<Option<Session>> {
        self.auth.subscribe()
    }

    async fn query_table(&self, table: &str, query: &Query) -> GatewayResult<Value> {
        let url = self.table_url(table, query)?;
        debug!("GET {}", url);
        let response = self.authorize(self.client.get(url)).await.send().await?;
        let rows = check_status(response).await?;

        if query.single {
            return Ok(match rows {
                Value::Array(rows) => rows.into_iter().next().unwrap_or(Value::Null),
                other => other,
            });
        }
        Ok(rows)
    }

    async fn insert_row(&self, table: &str, row: Value) -> GatewayResult<()> {
        let response = self
            .authorize(self.client.post(format!("{}/{}", self.rest_url, table)))
            .await
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await?;
        check_status(response).await?;
        debug!("Inserted row into {}", table);
        Ok(())
    }

    async fn subscribe_to_table(
        &self,
        table: &str,
        filter: Option<&Filter>,
        event: Option<ChangeKind>,
    ) -> GatewayResult<ChangeFeed> {
        self.realtime.set_access_token(self.auth.access_token().await);
        self.realtime.subscribe(table, filter, event)
    }

    async fn invoke_function(
        &self,
        name: &str,
        request: FunctionRequest,
    ) -> GatewayResult<FunctionResponse> {
        let url = format!("{}/{}", self.functions_url, name);
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
        };
        let mut builder = self.authorize(builder).await;
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!("Invoking function {}", name);
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::NotAuthenticated(error_message(&text)));
        }
        if !status.is_success() {
            return Ok(FunctionResponse::err(error_message(&text)));
        }
        let data = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        Ok(FunctionResponse::ok(data))
    }

    async fn rpc(&self, name: &str, args: Value) -> GatewayResult<Value> {
        let response = self
            .authorize(self.client.post(format!("{}/rpc/{}", self.rest_url, name)))
            .await
            .json(&args)
            .send()
            .await?;
        check_status(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Order;

    fn gateway() -> HttpGateway {
        let config = ClientConfig {
            supabase_url: "https://abc.supabase.co".to_string(),
            supabase_anon_key: "anon".to_string(),
            ..Default::default()
        };
        let auth = Arc::new(AuthManager::new(&config, None));
        HttpGateway::new(&config, auth)
    }

    #[test]
    fn test_table_url_encodes_query() {
        let url = gateway()
            .table_url(
                "user_subscriptions",
                &Query::new()
                    .filter(Filter::eq("user_id", "u 1"))
                    .order(Order::asc("price_monthly"))
                    .limit(5),
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://abc.supabase.co/rest/v1/user_subscriptions?select=*&user_id=eq.u+1&order=price_monthly.asc&limit=5"
        );
    }

    #[test]
    fn test_single_query_limits_to_one_row() {
        let url = gateway()
            .table_url("prompt_usage", &Query::new().select("prompt_count").single())
            .unwrap();
        assert!(url.as_str().ends_with("select=prompt_count&limit=1"));
    }
}
