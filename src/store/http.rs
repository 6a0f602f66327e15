//! HTTP adapter for the hosted backend's function-call API
//!
//! Every call is `POST {base}/api/{query|mutation}` with
//! `{"path": ..., "args": ..., "format": "json"}`. The backend answers
//! `{"status": "success", "value": ...}` or
//! `{"status": "error", "errorMessage": ..., "errorData": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{Mutation, MutationFailure, Query, RemoteStore};
use crate::config::StoreConfig;
use crate::error::{AirqError, Result};

pub struct HttpStore {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| AirqError::Config("store.url is not set".to_string()))?;
        Self::new(url, config.token.clone(), config.request_timeout())
    }

    async fn call(
        &self,
        kind: &str,
        path: &str,
        args: Value,
    ) -> std::result::Result<Value, MutationFailure> {
        let url = format!("{}/api/{}", self.base_url, kind);
        debug!("[Store] POST {} path={}", url, path);

        let mut request = self.http.post(&url).json(&request_body(path, args));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| MutationFailure::new(format!("Request failed: {}", e)))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| MutationFailure::new(format!("Invalid response ({}): {}", status, e)))?;

        let result = parse_response(body);
        if let Err(failure) = &result {
            warn!("[Store] {} {} failed: {}", kind, path, failure);
        }
        result
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn query(&self, query: Query) -> Result<Value> {
        self.call("query", query.path(), query.args())
            .await
            .map_err(|f| AirqError::Store(f.message))
    }

    async fn mutate(&self, mutation: Mutation) -> std::result::Result<Value, MutationFailure> {
        self.call("mutation", mutation.path(), mutation.args()).await
    }
}

fn request_body(path: &str, args: Value) -> Value {
    json!({
        "path": path,
        "args": args,
        "format": "json",
    })
}

fn parse_response(body: Value) -> std::result::Result<Value, MutationFailure> {
    match body.get("status").and_then(Value::as_str) {
        Some("success") => Ok(body.get("value").cloned().unwrap_or(Value::Null)),
        Some("error") => {
            let message = body
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("unknown backend error")
                .to_string();
            match body.get("errorData") {
                Some(data) if !data.is_null() => Err(MutationFailure::with_server_data(message, data.clone())),
                _ => Err(MutationFailure::new(message)),
            }
        }
        _ => Err(MutationFailure::new(format!("Unexpected response: {}", body))),
    }
}
