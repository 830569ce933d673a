use anyhow::{Result, anyhow};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;

use super::GlobalFlags;
use crate::core::config::OrchestratorConfig;

/// Thin JSON client for the operator API of a running orchestrator.
pub(crate) struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// `--api-url`/`--token` win over the config file; the config file over defaults.
    pub(crate) async fn from_flags(flags: &GlobalFlags) -> Result<Self> {
        let config = OrchestratorConfig::load(flags.config.as_deref()).await?;
        let base_url = flags
            .api_url
            .clone()
            .unwrap_or_else(|| config.api_base_url());
        let token = flags.token.clone().or(config.server.api_token);
        Ok(Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.request(Method::GET, path)).await
    }

    pub(crate) async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let request = self.request(Method::POST, path);
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };
        self.send(request).await
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<Value> {
        self.send(self.request(Method::DELETE, path)).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let resp = request.send().await.map_err(|e| {
            anyhow!(
                "Could not reach orchestrator at {} - {}. Is 'rpa-orchestrator serve' running?",
                self.base_url,
                e
            )
        })?;
        let status = resp.status();
        let body = resp
            .json::<Value>()
            .await
            .map_err(|e| anyhow!("unexpected response ({}): {}", status, e))?;
        let ok = body
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(status.is_success());
        if ok {
            Ok(body)
        } else {
            Err(anyhow!(error_message(&body, status.as_u16())))
        }
    }
}

fn error_message(body: &Value, status: u16) -> String {
    let error = body
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("request failed");
    match body.get("error_type").and_then(|v| v.as_str()) {
        Some(kind) => format!("{} ({}, HTTP {})", error, kind, status),
        None => format!("{} (HTTP {})", error, status),
    }
}

/// `field` of `value` as display text; `-` when absent or null.
pub(crate) fn text(value: &Value, field: &str) -> String {
    match value.get(field) {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
