use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use super::RemoteStore;
use crate::config::RemoteConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{Entity, FieldPatch};

/// JSON-over-HTTP remote store
///
/// - `GET    {base}/collections/{owner}/entities`
/// - `PATCH  {base}/entities/{id}` with `{"fields": {...}, "updatedAt": ms}`
/// - `DELETE {base}/entities/{id}` (404 counts as already deleted)
pub struct HttpRemote {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: &str) -> EngineResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(5))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| EngineError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            client,
        })
    }

    pub fn from_config(config: &RemoteConfig) -> EngineResult<Self> {
        let mut remote = Self::with_timeout(&config.base_url, config.request_timeout())?;
        remote.token = config.api_token.clone();
        Ok(remote)
    }

    pub fn set_token(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> EngineResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(b) = body {
            request = request.json(b);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(0)
            } else {
                EngineError::Network(format!("{}: {}", url, e))
            }
        })
    }

    async fn rejected(response: reqwest::Response, path: &str) -> EngineError {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        EngineError::Rejected {
            status: status.as_u16(),
            message: format!("{}: {}", path, text),
        }
    }
}

#[async_trait::async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch_collection(&self, owner_collection_id: &str) -> EngineResult<Vec<Entity>> {
        let path = format!("/collections/{}/entities", owner_collection_id);
        let response = self.send(Method::GET, &path, None).await?;
        if !response.status().is_success() {
            return Err(Self::rejected(response, &path).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("Failed to read {}: {}", path, e)))?;

        let list = match body {
            Value::Array(items) => Value::Array(items),
            Value::Object(mut obj) => obj.remove("entities").unwrap_or(Value::Array(vec![])),
            _ => Value::Array(vec![]),
        };
        let entities: Vec<Entity> = serde_json::from_value(list)?;
        Ok(entities)
    }

    async fn patch_entity(
        &self,
        id: &str,
        fields: &FieldPatch,
        updated_at: i64,
    ) -> EngineResult<()> {
        let path = format!("/entities/{}", id);
        let body = json!({ "fields": fields, "updatedAt": updated_at });
        let response = self.send(Method::PATCH, &path, Some(&body)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejected(response, &path).await)
        }
    }

    async fn delete_entity(&self, id: &str) -> EngineResult<()> {
        let path = format!("/entities/{}", id);
        let response = self.send(Method::DELETE, &path, None).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::rejected(response, &path).await)
        }
    }
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}
