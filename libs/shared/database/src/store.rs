use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness or row-level conflict reported by the store (HTTP 409).
    #[error("store conflict: {0}")]
    Conflict(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("store api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("store network error: {0}")]
    Network(String),

    #[error("failed to decode store response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Network(err.to_string())
    }
}

/// PostgREST-style row store client. All persistence in the booking core goes
/// through this: single-row create/read/update by primary key or secondary
/// predicates, plus the one uniqueness constraint on idempotency keys.
pub struct StoreClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl StoreClient {
    pub fn new(config: &AppConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.store_url.clone(),
            api_key: config.store_api_key.clone(),
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            headers.insert("apikey", value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        self.request_with_headers(method, path, body, None).await
    }

    pub async fn request_with_headers<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Store request: {} {}", method, url);

        let mut headers = self.headers();
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url).headers(headers);
        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Store error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                404 => StoreError::NotFound(error_text),
                409 => StoreError::Conflict(error_text),
                code => StoreError::Api {
                    status: code,
                    message: error_text,
                },
            });
        }

        let data = response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(data)
    }

    /// Insert a row and return the created representation.
    pub async fn insert_returning<T>(&self, path: &str, body: Value) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        let rows: Vec<T> = self
            .request_with_headers(Method::POST, path, Some(body), Some(headers))
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("insert returned no rows".to_string()))
    }

    /// Patch rows matching the path predicate and return the updated representation.
    pub async fn update_returning<T>(&self, path: &str, body: Value) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        let rows: Vec<T> = self
            .request_with_headers(Method::PATCH, path, Some(body), Some(headers))
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound("update matched no rows".to_string()))
    }
}
