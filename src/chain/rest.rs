//! HTTP API client with multi-endpoint failover
//!
//! Used by the Tron, Esplora and toncenter adapters. Transport failures and
//! 5xx responses rotate to the next endpoint; 429 maps to `RateLimited`.

use crate::error::{SwapError, SwapResult};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

enum Payload<'a> {
    Empty,
    Json(&'a Value),
    Text(&'a str),
}

pub struct RestClient {
    chain: String,
    client: reqwest::Client,
    base_urls: Vec<String>,
    current: AtomicUsize,
}

impl RestClient {
    pub fn new(
        chain: &str,
        base_urls: &[String],
        api_key: Option<(&'static str, String)>,
        timeout: Duration,
    ) -> SwapResult<Self> {
        if base_urls.is_empty() {
            return Err(SwapError::connection(chain, "No API endpoints configured"));
        }

        let mut headers = HeaderMap::new();
        if let Some((name, value)) = api_key {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| SwapError::Config(format!("Invalid API key for {}: {}", chain, e)))?;
            headers.insert(HeaderName::from_static(name), value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SwapError::connection(chain, e))?;

        Ok(Self {
            chain: chain.to_string(),
            client,
            base_urls: base_urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
        })
    }

    fn base(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed);
        &self.base_urls[idx % self.base_urls.len()]
    }

    fn failover(&self) {
        if self.base_urls.len() > 1 {
            let next = (self.current.load(Ordering::Relaxed) + 1) % self.base_urls.len();
            self.current.store(next, Ordering::Relaxed);
            warn!("Chain {} failover to endpoint {}", self.chain, next);
        }
    }

    /// Returns the response body, or `None` on 404
    async fn send(&self, method: Method, path: &str, payload: Payload<'_>) -> SwapResult<Option<String>> {
        let mut last_error = SwapError::connection(&self.chain, "No endpoints attempted");

        for _ in 0..self.base_urls.len() {
            let url = format!("{}{}", self.base(), path);
            let request = self.client.request(method.clone(), &url);
            let request = match &payload {
                Payload::Empty => request,
                Payload::Json(body) => request.json(body),
                Payload::Text(body) => request.body(body.to_string()),
            };

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = if e.is_timeout() {
                        SwapError::Timeout {
                            operation: format!("{} {}", method, path),
                        }
                    } else {
                        SwapError::connection(&self.chain, e)
                    };
                    warn!("Request to {} failed: {}", url, last_error);
                    self.failover();
                    continue;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| SwapError::connection(&self.chain, e))?;

            match status {
                s if s.is_success() => return Ok(Some(body)),
                StatusCode::NOT_FOUND => return Ok(None),
                StatusCode::TOO_MANY_REQUESTS => {
                    last_error = SwapError::RateLimited {
                        chain: self.chain.clone(),
                    };
                    self.failover();
                }
                s if s.is_server_error() => {
                    last_error = SwapError::connection(&self.chain, format!("{}: {}", s, body));
                    self.failover();
                }
                s => {
                    return Err(SwapError::Transaction(format!(
                        "{} {} returned {}: {}",
                        method, path, s, body
                    )))
                }
            }
        }

        Err(last_error)
    }

    fn parse<T: DeserializeOwned>(&self, path: &str, body: &str) -> SwapResult<T> {
        serde_json::from_str(body).map_err(|e| {
            SwapError::connection(&self.chain, format!("Malformed response from {}: {}", path, e))
        })
    }

    fn not_found(&self, path: &str) -> SwapError {
        SwapError::connection(&self.chain, format!("{} not found", path))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SwapResult<T> {
        match self.send(Method::GET, path, Payload::Empty).await? {
            Some(body) => self.parse(path, &body),
            None => Err(self.not_found(path)),
        }
    }

    /// GET that maps 404 to `None`
    pub async fn get_json_opt<T: DeserializeOwned>(&self, path: &str) -> SwapResult<Option<T>> {
        match self.send(Method::GET, path, Payload::Empty).await? {
            Some(body) => self.parse(path, &body).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_text(&self, path: &str) -> SwapResult<String> {
        self.send(Method::GET, path, Payload::Empty)
            .await?
            .ok_or_else(|| self.not_found(path))
    }

    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> SwapResult<T> {
        match self.send(Method::POST, path, Payload::Json(body)).await? {
            Some(body) => self.parse(path, &body),
            None => Err(self.not_found(path)),
        }
    }

    pub async fn post_text(&self, path: &str, body: &str) -> SwapResult<String> {
        self.send(Method::POST, path, Payload::Text(body))
            .await?
            .ok_or_else(|| self.not_found(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_endpoint() {
        assert!(RestClient::new("tron", &[], None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_failover_rotates_and_trims() {
        let client = RestClient::new(
            "tron",
            &["https://a.example/".to_string(), "https://b.example".to_string()],
            Some(("tron-pro-api-key", "key".to_string())),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.base(), "https://a.example");
        client.failover();
        assert_eq!(client.base(), "https://b.example");
        client.failover();
        assert_eq!(client.base(), "https://a.example");
    }
}
