//! Outbound HTTP transport
//!
//! Everything that leaves the process goes through [`HttpTransport`], so the
//! retry layer and both chain clients can be exercised without a network.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::error::VolumeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    /// JSON body (POST only)
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Raw `Retry-After` header value, if any
    pub retry_after: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform a single attempt. Non-2xx statuses are returned as `Ok`;
    /// only transport-level failures are `Err`.
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, VolumeError>;
}

// ============================================
// REQWEST TRANSPORT
// ============================================

pub struct ReqwestTransport {
    http_client: Client,
}

impl ReqwestTransport {
    /// The timeout bounds a single hung request; the retry ceiling bounds the rest
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, VolumeError> {
        let builder = match request.method {
            HttpMethod::Get => self.http_client.get(&request.url),
            HttpMethod::Post => {
                let builder = self
                    .http_client
                    .post(&request.url)
                    .header(CONTENT_TYPE, "application/json");
                match &request.body {
                    Some(body) => builder.json(body),
                    None => builder,
                }
            }
        };

        let network_error = |e: reqwest::Error| VolumeError::Network {
            url: request.url.clone(),
            message: e.to_string(),
        };

        let response = builder.send().await.map_err(network_error)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(network_error)?;

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}
