//! Request-with-retry
//!
//! Retries 429/5xx and network failures with the shared [`RetryPolicy`],
//! counts every attempt in [`RunMetrics`], and writes the alert record
//! immediately when the attempt budget is exhausted so a crash later in
//! the run still leaves a trace.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

use super::retry::{parse_retry_after, RetryDecision, RetryPolicy};
use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::{is_retryable_status, VolumeError};
use crate::metrics::RunMetrics;
use crate::store::AlertLog;

#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    metrics: Arc<RunMetrics>,
    alerts: Arc<AlertLog>,
}

impl HttpClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        policy: RetryPolicy,
        metrics: Arc<RunMetrics>,
        alerts: Arc<AlertLog>,
    ) -> Self {
        Self {
            transport,
            policy,
            metrics,
            alerts,
        }
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Issue `request`, retrying retryable statuses and network errors.
    ///
    /// Non-retryable statuses (e.g. 404) come back as `Ok` for the caller to
    /// judge.
    pub async fn request_with_retry(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, VolumeError> {
        let label = redact_url(&request.url);
        let client = self;
        let label_ref = label.as_str();

        let result = self
            .policy
            .run(
                &self.metrics,
                label_ref,
                move |attempt| async move {
                    client.metrics.record_api_call();
                    debug!("HTTP {:?} {} (attempt {})", request.method, label_ref, attempt);

                    let response = client.transport.execute(request).await?;
                    if is_retryable_status(response.status) {
                        let retry_after = response
                            .retry_after
                            .as_deref()
                            .and_then(|v| parse_retry_after(v, Utc::now()));
                        return Err(VolumeError::HttpStatus {
                            url: label_ref.to_string(),
                            status: response.status,
                            retry_after,
                        });
                    }
                    Ok(response)
                },
                classify_http_error,
            )
            .await;

        if let Err(err) = &result {
            error!("Request {} failed after retries: {}", label, err);
            self.alerts
                .raise(format!("request-failed: {}: {}", label, err));
        }
        result
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, VolumeError> {
        let response = self.request_with_retry(&HttpRequest::get(url)).await?;
        decode_json(url, response)
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: Value,
    ) -> Result<T, VolumeError> {
        let response = self
            .request_with_retry(&HttpRequest::post_json(url, body))
            .await?;
        decode_json(url, response)
    }
}

fn classify_http_error(err: &VolumeError) -> RetryDecision {
    match err {
        VolumeError::HttpStatus {
            status,
            retry_after,
            ..
        } if is_retryable_status(*status) => match retry_after {
            Some(wait) => RetryDecision::RetryAfter(*wait),
            None => RetryDecision::Retry,
        },
        VolumeError::Network { .. } => RetryDecision::Retry,
        _ => RetryDecision::Stop,
    }
}

fn decode_json<T: DeserializeOwned>(url: &str, response: HttpResponse) -> Result<T, VolumeError> {
    if !response.is_success() {
        return Err(VolumeError::HttpStatus {
            url: redact_url(url),
            status: response.status,
            retry_after: None,
        });
    }
    serde_json::from_str(&response.body).map_err(|e| VolumeError::Decode {
        url: redact_url(url),
        message: e.to_string(),
    })
}

/// Strip API keys from a URL before it reaches logs or alert reasons
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    if !parsed
        .query_pairs()
        .any(|(k, _)| k.eq_ignore_ascii_case("apikey"))
    {
        return url.to_string();
    }

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            let v = if k.eq_ignore_ascii_case("apikey") {
                "***".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}
