//! HTTP Retry Layer
//!
//! - `transport`: the seam to the outside world (reqwest in production)
//! - `retry`: full-jitter exponential backoff, shared by every retry loop
//! - `client`: request-with-retry on top of both, with counters and alerts

mod client;
mod retry;
mod transport;

pub use client::{redact_url, HttpClient};
pub use retry::{parse_retry_after, RetryDecision, RetryPolicy};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
