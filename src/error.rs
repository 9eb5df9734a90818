//! Error taxonomy for the reconciliation job
//!
//! Every failure surfaced by the network, chain and store layers is a
//! [`VolumeError`]. Callers branch on [`VolumeError::code`] rather than on
//! upstream error text; the text matching lives in exactly two places,
//! [`classify_indexer_text`] and [`classify_rpc_text`].

use std::time::Duration;
use thiserror::Error;

use crate::chain::Chain;

// ============================================
// CLASSIFICATION CODES
// ============================================

/// Fixed classification attached to every error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Rate limits, timeouts, 5xx - safe to retry
    Transient,

    /// Indexer API tier does not cover the chain; fall back to RPC
    PlanRestricted,

    /// Indexer rejected the API key
    InvalidKey,

    /// Malformed address, bad block range, bad timestamp
    Validation,

    /// Missing RPC URL or similar local misconfiguration
    Configuration,

    /// Anything else
    Generic,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Transient => write!(f, "TRANSIENT"),
            ErrorCode::PlanRestricted => write!(f, "PLAN_RESTRICTED"),
            ErrorCode::InvalidKey => write!(f, "INVALID_KEY"),
            ErrorCode::Validation => write!(f, "VALIDATION"),
            ErrorCode::Configuration => write!(f, "CONFIGURATION"),
            ErrorCode::Generic => write!(f, "GENERIC"),
        }
    }
}

// ============================================
// ERROR TYPE
// ============================================

#[derive(Debug, Error)]
pub enum VolumeError {
    /// Connection reset, DNS failure, client timeout
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Non-success HTTP status
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Indexer answered with an error envelope
    #[error("{context}: {message}")]
    Indexer {
        code: ErrorCode,
        context: String,
        message: String,
    },

    /// Node answered with a JSON-RPC error or an unusable result
    #[error("RPC {method} error at {url}: {message}")]
    Rpc {
        code: ErrorCode,
        method: String,
        url: String,
        message: String,
    },

    #[error("no RPC URL configured for chain={0}")]
    MissingRpcUrl(Chain),

    #[error("invalid endpoint URL {0}")]
    InvalidUrl(String),

    #[error("invalid block range resolved: start={start}, end={end}")]
    InvalidBlockRange { start: u64, end: u64 },

    #[error("no block at or before timestamp {timestamp} on chain={chain}")]
    NoBlockBefore { chain: Chain, timestamp: u64 },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("{0}")]
    Validation(String),

    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("store I/O error on {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store document {path} is malformed: {source}")]
    StoreFormat {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl VolumeError {
    /// Map this error onto the fixed classification
    pub fn code(&self) -> ErrorCode {
        match self {
            VolumeError::Network { .. } => ErrorCode::Transient,
            VolumeError::HttpStatus { status, .. } => {
                if is_retryable_status(*status) {
                    ErrorCode::Transient
                } else {
                    ErrorCode::Generic
                }
            }
            VolumeError::Indexer { code, .. } | VolumeError::Rpc { code, .. } => *code,
            VolumeError::MissingRpcUrl(_) | VolumeError::InvalidUrl(_) => {
                ErrorCode::Configuration
            }
            VolumeError::InvalidBlockRange { .. }
            | VolumeError::NoBlockBefore { .. }
            | VolumeError::InvalidTimestamp(_)
            | VolumeError::Validation(_) => ErrorCode::Validation,
            VolumeError::Decode { .. } => ErrorCode::Generic,
            VolumeError::Store { .. } | VolumeError::StoreFormat { .. } => ErrorCode::Generic,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.code() == ErrorCode::Transient
    }

    pub fn is_plan_restricted(&self) -> bool {
        self.code() == ErrorCode::PlanRestricted
    }

    /// Local persistence failures abort the whole run
    pub fn is_store(&self) -> bool {
        matches!(self, VolumeError::Store { .. } | VolumeError::StoreFormat { .. })
    }
}

/// 429 and every 5xx are worth another attempt
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

// ============================================
// TEXT CLASSIFIERS
// ============================================

/// Classify the human-readable error text of an indexer envelope.
///
/// Order matters: a plan restriction message can also mention a timeout.
pub fn classify_indexer_text(text: &str) -> ErrorCode {
    let txt = text.to_lowercase();
    if txt.contains("free api access is not supported for this chain") {
        ErrorCode::PlanRestricted
    } else if txt.contains("invalid api key") {
        ErrorCode::InvalidKey
    } else if txt.contains("max rate limit")
        || txt.contains("unexpected exception")
        || txt.contains("temporarily unavailable")
        || txt.contains("timeout")
    {
        ErrorCode::Transient
    } else {
        ErrorCode::Generic
    }
}

/// Classify a JSON-RPC error message
pub fn classify_rpc_text(text: &str) -> ErrorCode {
    let txt = text.to_lowercase();
    if txt.contains("limit")
        || txt.contains("rate")
        || txt.contains("too many requests")
        || txt.contains("timeout")
        || txt.contains("timed out")
    {
        ErrorCode::Transient
    } else {
        ErrorCode::Generic
    }
}
