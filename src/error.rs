// src/error.rs
//! Error taxonomy of the relay pipeline.
//!
//! Configuration and startup use `anyhow`; everything that crosses a pipeline
//! stage boundary uses one of the typed errors below so the caller can decide
//! between "skip the page", "drop the record", "abort the cycle" and
//! "count the item as failed".

use thiserror::Error;

/// Failures while retrieving a listing page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("unexpected HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    /// Anti-bot challenge page. Terminal for the source in the current cycle.
    #[error("captcha detected at {url}")]
    CaptchaDetected { url: String },

    #[error("render service error for {url}: {message}")]
    Render { url: String, message: String },

    #[error("invalid page url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl FetchError {
    pub fn network(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            message: err.to_string(),
        }
    }

    pub fn is_captcha(&self) -> bool {
        matches!(self, Self::CaptchaDetected { .. })
    }
}

/// Why a raw unit could not become a candidate record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    #[error("external id not found")]
    MissingExternalId,
    #[error("title not found")]
    MissingTitle,
}

/// Store write/read failures. Fatal for the current cycle.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("announcement {0} not found")]
    NotFound(String),
}

/// Channel-specific send failures.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{channel}: credential rejected: {message}")]
    Auth { channel: String, message: String },

    #[error("{channel}: rate limited (retry after {retry_after:?}s)")]
    RateLimited {
        channel: String,
        retry_after: Option<u64>,
    },

    #[error("{channel}: transport error: {message}")]
    Transport { channel: String, message: String },

    #[error("{channel}: api error {code}: {message}")]
    Api {
        channel: String,
        code: i64,
        message: String,
    },

    /// Media could not be attached; the router degrades to a text-only post.
    #[error("{channel}: media rejected: {message}")]
    MediaRejected { channel: String, message: String },

    #[error("media upload failed: {0}")]
    MediaUpload(String),
}

impl PublishError {
    pub fn transport(channel: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            channel: channel.to_string(),
            message: err.to_string(),
        }
    }

    /// Short label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transport { .. } => "transport",
            Self::Api { .. } => "api",
            Self::MediaRejected { .. } => "media_rejected",
            Self::MediaUpload(_) => "media_upload",
        }
    }
}

/// Reasons a whole cycle ends early.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("cycle task aborted: {0}")]
    Aborted(String),
}
