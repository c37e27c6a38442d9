//! Top-level error types for crosspost.

use std::sync::Arc;
use std::time::Duration;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error shared between every waiter of a single-flight fetch.
pub type SharedError = Arc<Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Short name of the error kind, used in generic chat replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::Settings(_) => "SettingsError",
            Error::Fetch(error) => error.kind(),
            Error::Transport(_) => "TransportError",
            Error::Io(_) => "IoError",
            Error::Other(_) => "Error",
        }
    }

    /// Whether this error is a 404 from upstream.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Fetch(FetchError::NotFound { .. }))
    }

    /// Whether this error came from cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Fetch(FetchError::Cancelled))
    }

    /// Render the error as a short chat reply.
    pub fn user_message(&self) -> String {
        match self {
            Error::Fetch(FetchError::NotFound { .. }) => "Post not found".to_string(),
            Error::Fetch(FetchError::RequiresAuth { .. }) => {
                "This post requires authentication".to_string()
            }
            Error::Fetch(FetchError::RateLimited {
                retry_after: Some(retry_after),
                ..
            }) => format!(
                "Rate limited, try again in {}s",
                retry_after.as_secs().max(1)
            ),
            Error::Fetch(FetchError::RateLimited { .. }) => {
                "Rate limited, try again later".to_string()
            }
            other => format!("`{}`: {}", other.kind(), other),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Settings storage errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings database error: {0}")]
    Database(#[from] redb::Error),

    #[error("corrupt settings record for scope {scope}: {source}")]
    Corrupt {
        scope: u64,
        source: serde_json::Error,
    },

    #[error("invalid page range: {0}")]
    InvalidRange(String),
}

/// Upstream fetch errors.
///
/// Cloneable so a memoized download can hand the same failure to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("authentication required: {url}")]
    RequiresAuth { url: String },

    #[error("rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("post-processing {filename} failed: {reason}")]
    PostProcess { filename: String, reason: String },

    #[error("fetch cancelled")]
    Cancelled,

    #[error("fetch task aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::NotFound { .. } => "NotFound",
            FetchError::RequiresAuth { .. } => "RequiresAuth",
            FetchError::RateLimited { .. } => "RateLimited",
            FetchError::Status { .. } => "HTTPStatus",
            FetchError::Malformed { .. } => "MalformedResponse",
            FetchError::Request { .. } => "RequestError",
            FetchError::PostProcess { .. } => "PostProcessError",
            FetchError::Cancelled => "Cancelled",
            FetchError::Aborted(_) => "Aborted",
        }
    }

    pub fn malformed(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FetchError::Malformed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// Chat transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to send message to channel {channel_id}: {reason}")]
    Send { channel_id: u64, reason: String },

    #[error("failed to delete message {message_id}: {reason}")]
    Delete { message_id: u64, reason: String },

    #[error("failed to react to message {message_id}: {reason}")]
    React { message_id: u64, reason: String },

    #[error("reaction wait for message {message_id} was dropped")]
    WaiterDropped { message_id: u64 },
}
