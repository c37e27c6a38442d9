//! Upstream HTTP access shared by site adapters and file downloads.

use crate::config::CrosspostConfig;
use crate::error::{FetchError, Result};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use serde::de::DeserializeOwned;
use std::sync::LazyLock;
use std::time::Duration;

/// One upstream request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Overrides the fetcher's default user agent.
    pub user_agent: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A successful upstream response body plus the metadata we care about.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    /// Filename announced by the server via `Content-Disposition`.
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Network seam. Everything that talks to upstream sites goes through this.
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<Fetched, FetchError>;
}

/// Fetch and decode a JSON document.
pub async fn fetch_json<T: DeserializeOwned>(
    fetch: &dyn Fetch,
    request: FetchRequest,
) -> std::result::Result<T, FetchError> {
    let fetched = fetch.fetch(request).await?;
    serde_json::from_slice(&fetched.bytes)
        .map_err(|error| FetchError::malformed(&fetched.url, error))
}

/// `reqwest`-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_download_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &CrosspostConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .with_context(|| "failed to build HTTP client")?;
        Ok(Self {
            client,
            max_download_bytes: config.max_download_bytes,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<Fetched, FetchError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(user_agent) = &request.user_agent {
            builder = builder.header(USER_AGENT, user_agent.as_str());
        }

        let mut response = builder.send().await.map_err(|error| FetchError::Request {
            url: request.url.clone(),
            reason: error.to_string(),
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            tracing::debug!(url = %request.url, status, "upstream returned error status");
            return Err(status_error(status, &request.url, retry_after));
        }

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let filename = header(CONTENT_DISPOSITION).and_then(|value| disposition_filename(&value));
        let content_type = header(CONTENT_TYPE);

        check_body_size(&request.url, response.content_length(), self.max_download_bytes)?;
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|error| FetchError::Request {
            url: request.url.clone(),
            reason: error.to_string(),
        })? {
            body.extend_from_slice(&chunk);
            // Chunked bodies carry no length header up front.
            check_body_size(&request.url, Some(body.len() as u64), self.max_download_bytes)?;
        }
        let bytes = body.freeze();

        tracing::debug!(url = %request.url, size = bytes.len(), "fetched");

        Ok(Fetched {
            url: request.url,
            filename,
            content_type,
            bytes,
        })
    }
}

/// Reject a body larger than `limit` before or while it is read.
fn check_body_size(url: &str, length: Option<u64>, limit: u64) -> std::result::Result<(), FetchError> {
    match length {
        Some(length) if length > limit => Err(FetchError::Request {
            url: url.to_string(),
            reason: format!("response of {length} bytes exceeds the {limit} byte limit"),
        }),
        _ => Ok(()),
    }
}

/// Map a non-2xx status onto the fetch error taxonomy.
pub fn status_error(status: u16, url: &str, retry_after: Option<Duration>) -> FetchError {
    let url = url.to_string();
    match status {
        404 | 410 => FetchError::NotFound { url },
        401 | 403 => FetchError::RequiresAuth { url },
        429 => FetchError::RateLimited { url, retry_after },
        status => FetchError::Status { status, url },
    }
}

/// Extract the filename from a `Content-Disposition` header value.
pub fn disposition_filename(value: &str) -> Option<String> {
    static EXTENDED: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?i)filename\*\s*=\s*[^']*'[^']*'([^;]+)"#).expect("hardcoded regex")
    });
    static PLAIN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?i)filename\s*=\s*(?:"([^"]+)"|([^;\s]+))"#).expect("hardcoded regex")
    });

    if let Some(captures) = EXTENDED.captures(value) {
        let encoded = captures[1].trim();
        if let Ok(decoded) = urlencoding::decode(encoded) {
            return sanitize_filename(&decoded);
        }
    }

    let captures = PLAIN.captures(value)?;
    let raw = captures.get(1).or_else(|| captures.get(2))?.as_str();
    sanitize_filename(raw)
}

/// Derive a filename from the last path segment of a URL.
pub fn url_filename(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    sanitize_filename(&decoded)
}

fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw)
        .trim()
        .trim_matches('"');
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}
