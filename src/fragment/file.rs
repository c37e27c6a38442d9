//! File and fallback fragments with memoized, single-flight downloads.

use crate::error::FetchError;
use crate::fragment::FRAGMENT_OVERHEAD;
use crate::http::{Fetch, FetchRequest, url_filename};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::OnceCell;

type DownloadResult = std::result::Result<Downloaded, FetchError>;

/// Downloaded (or post-processed) file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub filename: String,
    pub bytes: Bytes,
}

impl Downloaded {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Transformation applied to a file after download (transcoding, re-encoding).
#[async_trait]
pub trait PostProcess: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process(&self, input: Downloaded) -> std::result::Result<Downloaded, FetchError>;
}

/// A downloadable file with ordered alternative source URLs.
pub struct FileFragment {
    urls: Vec<String>,
    headers: Vec<(String, String)>,
    user_agent: Option<String>,
    filename: String,
    lock_filename: bool,
    can_link: bool,
    postprocess: Option<Arc<dyn PostProcess>>,
    download: OnceCell<DownloadResult>,
    processed: OnceCell<DownloadResult>,
}

impl std::fmt::Debug for FileFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFragment")
            .field("urls", &self.urls)
            .field("filename", &self.filename)
            .field("can_link", &self.can_link)
            .finish_non_exhaustive()
    }
}

impl FileFragment {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_urls(vec![url.into()])
    }

    /// Alternatives are tried in order until one downloads.
    pub fn with_urls(urls: Vec<String>) -> Self {
        let filename = urls
            .iter()
            .find_map(|url| url_filename(url))
            .unwrap_or_else(|| "file".to_string());
        Self {
            urls,
            headers: Vec::new(),
            user_agent: None,
            filename,
            lock_filename: false,
            can_link: true,
            postprocess: None,
            download: OnceCell::new(),
            processed: OnceCell::new(),
        }
    }

    /// Fix the filename; server-announced names are then ignored.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self.lock_filename = true;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Whether a bare link may stand in when the file is too large to upload.
    pub fn can_link(mut self, can_link: bool) -> Self {
        self.can_link = can_link;
        self
    }

    pub fn postprocess(mut self, postprocess: Arc<dyn PostProcess>) -> Self {
        self.postprocess = Some(postprocess);
        self
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Primary source URL, used for link fallbacks.
    pub fn url(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }

    pub fn name(&self) -> &str {
        &self.filename
    }

    pub fn is_filename_locked(&self) -> bool {
        self.lock_filename
    }

    pub fn linkable(&self) -> bool {
        self.can_link && !self.urls.is_empty()
    }

    /// Download the raw file. Runs at most once; every caller sees the same outcome.
    pub async fn download(&self, fetch: &dyn Fetch) -> DownloadResult {
        self.download
            .get_or_init(|| self.fetch_first(fetch))
            .await
            .clone()
    }

    /// The file as it should be uploaded: post-processed when configured.
    pub async fn resolve(&self, fetch: &dyn Fetch) -> DownloadResult {
        let Some(postprocess) = &self.postprocess else {
            return self.download(fetch).await;
        };
        self.processed
            .get_or_init(|| async {
                let raw = self.download(fetch).await?;
                tracing::debug!(
                    filename = %raw.filename,
                    postprocess = postprocess.name(),
                    "post-processing file"
                );
                postprocess.process(raw).await
            })
            .await
            .clone()
    }

    /// Already-resolved contents, without triggering a download.
    pub fn resolved(&self) -> Option<&Downloaded> {
        let cell = if self.postprocess.is_some() {
            &self.processed
        } else {
            &self.download
        };
        cell.get().and_then(|result| result.as_ref().ok())
    }

    async fn fetch_first(&self, fetch: &dyn Fetch) -> DownloadResult {
        let mut first_error = None;
        for url in &self.urls {
            let request = FetchRequest {
                url: url.clone(),
                headers: self.headers.clone(),
                user_agent: self.user_agent.clone(),
            };
            match fetch.fetch(request).await {
                Ok(fetched) => {
                    let filename = match fetched.filename {
                        Some(server_name) if !self.lock_filename => server_name,
                        _ => self.filename.clone(),
                    };
                    return Ok(Downloaded {
                        filename,
                        bytes: fetched.bytes,
                    });
                }
                Err(error) => {
                    tracing::debug!(%url, %error, "file source failed");
                    first_error.get_or_insert(error);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| FetchError::Malformed {
            url: String::new(),
            reason: format!("file fragment {} has no source URL", self.filename),
        }))
    }

    pub(crate) fn estimated_size(&self) -> u64 {
        let urls: usize = self.urls.iter().map(String::len).sum();
        let owned = |cell: &OnceCell<DownloadResult>| {
            cell.get()
                .and_then(|result| result.as_ref().ok())
                .map_or(0, Downloaded::len)
        };
        FRAGMENT_OVERHEAD
            + (urls + self.filename.len()) as u64
            + owned(&self.download)
            + owned(&self.processed)
    }
}

/// One alternative for a fallback fragment.
#[derive(Clone)]
pub struct FallbackCandidate {
    pub url: String,
    pub filename: Option<String>,
    pub postprocess: Option<Arc<dyn PostProcess>>,
}

impl FallbackCandidate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: None,
            postprocess: None,
        }
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    fn into_file(self) -> FileFragment {
        let mut file = FileFragment::new(self.url);
        if let Some(filename) = self.filename {
            file = file.filename(filename);
        }
        if let Some(postprocess) = self.postprocess {
            file = file.postprocess(postprocess);
        }
        file
    }
}

/// Candidates of decreasing quality; resolves to the first that fits the
/// destination's upload limit.
pub struct FallbackFragment {
    candidates: Vec<Arc<FileFragment>>,
    lengths: Vec<OnceCell<Option<u64>>>,
}

impl std::fmt::Debug for FallbackFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackFragment")
            .field("candidates", &self.candidates)
            .finish_non_exhaustive()
    }
}

impl FallbackFragment {
    /// Returns `None` for an empty candidate list.
    pub fn new(candidates: Vec<FallbackCandidate>) -> Option<Self> {
        if candidates.is_empty() {
            return None;
        }
        let lengths = candidates.iter().map(|_| OnceCell::new()).collect();
        let candidates = candidates
            .into_iter()
            .map(|candidate| Arc::new(candidate.into_file()))
            .collect();
        Some(Self {
            candidates,
            lengths,
        })
    }

    pub fn candidates(&self) -> &[Arc<FileFragment>] {
        &self.candidates
    }

    /// Upload size of one candidate, computed at most once.
    ///
    /// A candidate that fails to download has no length and never fits.
    pub async fn length(&self, index: usize, fetch: &dyn Fetch) -> Option<u64> {
        let (candidate, cell) = (self.candidates.get(index)?, self.lengths.get(index)?);
        *cell
            .get_or_init(|| async {
                match candidate.resolve(fetch).await {
                    Ok(resolved) => Some(resolved.len()),
                    Err(error) => {
                        tracing::warn!(
                            url = candidate.url().unwrap_or_default(),
                            %error,
                            "fallback candidate unavailable"
                        );
                        None
                    }
                }
            })
            .await
    }

    /// First candidate whose size fits `limit`, else the first candidate.
    pub async fn resolve(&self, fetch: &dyn Fetch, limit: u64) -> Arc<FileFragment> {
        for (index, candidate) in self.candidates.iter().enumerate() {
            if let Some(length) = self.length(index, fetch).await {
                if length <= limit {
                    return Arc::clone(candidate);
                }
            }
        }
        Arc::clone(&self.candidates[0])
    }

    pub(crate) fn estimated_size(&self) -> u64 {
        self.candidates
            .iter()
            .map(|candidate| candidate.estimated_size())
            .sum()
    }
}
