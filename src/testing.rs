//! In-memory collaborators for unit tests.

use crate::error::{Error, FetchError, Result, TransportError};
use crate::http::{Fetch, FetchRequest, Fetched};
use crate::messaging::{Destination, Outgoing, SentMessage, Transport};
use crate::queue::Queue;
use crate::sites::{Cooldown, FetchContext, Site};
use crate::translate::Translator;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fetch context backed by an empty [`MockFetch`].
pub fn fetch_context() -> FetchContext {
    FetchContext::new(Arc::new(MockFetch::new()), CancellationToken::new())
}

#[derive(Clone)]
enum Canned {
    Body {
        filename: Option<String>,
        bytes: Bytes,
    },
    Error(FetchError),
}

/// Serves canned responses and counts requests per URL. Unknown URLs 404.
#[derive(Clone, Default)]
pub struct MockFetch {
    responses: Arc<Mutex<HashMap<String, Canned>>>,
    requests: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockFetch {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(self, url: &str, canned: Canned) -> Self {
        self.responses.lock().insert(url.to_string(), canned);
        self
    }

    pub fn with_file(self, url: &str, size: u64) -> Self {
        self.with(
            url,
            Canned::Body {
                filename: None,
                bytes: Bytes::from(vec![0u8; size as usize]),
            },
        )
    }

    pub fn with_named_file(self, url: &str, filename: &str, size: u64) -> Self {
        self.with(
            url,
            Canned::Body {
                filename: Some(filename.to_string()),
                bytes: Bytes::from(vec![0u8; size as usize]),
            },
        )
    }

    pub fn with_json(self, url: &str, body: &str) -> Self {
        self.with(
            url,
            Canned::Body {
                filename: None,
                bytes: Bytes::from(body.to_string()),
            },
        )
    }

    pub fn with_error(self, url: &str, error: FetchError) -> Self {
        self.with(url, Canned::Error(error))
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<Fetched, FetchError> {
        *self.requests.lock().entry(request.url.clone()).or_default() += 1;
        tokio::task::yield_now().await;

        let canned = self.responses.lock().get(&request.url).cloned();
        match canned {
            Some(Canned::Body { filename, bytes }) => Ok(Fetched {
                url: request.url,
                filename,
                content_type: None,
                bytes,
            }),
            Some(Canned::Error(error)) => Err(error),
            None => Err(FetchError::NotFound { url: request.url }),
        }
    }
}

type PostFn = Arc<dyn Fn(&Queue) + Send + Sync>;

/// Site whose posts are scripted by a closure.
///
/// Matches `<name>.test/<digits>`.
#[derive(Clone)]
pub struct StaticSite {
    name: String,
    pattern: Regex,
    post: Option<PostFn>,
    failure: Option<FetchError>,
    stalled: bool,
    author: Option<String>,
    cooldown: Option<Cooldown>,
    concurrent: bool,
    calls: Arc<AtomicUsize>,
}

impl StaticSite {
    pub fn new(name: &str) -> Self {
        let pattern = Regex::new(&format!(r"https?://{}\.test/(\d+)", regex::escape(name)))
            .expect("test pattern");
        Self {
            name: name.to_string(),
            pattern,
            post: None,
            failure: None,
            stalled: false,
            author: None,
            cooldown: None,
            concurrent: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_post(mut self, post: impl Fn(&Queue) + Send + Sync + 'static) -> Self {
        self.post = Some(Arc::new(post));
        self
    }

    pub fn failing(mut self, error: FetchError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Never finishes fetching.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn with_cooldown(mut self, window: Duration, max_calls: usize) -> Self {
        self.cooldown = Some(Cooldown { window, max_calls });
        self
    }

    pub fn sequential(mut self) -> Self {
        self.concurrent = false;
        self
    }

    /// Shared count of `handle` invocations.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Site for StaticSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn pattern(&self) -> &Regex {
        &self.pattern
    }

    fn cooldown(&self) -> Option<Cooldown> {
        self.cooldown
    }

    fn concurrent(&self) -> bool {
        self.concurrent
    }

    async fn handle(
        &self,
        _context: &FetchContext,
        queue: &Queue,
        _args: &[Option<String>],
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.stalled {
            std::future::pending::<()>().await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone().into());
        }
        if let Some(author) = &self.author {
            queue.set_author(author.clone());
        }
        if let Some(post) = &self.post {
            post(queue);
        }
        Ok(())
    }
}

/// Records everything sent through it.
#[derive(Default)]
pub struct MockTransport {
    next_id: AtomicU64,
    sent: Mutex<Vec<(SentMessage, Outgoing)>>,
    deleted: Mutex<Vec<SentMessage>>,
    reactions: Mutex<Vec<(SentMessage, String)>>,
    suppressed: Mutex<Vec<(u64, u64)>>,
    /// `None`: nobody ever reacts.
    reaction: Option<Option<String>>,
    send_delay: Option<Duration>,
    rejects_embeds: bool,
}

impl MockTransport {
    /// Reaction waits resolve immediately with no choice.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            reaction: Some(None),
            ..Self::default()
        }
    }

    pub fn with_reaction(mut self, choice: Option<&str>) -> Self {
        self.reaction = Some(choice.map(str::to_string));
        self
    }

    pub fn never_reacts(mut self) -> Self {
        self.reaction = None;
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    /// Embed sends fail the way an API rejection would.
    pub fn rejecting_embeds(mut self) -> Self {
        self.rejects_embeds = true;
        self
    }

    pub fn sent(&self) -> Vec<Outgoing> {
        self.sent
            .lock()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn sent_handles(&self) -> Vec<SentMessage> {
        self.sent.lock().iter().map(|(handle, _)| *handle).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                Outgoing::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<SentMessage> {
        self.deleted.lock().clone()
    }

    pub fn reactions(&self) -> Vec<(SentMessage, String)> {
        self.reactions.lock().clone()
    }

    pub fn suppressed(&self) -> Vec<(u64, u64)> {
        self.suppressed.lock().clone()
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, destination: &Destination, message: Outgoing) -> Result<SentMessage> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejects_embeds && matches!(message, Outgoing::Embed(_)) {
            return Err(TransportError::Send {
                channel_id: destination.channel_id,
                reason: "400 invalid embed".into(),
            }
            .into());
        }
        let handle = SentMessage {
            channel_id: destination.channel_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        self.sent.lock().push((handle, message));
        Ok(handle)
    }

    async fn delete(&self, message: &SentMessage) -> Result<()> {
        self.deleted.lock().push(*message);
        Ok(())
    }

    async fn react(&self, message: &SentMessage, emoji: &str) -> Result<()> {
        self.reactions.lock().push((*message, emoji.to_string()));
        Ok(())
    }

    async fn await_reaction(
        &self,
        message: &SentMessage,
        _user_id: u64,
        choices: &[&str],
    ) -> Result<Option<String>> {
        match &self.reaction {
            Some(choice) => Ok(choice
                .clone()
                .filter(|choice| choices.contains(&choice.as_str()))),
            None => {
                std::future::pending::<()>().await;
                Err(Error::from(TransportError::WaiterDropped {
                    message_id: message.message_id,
                }))
            }
        }
    }

    async fn suppress_embeds(&self, channel_id: u64, message_id: u64) -> Result<()> {
        self.suppressed.lock().push((channel_id, message_id));
        Ok(())
    }
}

/// Translator with a fixed phrasebook. Unknown text is English.
#[derive(Default)]
pub struct MockTranslator {
    phrases: HashMap<String, (String, String)>,
}

impl MockTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, text: &str, language: &str, translation: &str) -> Self {
        self.phrases.insert(
            text.to_string(),
            (language.to_string(), translation.to_string()),
        );
        self
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn detect(&self, text: &str) -> Result<String> {
        Ok(self
            .phrases
            .get(text)
            .map_or_else(|| "en".to_string(), |(language, _)| language.clone()))
    }

    async fn translate(&self, text: &str, _source: &str, _target: &str) -> Result<String> {
        self.phrases
            .get(text)
            .map(|(_, translation)| translation.clone())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("no translation for {text}")))
    }
}
