//! The crosspost orchestrator: messages in, rendered posts out.

pub mod scan;

pub use scan::LinkMatch;

use crate::config::CrosspostConfig;
use crate::error::{Error, Result, SharedError};
use crate::http::Fetch;
use crate::messaging::{IncomingMessage, SentLog, TransportDyn};
use crate::queue::{CacheStats, Item, PageRanges, PresentContext, Queue, QueueCache, present};
use crate::settings::{Settings, SettingsStore};
use crate::sites::{FetchContext, SiteRegistry};
use crate::translate::Translator;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One request to crosspost the links in a message.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub message: IncomingMessage,
    /// Explicit request: ignores the blacklist, the auto setting and the
    /// large-post confirmation.
    pub force: bool,
    pub ranges: Option<PageRanges>,
    /// Most specific settings layer, applied over the stored ones.
    pub overrides: Settings,
}

impl Invocation {
    /// A message seen in passing.
    pub fn automatic(message: IncomingMessage) -> Self {
        Self {
            message,
            force: false,
            ranges: None,
            overrides: Settings::default(),
        }
    }

    /// An explicit command.
    pub fn forced(message: IncomingMessage) -> Self {
        Self {
            force: true,
            ..Self::automatic(message)
        }
    }

    pub fn with_ranges(mut self, ranges: PageRanges) -> Self {
        self.ranges = Some(ranges);
        self
    }

    pub fn with_overrides(mut self, overrides: Settings) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Processing of one triggering message.
struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    sent: SentLog,
}

/// Collaborators the orchestrator is built from.
pub struct CrosspostDeps {
    pub sites: SiteRegistry,
    pub settings: Arc<dyn SettingsStore>,
    pub transport: Arc<dyn TransportDyn>,
    pub fetch: Arc<dyn Fetch>,
    pub translator: Option<Arc<dyn Translator>>,
}

/// Turns messages into crossposts. Owns the queue cache and the table of
/// in-flight invocations.
pub struct Crosspost {
    sites: SiteRegistry,
    cache: QueueCache,
    settings: Arc<dyn SettingsStore>,
    transport: Arc<dyn TransportDyn>,
    fetch: Arc<dyn Fetch>,
    translator: Option<Arc<dyn Translator>>,
    config: CrosspostConfig,
    shutdown: CancellationToken,
    ongoing: Mutex<HashMap<u64, InFlight>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for Crosspost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crosspost")
            .field("sites", &self.sites.names())
            .field("cache", &self.cache)
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}

impl Crosspost {
    pub fn new(config: CrosspostConfig, deps: CrosspostDeps) -> Self {
        Self {
            cache: QueueCache::new(config.cache_budget_bytes),
            sites: deps.sites,
            settings: deps.settings,
            transport: deps.transport,
            fetch: deps.fetch,
            translator: deps.translator,
            config,
            shutdown: CancellationToken::new(),
            ongoing: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn sites(&self) -> &SiteRegistry {
        &self.sites
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    fn fetch_context(&self) -> FetchContext {
        FetchContext::new(Arc::clone(&self.fetch), self.shutdown.clone())
    }

    /// Run every site's load hook.
    pub async fn load(&self) {
        self.sites.load_all(&self.fetch_context()).await;
        tracing::info!(sites = ?self.sites.names(), "crosspost ready");
    }

    /// Cancel all work and unload sites.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ongoing: Vec<InFlight> = self.ongoing.lock().drain().map(|(_, f)| f).collect();
        for in_flight in ongoing {
            in_flight.cancel.cancel();
            let _ = in_flight.handle.await;
        }
        self.sites.unload_all().await;
        tracing::info!("crosspost shut down");
    }

    /// A message was posted.
    pub fn on_message(self: &Arc<Self>, message: IncomingMessage) {
        self.spawn(Invocation::automatic(message));
    }

    /// Process an invocation in the background, tracked by message id so a
    /// deletion can cancel it.
    pub fn spawn(self: &Arc<Self>, invocation: Invocation) {
        let message_id = invocation.message.id;
        let mut ongoing = self.ongoing.lock();
        if ongoing.contains_key(&message_id) {
            tracing::debug!(message_id, "crosspost already running, ignoring repeat");
            return;
        }

        let cancel = self.shutdown.child_token();
        let sent = SentLog::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let (task_cancel, task_sent) = (cancel.clone(), sent.clone());
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    tracing::debug!(message_id, "crosspost cancelled");
                }
                result = this.process(&invocation, &task_sent) => {
                    if let Err(error) = result {
                        let destination = &invocation.message.destination;
                        tracing::error!(
                            guild_id = ?destination.guild_id,
                            channel_id = destination.channel_id,
                            message_id,
                            %error,
                            "crosspost failed"
                        );
                    }
                }
            }
            // A deletion may already have replaced this entry with a newer run.
            let mut ongoing = this.ongoing.lock();
            if ongoing
                .get(&message_id)
                .is_some_and(|in_flight| in_flight.generation == generation)
            {
                ongoing.remove(&message_id);
            }
        });
        ongoing.insert(
            message_id,
            InFlight {
                generation,
                cancel,
                handle,
                sent,
            },
        );
    }

    /// A message was deleted: stop its crosspost and remove what it sent.
    pub async fn on_message_delete(&self, message_id: u64) {
        let in_flight = self.ongoing.lock().remove(&message_id);
        let Some(in_flight) = in_flight else {
            return;
        };

        in_flight.cancel.cancel();
        if let Err(error) = in_flight.handle.await {
            if !error.is_cancelled() {
                tracing::warn!(message_id, %error, "crosspost task ended abnormally");
            }
        }

        let sent = in_flight.sent.take();
        tracing::info!(message_id, orphans = sent.len(), "source deleted, removing crosspost");
        for message in sent {
            if let Err(error) = self.transport.delete(&message).await {
                tracing::warn!(message_id = message.message_id, %error, "failed to delete crosspost");
            }
        }
    }

    /// Whether a message's crosspost is still running.
    pub fn is_processing(&self, message_id: u64) -> bool {
        self.ongoing.lock().contains_key(&message_id)
    }

    /// Crosspost one message. Per-link failures are reported in chat and do
    /// not stop the other links.
    pub async fn process(self: &Arc<Self>, invocation: &Invocation, sent: &SentLog) -> Result<()> {
        let message = &invocation.message;
        let destination = &message.destination;

        let blacklist = match destination.guild_id {
            Some(guild_id) if !invocation.force => self.settings.blacklist(guild_id).await?,
            _ => HashSet::new(),
        };
        let settings = self
            .settings
            .effective(
                destination.guild_id,
                &destination.scope_chain,
                &self.config.defaults,
            )
            .await?
            .merge(&invocation.overrides);

        if !invocation.force && !settings.auto_enabled() {
            return Ok(());
        }

        let links = scan::find_links(&self.sites, &message.content, &blacklist);
        if links.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            message_id = message.id,
            links = links.len(),
            %settings,
            "crossposting"
        );

        let context = PresentContext {
            transport: self.transport.as_ref(),
            fetch: Arc::clone(&self.fetch),
            translator: self.translator.clone(),
            destination,
            invoker_id: message.author_id,
            sent: sent.clone(),
            config: &self.config,
        };

        let fetch_context = self.fetch_context();
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for link in links {
            if !seen.insert(link.key.clone()) {
                continue;
            }
            let (queue, _hit) = self
                .cache
                .get_or_insert_with(&link.key, || link.new_queue());
            let fetch = queue.handle(&fetch_context);
            pending.push((link, queue, fetch));
        }

        for (link, queue, _) in &pending {
            if let Some(resume) = queue.resume_at() {
                let notice = cooldown_notice(link.site.name(), resume);
                if let Err(error) = context.send_text(&notice).await {
                    tracing::warn!(site = link.site.name(), %error, "failed to send cooldown notice");
                }
            }
        }

        let outcomes =
            futures::future::join_all(pending.iter().map(|(_, _, fetch)| fetch.clone())).await;

        let mut ready = Vec::new();
        for ((link, queue, _), outcome) in pending.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) if queue.is_empty() => {
                    tracing::debug!(key = %link.key, "post has nothing to show");
                }
                Ok(()) => ready.push((queue, link.spoiler)),
                Err(error) if error.is_cancelled() => {}
                Err(error) => report_fetch_error(&context, invocation, &link, &error).await,
            }
        }

        let mut presented = false;
        for group in group_by_author(ready) {
            let mut items: Vec<Item> = Vec::new();
            for (queue, spoiler) in &group {
                match queue
                    .produce(*spoiler, invocation.ranges.as_ref(), &settings)
                    .await
                {
                    Ok(produced) => items.extend(produced),
                    Err(error) => {
                        tracing::warn!(key = %queue.key(), %error, "produce failed");
                    }
                }
            }
            if group.len() > 1 {
                items.sort_by_key(Item::group_priority);
            }
            match present(&context, items, invocation.force).await {
                Ok(shown) => presented |= shown,
                Err(error) => report_render_error(&context, invocation, &error).await,
            }
        }

        if presented && destination.can_suppress_embeds && scan::has_visible_link(&message.content) {
            if let Err(error) = self
                .transport
                .suppress_embeds(destination.channel_id, message.id)
                .await
            {
                tracing::debug!(message_id = message.id, %error, "could not suppress embeds");
            }
        }

        self.schedule_eviction();
        Ok(())
    }

    /// Start a best-effort eviction pass in the background.
    fn schedule_eviction(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.cache.evict().await;
        });
    }

    /// Drop every cached queue.
    pub fn evict_all(&self) -> usize {
        self.cache.evict_all()
    }

    /// Drop the cached queues of one site.
    pub fn evict_site(&self, site: &str) -> usize {
        self.cache.evict_site(site)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Split consecutive queues into runs sharing a site and a known author.
fn group_by_author(ready: Vec<(Arc<Queue>, bool)>) -> Vec<Vec<(Arc<Queue>, bool)>> {
    let mut groups: Vec<Vec<(Arc<Queue>, bool)>> = Vec::new();
    for (queue, spoiler) in ready {
        let joins_last = groups.last().and_then(|group| group.last()).is_some_and(|(last, _)| {
            let author = queue.author();
            author.is_some()
                && author == last.author()
                && last.site().name() == queue.site().name()
        });
        match groups.last_mut() {
            Some(group) if joins_last => group.push((queue, spoiler)),
            _ => groups.push(vec![(queue, spoiler)]),
        }
    }
    groups
}

/// Chat notice for a rate-limited site, as a relative timestamp.
fn cooldown_notice(site: &str, resume: chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "{site} is rate limited, resuming <t:{}:R>",
        resume.timestamp()
    )
}

/// Log a failed fetch and tell the channel. Never fails itself.
async fn report_fetch_error(
    context: &PresentContext<'_>,
    invocation: &Invocation,
    link: &LinkMatch,
    error: &SharedError,
) {
    let destination = &invocation.message.destination;
    if error.is_not_found() {
        tracing::info!(key = %link.key, "post not found");
    } else {
        tracing::error!(
            guild_id = ?destination.guild_id,
            channel_id = destination.channel_id,
            message_id = invocation.message.id,
            site = link.site.name(),
            key = %link.key,
            %error,
            "fetch failed"
        );
    }
    send_best_effort(context, &error.user_message()).await;
}

/// Log a group that failed to render and tell the channel, so later groups
/// still get their turn.
async fn report_render_error(context: &PresentContext<'_>, invocation: &Invocation, error: &Error) {
    let destination = &invocation.message.destination;
    tracing::error!(
        guild_id = ?destination.guild_id,
        channel_id = destination.channel_id,
        message_id = invocation.message.id,
        %error,
        "render failed"
    );
    send_best_effort(context, &error.user_message()).await;
}

async fn send_best_effort(context: &PresentContext<'_>, text: &str) {
    if let Err(error) = context.send_text(text).await {
        tracing::warn!(
            channel_id = context.destination.channel_id,
            %error,
            "failed to send error reply"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fragment::{Embed, FileFragment, TextStyle};
    use crate::messaging::{Destination, Outgoing};
    use crate::settings::RedbSettingsStore;
    use crate::testing::{MockFetch, MockTransport, StaticSite};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const GUILD: u64 = 1;
    const CHANNEL: u64 = 2;

    struct Harness {
        crosspost: Arc<Crosspost>,
        transport: Arc<MockTransport>,
        _dir: tempfile::TempDir,
    }

    fn harness(sites: Vec<StaticSite>, fetch: MockFetch, transport: MockTransport) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            RedbSettingsStore::open(&dir.path().join("settings.redb")).expect("store opens");
        let mut registry = SiteRegistry::new();
        for site in sites {
            registry.register(Arc::new(site));
        }
        let transport = Arc::new(transport);
        let crosspost = Arc::new(Crosspost::new(
            CrosspostConfig::default(),
            CrosspostDeps {
                sites: registry,
                settings: Arc::new(store),
                transport: transport.clone(),
                fetch: Arc::new(fetch),
                translator: None,
            },
        ));
        Harness {
            crosspost,
            transport,
            _dir: dir,
        }
    }

    fn guild_message(id: u64, content: &str) -> IncomingMessage {
        IncomingMessage {
            id,
            author_id: 42,
            content: content.to_string(),
            destination: Destination {
                guild_id: Some(GUILD),
                channel_id: CHANNEL,
                scope_chain: vec![CHANNEL],
                upload_limit: 1000,
                can_suppress_embeds: true,
            },
        }
    }

    fn dm_message(id: u64, content: &str) -> IncomingMessage {
        IncomingMessage {
            id,
            author_id: 42,
            content: content.to_string(),
            destination: Destination::direct(CHANNEL),
        }
    }

    fn files_and_title(count: usize) -> (StaticSite, MockFetch) {
        let mut fetch = MockFetch::new();
        for index in 0..count {
            fetch = fetch.with_file(&format!("https://cdn.test/{index}.png"), 10);
        }
        let site = StaticSite::new("static").with_post(move |queue| {
            for index in 0..count {
                queue.push_file(FileFragment::new(format!("https://cdn.test/{index}.png")));
            }
            queue.push_text("title", TextStyle::caption());
        });
        (site, fetch)
    }

    async fn run(harness: &Harness, invocation: Invocation) {
        harness
            .crosspost
            .process(&invocation, &SentLog::new())
            .await
            .expect("process should succeed");
    }

    #[tokio::test]
    async fn page_cap_truncates_then_title_follows() {
        let (site, fetch) = files_and_title(5);
        let harness = harness(vec![site], fetch, MockTransport::new());
        let invocation = Invocation::automatic(dm_message(1, "https://static.test/1"))
            .with_overrides(Settings {
                max_pages: Some(3),
                ..Settings::default()
            });

        run(&harness, invocation).await;

        let sent = harness.transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[0], Outgoing::Files(files) if files.len() == 3));
        assert_eq!(
            sent[1],
            Outgoing::Text("2 more item(s) at <https://static.test/1>".into())
        );
        assert_eq!(sent[2], Outgoing::Text("title".into()));
    }

    #[tokio::test]
    async fn one_failed_link_does_not_stop_the_others() {
        let (ok, fetch) = files_and_title(1);
        let missing = StaticSite::new("gone").failing(FetchError::NotFound {
            url: "https://gone.test/9".into(),
        });
        let harness = harness(vec![ok, missing], fetch, MockTransport::new());

        run(
            &harness,
            Invocation::automatic(dm_message(1, "https://gone.test/9 https://static.test/1")),
        )
        .await;

        let sent = harness.transport.sent();
        assert_eq!(sent[0], Outgoing::Text("Post not found".into()));
        assert!(matches!(&sent[1], Outgoing::Files(files) if files.len() == 1));
    }

    #[tokio::test]
    async fn repeated_links_fetch_once_and_render_once() {
        let (site, fetch) = files_and_title(1);
        let calls = site.calls();
        let harness = harness(vec![site], fetch, MockTransport::new());

        run(
            &harness,
            Invocation::automatic(dm_message(1, "https://static.test/1 https://static.test/1")),
        )
        .await;
        run(
            &harness,
            Invocation::automatic(dm_message(2, "again: https://static.test/1")),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.transport.sent().len(), 4);
        assert_eq!(harness.crosspost.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn blacklist_and_auto_respect_force() {
        let (site, fetch) = files_and_title(1);
        let harness = harness(vec![site], fetch, MockTransport::new());
        harness
            .crosspost
            .settings()
            .set_site_enabled(GUILD, "static", false)
            .await
            .expect("toggle");

        run(
            &harness,
            Invocation::automatic(guild_message(1, "https://static.test/1")),
        )
        .await;
        assert!(harness.transport.sent().is_empty());

        run(
            &harness,
            Invocation::forced(guild_message(2, "https://static.test/1")),
        )
        .await;
        assert_eq!(harness.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn auto_off_skips_unforced_messages() {
        let (site, fetch) = files_and_title(1);
        let harness = harness(vec![site], fetch, MockTransport::new());
        let invocation = Invocation::automatic(guild_message(1, "https://static.test/1"))
            .with_overrides(Settings {
                auto: Some(false),
                ..Settings::default()
            });

        run(&harness, invocation).await;
        assert!(harness.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn same_author_posts_are_interleaved() {
        let mut fetch = MockFetch::new();
        for url in ["https://cdn.test/a.png", "https://cdn.test/b.png"] {
            fetch = fetch.with_file(url, 10);
        }
        let site = StaticSite::new("static")
            .with_author("alice")
            .with_post(|queue| {
                let id = queue.key().args[0].clone().unwrap_or_default();
                let name = if id == "1" { "a" } else { "b" };
                queue.push_file(FileFragment::new(format!("https://cdn.test/{name}.png")));
                queue.push_text(format!("post {id}"), TextStyle::caption());
            });
        let harness = harness(vec![site], fetch, MockTransport::new());

        run(
            &harness,
            Invocation::automatic(dm_message(1, "https://static.test/1 https://static.test/2")),
        )
        .await;

        let sent = harness.transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Outgoing::Text("post 1".into()));
        assert_eq!(sent[1], Outgoing::Text("post 2".into()));
        assert!(matches!(&sent[2], Outgoing::Files(files) if files.len() == 2));
    }

    #[tokio::test]
    async fn spoilered_link_uploads_spoilered_files() {
        let (site, fetch) = files_and_title(1);
        let harness = harness(vec![site], fetch, MockTransport::new());

        run(
            &harness,
            Invocation::automatic(dm_message(1, "||https://static.test/1||")),
        )
        .await;

        let sent = harness.transport.sent();
        assert!(matches!(&sent[0], Outgoing::Files(files) if files[0].spoiler));
        assert_eq!(sent[1], Outgoing::Text("||title||".into()));
    }

    #[tokio::test]
    async fn embeds_suppress_the_source_preview() {
        let site = StaticSite::new("static").with_post(|queue| {
            queue.push_embed(Embed {
                title: Some("card".into()),
                ..Embed::default()
            });
        });
        let harness = harness(vec![site], MockFetch::new(), MockTransport::new());

        run(
            &harness,
            Invocation::automatic(guild_message(7, "https://static.test/1")),
        )
        .await;
        assert_eq!(harness.transport.suppressed(), vec![(CHANNEL, 7)]);

        run(
            &harness,
            Invocation::automatic(guild_message(8, "<https://static.test/1>")),
        )
        .await;
        assert_eq!(harness.transport.suppressed().len(), 1);
    }

    #[tokio::test]
    async fn deleting_the_source_cancels_and_cleans_up() {
        let site = StaticSite::new("static").with_post(|queue| {
            queue.push_text("first", TextStyle::notice());
            queue.push_text("second", TextStyle::caption());
            queue.push_text("third", TextStyle::notice());
        });
        let transport = MockTransport::new().with_send_delay(Duration::from_millis(100));
        let harness = harness(vec![site], MockFetch::new(), transport);

        harness
            .crosspost
            .on_message(dm_message(5, "https://static.test/1"));
        assert!(harness.crosspost.is_processing(5));
        tokio::time::sleep(Duration::from_millis(150)).await;

        harness.crosspost.on_message_delete(5).await;

        let sent = harness.transport.sent_handles();
        assert!(!sent.is_empty() && sent.len() < 3, "cancelled mid-render");
        assert_eq!(harness.transport.deleted(), sent);
        assert!(!harness.crosspost.is_processing(5));
    }

    #[tokio::test]
    async fn finished_crosspost_survives_deletion() {
        let (site, fetch) = files_and_title(1);
        let harness = harness(vec![site], fetch, MockTransport::new());

        harness
            .crosspost
            .on_message(dm_message(5, "https://static.test/1"));
        for _ in 0..100 {
            if !harness.crosspost.is_processing(5) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        harness.crosspost.on_message_delete(5).await;
        assert_eq!(harness.transport.sent().len(), 2);
        assert!(harness.transport.deleted().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_site_announces_resume_time() {
        let (site, fetch) = files_and_title(1);
        let site = site.with_cooldown(Duration::from_millis(50), 1);
        let harness = harness(vec![site], fetch, MockTransport::new());

        run(
            &harness,
            Invocation::automatic(dm_message(1, "https://static.test/1 https://static.test/2")),
        )
        .await;

        let texts = harness.transport.texts();
        assert!(texts[0].starts_with("static is rate limited, resuming <t:"));
    }

    #[tokio::test]
    async fn later_trigger_during_cooldown_joins_the_waiting_fetch() {
        let (site, fetch) = files_and_title(1);
        let site = site.with_cooldown(Duration::from_millis(300), 1);
        let calls = site.calls();
        let harness = harness(vec![site], fetch, MockTransport::new());

        run(
            &harness,
            Invocation::automatic(dm_message(1, "https://static.test/1")),
        )
        .await;
        harness
            .crosspost
            .on_message(dm_message(2, "https://static.test/2"));
        for _ in 0..100 {
            if harness.crosspost.cache_stats().entries == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        run(
            &harness,
            Invocation::automatic(dm_message(3, "same post https://static.test/2")),
        )
        .await;
        for _ in 0..100 {
            if !harness.crosspost.is_processing(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let notices: Vec<String> = harness
            .transport
            .texts()
            .into_iter()
            .filter(|text| text.starts_with("static is rate limited, resuming <t:"))
            .collect();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0], notices[1]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(harness.crosspost.cache_stats().entries, 2);
    }

    #[tokio::test]
    async fn rejected_render_does_not_stop_later_links() {
        let alpha = StaticSite::new("alpha").with_post(|queue| {
            queue.push_embed(Embed {
                title: Some("card".into()),
                ..Embed::default()
            });
        });
        let beta = StaticSite::new("beta").with_post(|queue| {
            let forced = TextStyle {
                force: true,
                ..TextStyle::default()
            };
            queue.push_text("beta text", forced);
        });
        let harness = harness(
            vec![alpha, beta],
            MockFetch::new(),
            MockTransport::new().rejecting_embeds(),
        );

        run(
            &harness,
            Invocation::automatic(dm_message(1, "https://alpha.test/1 https://beta.test/2")),
        )
        .await;

        let texts = harness.transport.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with("`TransportError`"), "got {texts:?}");
        assert!(texts[1].contains("beta text"));
    }

    #[tokio::test]
    async fn repeated_trigger_keeps_one_crosspost_per_message() {
        let (site, fetch) = files_and_title(1);
        let transport = MockTransport::new().with_send_delay(Duration::from_millis(100));
        let harness = harness(vec![site], fetch, transport);

        harness
            .crosspost
            .on_message(dm_message(5, "https://static.test/1"));
        harness
            .crosspost
            .on_message(dm_message(5, "https://static.test/1"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(harness.crosspost.is_processing(5));

        harness.crosspost.on_message_delete(5).await;

        let sent = harness.transport.sent_handles();
        assert_eq!(sent.len(), 1);
        assert_eq!(harness.transport.deleted(), sent);
    }

    #[tokio::test]
    async fn admin_eviction() {
        let (site, fetch) = files_and_title(1);
        let harness = harness(vec![site], fetch, MockTransport::new());
        run(
            &harness,
            Invocation::automatic(dm_message(1, "https://static.test/1 https://static.test/2")),
        )
        .await;

        assert_eq!(harness.crosspost.cache_stats().entries, 2);
        assert_eq!(harness.crosspost.evict_site("other"), 0);
        assert_eq!(harness.crosspost.evict_site("static"), 2);
        assert_eq!(harness.crosspost.evict_all(), 0);
    }

    #[test]
    fn grouping_needs_known_matching_author() {
        let site = Arc::new(crate::sites::RegisteredSite::new(Arc::new(StaticSite::new(
            "static",
        ))));
        let make = |id: &str, author: Option<&str>| {
            let queue = Queue::new(
                Arc::clone(&site),
                crate::queue::QueueKey {
                    site: "static".into(),
                    args: vec![Some(id.into())],
                },
                id,
            );
            if let Some(author) = author {
                queue.set_author(author);
            }
            (Arc::new(queue), false)
        };

        let groups = group_by_author(vec![
            make("1", Some("alice")),
            make("2", Some("alice")),
            make("3", None),
            make("4", None),
            make("5", Some("bob")),
        ]);
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1, 1]);
    }
}
