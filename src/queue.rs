//! Fragment queues: one upstream fetch and the fragments it produced.

pub mod cache;
pub mod present;

pub use cache::{CacheStats, QueueCache};
pub use present::{PresentContext, present};

use crate::error::{Error, FetchError, SettingsError, SharedError};
use crate::fragment::{
    Embed, FallbackCandidate, FallbackFragment, FileFragment, Fragment, TextFragment, TextStyle,
};
use crate::settings::Settings;
use crate::sites::{FetchContext, RegisteredSite, Reservation};

use futures::future::{BoxFuture, FutureExt as _, Shared};
use parking_lot::{Mutex, RwLock};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Fixed accounting overhead per queue.
const QUEUE_OVERHEAD: u64 = 512;

/// Outcome of a queue's one fetch, shared by every waiter.
pub type FetchOutcome = std::result::Result<(), SharedError>;

/// Handle on a queue's in-flight (or finished) fetch.
pub type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Cache identity of an upstream resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub site: String,
    pub args: Vec<Option<String>>,
}

impl QueueKey {
    /// Key from a pattern match: the captured groups, or the whole match if
    /// the pattern captures nothing.
    pub fn from_captures(site: &str, captures: &regex::Captures<'_>) -> Self {
        let args = if captures.len() > 1 {
            captures
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect()
        } else {
            vec![Some(captures[0].to_string())]
        };
        Self {
            site: site.to_string(),
            args,
        }
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.site)?;
        for arg in &self.args {
            write!(f, ":{}", arg.as_deref().unwrap_or("-"))?;
        }
        Ok(())
    }
}

/// Lifecycle of a queue's single fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Unstarted,
    Fetching,
    Fetched,
    Failed,
}

enum FetchState {
    Unstarted,
    Pending(SharedFetch),
    Done,
    Failed(SharedError),
}

/// Ordered fragments and fetch state for one upstream resource.
pub struct Queue {
    key: QueueKey,
    site: Arc<RegisteredSite>,
    link: RwLock<String>,
    author: RwLock<Option<String>>,
    fragments: RwLock<Vec<Fragment>>,
    last_used: Mutex<Instant>,
    reservation: Mutex<Option<Reservation>>,
    state: Mutex<FetchState>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("key", &self.key)
            .field("phase", &self.phase())
            .field("fragments", &self.fragments.read().len())
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// `link` is the matched text; sites may replace it with a canonical URL.
    pub fn new(site: Arc<RegisteredSite>, key: QueueKey, link: impl Into<String>) -> Self {
        Self {
            key,
            site,
            link: RwLock::new(link.into()),
            author: RwLock::new(None),
            fragments: RwLock::new(Vec::new()),
            last_used: Mutex::new(Instant::now()),
            reservation: Mutex::new(None),
            state: Mutex::new(FetchState::Unstarted),
        }
    }

    /// Site and post identity this queue was built for.
    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    /// Adapter that fills this queue.
    pub fn site(&self) -> &Arc<RegisteredSite> {
        &self.site
    }

    /// Canonical link back to the post.
    pub fn link(&self) -> String {
        self.link.read().clone()
    }

    /// Replace the canonical link with the one the adapter reports.
    pub fn set_link(&self, link: impl Into<String>) {
        *self.link.write() = link.into();
    }

    /// Post author, if the adapter reported one. Used for grouping.
    pub fn author(&self) -> Option<String> {
        self.author.read().clone()
    }

    /// Record the post author.
    pub fn set_author(&self, author: impl Into<String>) {
        *self.author.write() = Some(author.into());
    }

    /// Append a file in post order.
    pub fn push_file(&self, file: FileFragment) {
        self.fragments.write().push(Fragment::File(Arc::new(file)));
    }

    /// Empty candidate lists are ignored.
    pub fn push_fallback(&self, candidates: Vec<FallbackCandidate>) {
        if let Some(fallback) = FallbackFragment::new(candidates) {
            self.fragments
                .write()
                .push(Fragment::Fallback(Arc::new(fallback)));
        }
    }

    /// Append an embed in post order.
    pub fn push_embed(&self, embed: Embed) {
        self.fragments.write().push(Fragment::Embed(Arc::new(embed)));
    }

    /// Consecutive text with an identical style merges into one fragment.
    pub fn push_text(&self, content: impl Into<String>, style: TextStyle) {
        let content = content.into();
        let mut fragments = self.fragments.write();
        if let Some(Fragment::Text(last)) = fragments.last_mut() {
            if last.style == style {
                last.content.push('\n');
                last.content.push_str(&content);
                return;
            }
        }
        fragments.push(Fragment::Text(TextFragment::new(content, style)));
    }

    /// Snapshot of everything pushed so far.
    pub fn fragments(&self) -> Vec<Fragment> {
        self.fragments.read().clone()
    }

    /// Whether the adapter pushed nothing.
    pub fn is_empty(&self) -> bool {
        self.fragments.read().is_empty()
    }

    /// Last time a message used this queue. Eviction drops the oldest first.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Mark the queue as used now.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// When a rate-limited fetch is scheduled to start. Every caller sees
    /// the same time until the fetch begins.
    pub fn resume_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.reservation.lock().map(|reservation| reservation.wall)
    }

    /// Where the fetch stands.
    pub fn phase(&self) -> QueuePhase {
        match &*self.state.lock() {
            FetchState::Unstarted => QueuePhase::Unstarted,
            FetchState::Pending(_) => QueuePhase::Fetching,
            FetchState::Done => QueuePhase::Fetched,
            FetchState::Failed(_) => QueuePhase::Failed,
        }
    }

    /// Whether the fetch finished with an error.
    pub fn is_failed(&self) -> bool {
        self.phase() == QueuePhase::Failed
    }

    pub fn estimated_size(&self) -> u64 {
        let key: usize = self
            .key
            .args
            .iter()
            .map(|arg| arg.as_ref().map_or(0, String::len))
            .sum();
        let fragments: u64 = self
            .fragments
            .read()
            .iter()
            .map(Fragment::estimated_size)
            .sum();
        QUEUE_OVERHEAD + key as u64 + self.link.read().len() as u64 + fragments
    }

    /// Start the fetch if nobody has, and return the shared handle on it.
    ///
    /// The first call books a rate-limiter slot and spawns the fetch; every
    /// later call gets the same future, or the finished outcome.
    pub fn handle(self: &Arc<Self>, context: &FetchContext) -> SharedFetch {
        let mut state = self.state.lock();
        match &*state {
            FetchState::Pending(shared) => return shared.clone(),
            FetchState::Done => return futures::future::ready(Ok(())).boxed().shared(),
            FetchState::Failed(error) => {
                return futures::future::ready(Err(Arc::clone(error)))
                    .boxed()
                    .shared();
            }
            FetchState::Unstarted => {}
        }

        let reservation = self.site.reserve();
        *self.reservation.lock() = reservation;

        let task = tokio::spawn(Arc::clone(self).run(context.clone(), reservation));
        let shared = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(Arc::new(Error::from(FetchError::Aborted(
                    join_error.to_string(),
                )))),
            }
        }
        .boxed()
        .shared();

        *state = FetchState::Pending(shared.clone());
        tracing::debug!(key = %self.key, "fetch started");
        shared
    }

    async fn run(
        self: Arc<Self>,
        context: FetchContext,
        reservation: Option<Reservation>,
    ) -> FetchOutcome {
        let fetch = async {
            if let Some(reservation) = reservation {
                tracing::info!(
                    key = %self.key,
                    resume = %reservation.wall,
                    "site cooldown, delaying fetch"
                );
                tokio::time::sleep_until(reservation.instant).await;
                self.site.acquire().await;
            }
            *self.reservation.lock() = None;
            let args = self.key.args.clone();
            self.site.site().handle(&context, &self, &args).await
        };

        let result = tokio::select! {
            _ = context.cancel.cancelled() => Err(Error::from(FetchError::Cancelled)),
            result = fetch => result,
        };

        let outcome = result.map_err(Arc::new);
        *self.state.lock() = match &outcome {
            Ok(()) => {
                tracing::debug!(key = %self.key, fragments = self.fragments.read().len(), "fetch finished");
                FetchState::Done
            }
            Err(error) => {
                tracing::debug!(key = %self.key, %error, "fetch failed");
                FetchState::Failed(Arc::clone(error))
            }
        };
        outcome
    }

    /// Wait for the fetch to finish.
    pub async fn wait(&self) -> FetchOutcome {
        let pending = {
            let state = self.state.lock();
            match &*state {
                FetchState::Unstarted => {
                    return Err(Arc::new(Error::Other(anyhow::anyhow!(
                        "queue {} was never fetched",
                        self.key
                    ))));
                }
                FetchState::Pending(shared) => shared.clone(),
                FetchState::Done => return Ok(()),
                FetchState::Failed(error) => return Err(Arc::clone(error)),
            }
        };
        pending.await
    }

    /// Select the fragments to render, in order.
    ///
    /// With `ranges`, files are picked by 1-based position and forced or
    /// non-interlaced text follows. Otherwise `max_pages` caps the files and
    /// a notice with the remaining count takes the place of the first
    /// dropped file.
    pub async fn produce(
        self: &Arc<Self>,
        spoiler: bool,
        ranges: Option<&PageRanges>,
        settings: &Settings,
    ) -> std::result::Result<Vec<Item>, SharedError> {
        self.wait().await?;
        self.touch();

        let fragments = self.fragments();
        let item = |fragment: Fragment| Item {
            queue: Arc::clone(self),
            fragment,
            spoiler,
        };
        let text_allowed = |text: &TextFragment| settings.text_enabled() || text.style.force;

        if let Some(ranges) = ranges {
            let files: Vec<&Fragment> = fragments.iter().filter(|f| f.is_file()).collect();
            let mut items: Vec<Item> = ranges
                .indices(files.len())
                .into_iter()
                .map(|index| item(files[index].clone()))
                .collect();
            for fragment in &fragments {
                if let Fragment::Text(text) = fragment {
                    if (text.style.force || !text.style.interlaced) && text_allowed(text) {
                        items.push(item(fragment.clone()));
                    }
                }
            }
            return Ok(items);
        }

        let max_pages = settings.max_pages() as usize;
        let total_files = fragments.iter().filter(|f| f.is_file()).count();
        let mut items = Vec::with_capacity(fragments.len());
        let mut taken = 0;
        let mut truncated = false;
        for fragment in fragments {
            match &fragment {
                Fragment::File(_) | Fragment::Fallback(_) => {
                    if max_pages == 0 || taken < max_pages {
                        taken += 1;
                        items.push(item(fragment));
                    } else if !truncated {
                        truncated = true;
                        items.push(Item {
                            queue: Arc::clone(self),
                            fragment: Fragment::Text(self.remaining_notice(total_files - taken)),
                            spoiler: false,
                        });
                    }
                }
                Fragment::Embed(_) => items.push(item(fragment)),
                Fragment::Text(text) => {
                    if text_allowed(text) {
                        items.push(item(fragment));
                    }
                }
            }
        }
        Ok(items)
    }

    fn remaining_notice(&self, remaining: usize) -> TextFragment {
        TextFragment::new(
            format!("{remaining} more item(s) at <{}>", self.link()),
            TextStyle::notice(),
        )
    }
}

/// One fragment selected for rendering.
#[derive(Debug, Clone)]
pub struct Item {
    pub queue: Arc<Queue>,
    pub fragment: Fragment,
    pub spoiler: bool,
}

impl Item {
    /// Interleave order inside a grouped batch.
    pub(crate) fn group_priority(&self) -> u8 {
        match self.fragment {
            Fragment::Fallback(_) => 0,
            Fragment::Embed(_) => 1,
            Fragment::Text(_) => 2,
            Fragment::File(_) => 3,
        }
    }
}

/// 1-based inclusive page ranges, e.g. `1-2,5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRanges(Vec<(usize, usize)>);

impl PageRanges {
    pub fn new(ranges: Vec<(usize, usize)>) -> std::result::Result<Self, SettingsError> {
        for &(start, end) in &ranges {
            if start == 0 || end < start {
                return Err(SettingsError::InvalidRange(format!("{start}-{end}")));
            }
        }
        if ranges.is_empty() {
            return Err(SettingsError::InvalidRange("empty".into()));
        }
        Ok(Self(ranges))
    }

    pub fn parse(input: &str) -> std::result::Result<Self, SettingsError> {
        let invalid = || SettingsError::InvalidRange(input.to_string());
        let mut ranges = Vec::new();
        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => (start.trim(), end.trim()),
                None => (part, part),
            };
            let start: usize = start.parse().map_err(|_| invalid())?;
            let end: usize = end.parse().map_err(|_| invalid())?;
            ranges.push((start, end));
        }
        Self::new(ranges)
    }

    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.0
    }

    /// Zero-based indices into a list of `len` items, in range order.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        self.0
            .iter()
            .flat_map(|&(start, end)| start..=end.min(len))
            .map(|position| position - 1)
            .collect()
    }
}

impl FromStr for PageRanges {
    type Err = SettingsError;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticSite, fetch_context};

    fn queue_for(site: StaticSite) -> Arc<Queue> {
        let registered = Arc::new(RegisteredSite::new(Arc::new(site)));
        let key = QueueKey {
            site: "static".into(),
            args: vec![Some("1".into())],
        };
        Arc::new(Queue::new(registered, key, "https://static.test/1"))
    }

    fn files(count: usize) -> StaticSite {
        StaticSite::new("static").with_post(move |queue| {
            for index in 0..count {
                queue.push_file(FileFragment::new(format!("https://cdn.test/{index}.png")));
            }
        })
    }

    fn settings(max_pages: u32, text: bool) -> Settings {
        Settings {
            auto: Some(true),
            max_pages: Some(max_pages),
            text: Some(text),
        }
    }

    fn describe(items: &[Item]) -> Vec<String> {
        items
            .iter()
            .map(|item| match &item.fragment {
                Fragment::File(file) => file.url().unwrap_or_default().to_string(),
                Fragment::Fallback(_) => "fallback".into(),
                Fragment::Embed(_) => "embed".into(),
                Fragment::Text(text) => text.content.clone(),
            })
            .collect()
    }

    #[test]
    fn consecutive_same_style_text_merges() {
        let queue = queue_for(StaticSite::new("static"));
        queue.push_text("one", TextStyle::caption());
        queue.push_text("two", TextStyle::caption());
        queue.push_text("three", TextStyle::notice());

        let fragments = queue.fragments();
        assert_eq!(fragments.len(), 2);
        assert_eq!(
            fragments[0].as_text().map(|t| t.content.as_str()),
            Some("one\ntwo")
        );
        assert_eq!(
            fragments[1].as_text().map(|t| t.content.as_str()),
            Some("three")
        );
    }

    #[tokio::test]
    async fn concurrent_handles_share_one_fetch() {
        let site = files(1);
        let calls = site.calls();
        let queue = queue_for(site);
        let context = fetch_context();

        let handles: Vec<_> = (0..5).map(|_| queue.handle(&context)).collect();
        let outcomes = futures::future::join_all(handles).await;

        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(queue.phase(), QueuePhase::Fetched);
        assert!(queue.handle(&context).await.is_ok());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_shared_by_every_waiter() {
        let site = StaticSite::new("static").failing(FetchError::NotFound {
            url: "https://static.test/1".into(),
        });
        let calls = site.calls();
        let queue = queue_for(site);
        let context = fetch_context();

        let (first, second) = tokio::join!(queue.handle(&context), queue.handle(&context));
        let first = first.expect_err("fetch should fail");
        let second = second.expect_err("fetch should fail");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_not_found());
        assert!(queue.is_failed());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_fails_the_fetch() {
        let site = StaticSite::new("static").stalled();
        let queue = queue_for(site);
        let context = fetch_context();

        let pending = queue.handle(&context);
        context.cancel.cancel();
        let error = pending.await.expect_err("cancelled fetch fails");
        assert!(error.is_cancelled());
    }

    #[tokio::test]
    async fn produce_before_handle_is_an_error() {
        let queue = queue_for(files(1));
        assert!(queue.produce(false, None, &settings(0, true)).await.is_err());
    }

    #[tokio::test]
    async fn max_pages_truncates_with_notice() {
        let queue = queue_for(files(5));
        queue.handle(&fetch_context()).await.expect("fetch");

        let items = queue
            .produce(false, None, &settings(2, true))
            .await
            .expect("produce");

        assert_eq!(
            describe(&items),
            vec![
                "https://cdn.test/0.png",
                "https://cdn.test/1.png",
                "3 more item(s) at <https://static.test/1>",
            ]
        );
        assert!(items[2].fragment.as_text().is_some_and(|t| t.style.force));
    }

    #[tokio::test]
    async fn notice_precedes_trailing_title() {
        let site = StaticSite::new("static").with_post(|queue| {
            for index in 0..5 {
                queue.push_file(FileFragment::new(format!("https://cdn.test/{index}.png")));
            }
            queue.push_text("title", TextStyle::caption());
        });
        let queue = queue_for(site);
        queue.handle(&fetch_context()).await.expect("fetch");

        let items = queue
            .produce(false, None, &settings(3, true))
            .await
            .expect("produce");
        assert_eq!(
            describe(&items),
            vec![
                "https://cdn.test/0.png",
                "https://cdn.test/1.png",
                "https://cdn.test/2.png",
                "2 more item(s) at <https://static.test/1>",
                "title",
            ]
        );
    }

    #[tokio::test]
    async fn text_setting_filters_unforced_text() {
        let site = StaticSite::new("static").with_post(|queue| {
            queue.push_text("caption", TextStyle::caption());
            queue.push_file(FileFragment::new("https://cdn.test/0.png"));
            queue.push_text("warning", TextStyle::notice());
            queue.push_embed(Embed::default());
        });
        let queue = queue_for(site);
        queue.handle(&fetch_context()).await.expect("fetch");

        let items = queue
            .produce(true, None, &settings(0, false))
            .await
            .expect("produce");
        assert_eq!(
            describe(&items),
            vec!["https://cdn.test/0.png", "warning", "embed"]
        );
        assert!(items.iter().all(|item| item.spoiler));
    }

    #[tokio::test]
    async fn ranges_select_files_and_ignore_max_pages() {
        let site = StaticSite::new("static").with_post(|queue| {
            for index in 0..6 {
                queue.push_file(FileFragment::new(format!("https://cdn.test/{index}.png")));
            }
            queue.push_text("caption", TextStyle::caption());
            queue.push_text("credit", TextStyle::default());
        });
        let queue = queue_for(site);
        queue.handle(&fetch_context()).await.expect("fetch");

        let ranges = PageRanges::parse("1-2,5").expect("valid ranges");
        let items = queue
            .produce(false, Some(&ranges), &settings(1, true))
            .await
            .expect("produce");
        assert_eq!(
            describe(&items),
            vec![
                "https://cdn.test/0.png",
                "https://cdn.test/1.png",
                "https://cdn.test/4.png",
                "credit",
            ]
        );
    }

    #[tokio::test]
    async fn produce_refreshes_last_used() {
        let queue = queue_for(files(1));
        queue.handle(&fetch_context()).await.expect("fetch");
        let before = queue.last_used();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        queue
            .produce(false, None, &settings(0, true))
            .await
            .expect("produce");
        assert!(queue.last_used() > before);
    }

    #[test]
    fn parses_page_ranges() {
        let ranges = PageRanges::parse("1-2, 5").expect("valid");
        assert_eq!(ranges.ranges(), &[(1, 2), (5, 5)]);
        assert_eq!(ranges.indices(6), vec![0, 1, 4]);
        assert_eq!(ranges.indices(4), vec![0, 1]);

        assert!(PageRanges::parse("0-2").is_err());
        assert!(PageRanges::parse("3-1").is_err());
        assert!(PageRanges::parse("a").is_err());
        assert!(PageRanges::parse("").is_err());
        assert!("2-3".parse::<PageRanges>().is_ok());
    }

    #[test]
    fn keys_ignore_surrounding_text() {
        let pattern = regex::Regex::new(r"site\.test/(\w+)(?:/(\d+))?").expect("regex");
        let a = pattern.captures("look: site.test/abc !").expect("match");
        let b = pattern.captures("site.test/abc").expect("match");
        assert_eq!(
            QueueKey::from_captures("site", &a),
            QueueKey::from_captures("site", &b)
        );
        assert_eq!(QueueKey::from_captures("site", &a).args, vec![Some("abc".into()), None]);

        let bare = regex::Regex::new(r"site\.test/\w+").expect("regex");
        let c = bare.captures("x site.test/abc y").expect("match");
        assert_eq!(
            QueueKey::from_captures("site", &c).args,
            vec![Some("site.test/abc".to_string())]
        );
    }
}
