//! Site adapters: recognize links and populate a queue with fragments.

pub mod bluesky;
pub mod mastodon;

pub use bluesky::Bluesky;
pub use mastodon::Mastodon;

use crate::config::SitesConfig;
use crate::error::Result;
use crate::http::Fetch;
use crate::queue::Queue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use regex::Regex;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything a site needs while fetching.
#[derive(Clone)]
pub struct FetchContext {
    pub fetch: Arc<dyn Fetch>,
    /// Cancelled on shutdown.
    pub cancel: CancellationToken,
}

impl FetchContext {
    pub fn new(fetch: Arc<dyn Fetch>, cancel: CancellationToken) -> Self {
        Self { fetch, cancel }
    }
}

/// Per-site global call budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    pub window: Duration,
    pub max_calls: usize,
}

/// A pluggable upstream site.
#[async_trait]
pub trait Site: Send + Sync + 'static {
    /// Unique name, used in cache keys and blacklists.
    fn name(&self) -> &str;

    /// Pattern over message text. Capture groups become the fetch arguments.
    fn pattern(&self) -> &Regex;

    fn cooldown(&self) -> Option<Cooldown> {
        None
    }

    /// Whether this site's files may download in parallel.
    fn concurrent(&self) -> bool {
        true
    }

    async fn load(&self, _context: &FetchContext) -> Result<()> {
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }

    /// Fetch the post identified by `args` and push its fragments onto `queue`.
    async fn handle(
        &self,
        context: &FetchContext,
        queue: &Queue,
        args: &[Option<String>],
    ) -> Result<()>;
}

/// A delayed call slot, on the runtime clock and the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub instant: Instant,
    pub wall: DateTime<Utc>,
}

impl Reservation {
    fn after(delay: Duration) -> Self {
        Self {
            instant: Instant::now() + delay,
            wall: Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }
}

type DirectLimiter<C> =
    Governor<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Call budget shared by every queue of one site: `max_calls` per `window`,
/// admitted as a burst and then spaced evenly.
pub struct RateLimiter<C: Clock = DefaultClock> {
    clock: C,
    limiter: DirectLimiter<C>,
}

impl RateLimiter {
    /// `None` when the cooldown admits no calls at all.
    pub fn new(cooldown: Cooldown) -> Option<Self> {
        Self::with_clock(cooldown, DefaultClock::default())
    }

    /// Take a call slot now if one is free. Otherwise returns when the next
    /// slot opens; the caller claims it with [`RateLimiter::acquire`].
    pub fn reserve(&self) -> Option<Reservation> {
        self.delay().map(Reservation::after)
    }
}

impl<C: Clock + Clone> RateLimiter<C> {
    fn with_clock(cooldown: Cooldown, clock: C) -> Option<Self> {
        let burst = NonZeroU32::new(u32::try_from(cooldown.max_calls).ok()?)?;
        let quota = Quota::with_period(cooldown.window / burst.get())?.allow_burst(burst);
        Some(Self {
            limiter: Governor::direct_with_clock(quota, clock.clone()),
            clock,
        })
    }

    /// Take a slot if one is free, else how long until one is.
    fn delay(&self) -> Option<Duration> {
        match self.limiter.check() {
            Ok(()) => None,
            Err(not_until) => Some(not_until.wait_time_from(self.clock.now())),
        }
    }

    /// Wait for a free slot and take it.
    pub async fn acquire(&self) {
        while let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// A site plus its shared limiter.
pub struct RegisteredSite {
    site: Arc<dyn Site>,
    limiter: Option<RateLimiter>,
}

impl RegisteredSite {
    pub fn new(site: Arc<dyn Site>) -> Self {
        let limiter = site.cooldown().and_then(RateLimiter::new);
        Self { site, limiter }
    }

    pub fn name(&self) -> &str {
        self.site.name()
    }

    pub fn site(&self) -> &dyn Site {
        self.site.as_ref()
    }

    pub fn concurrent(&self) -> bool {
        self.site.concurrent()
    }

    /// Book a fetch slot; `None` means the fetch may start right away.
    pub fn reserve(&self) -> Option<Reservation> {
        self.limiter.as_ref().and_then(RateLimiter::reserve)
    }

    /// Claim the slot a reservation waited for.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
    }
}

impl std::fmt::Debug for RegisteredSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSite")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// All sites known to the orchestrator, in registration order.
#[derive(Default)]
pub struct SiteRegistry {
    sites: Vec<Arc<RegisteredSite>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry of built-in sites enabled in config.
    pub fn from_config(config: &SitesConfig) -> Result<Self> {
        let mut registry = Self::new();
        if config.bluesky.enabled {
            registry.register(Arc::new(Bluesky::new(&config.bluesky)));
        }
        if config.mastodon.enabled {
            registry.register(Arc::new(Mastodon::new(&config.mastodon)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, site: Arc<dyn Site>) {
        tracing::debug!(site = site.name(), "site registered");
        self.sites.push(Arc::new(RegisteredSite::new(site)));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredSite>> {
        self.sites.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredSite>> {
        self.sites.iter().find(|site| site.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.sites.iter().map(|site| site.name()).collect()
    }

    /// Run every site's load hook. A failing site is logged and kept.
    pub async fn load_all(&self, context: &FetchContext) {
        for site in &self.sites {
            if let Err(error) = site.site().load(context).await {
                tracing::error!(site = site.name(), %error, "site failed to load");
            }
        }
    }

    pub async fn unload_all(&self) {
        for site in &self.sites {
            if let Err(error) = site.site().unload().await {
                tracing::warn!(site = site.name(), %error, "site failed to unload");
            }
        }
    }
}
