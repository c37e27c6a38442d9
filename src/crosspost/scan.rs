//! Finding site links in message text.

use crate::queue::{Queue, QueueKey};
use crate::sites::{RegisteredSite, SiteRegistry};

use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

/// One recognized link.
#[derive(Debug, Clone)]
pub struct LinkMatch {
    pub site: Arc<RegisteredSite>,
    pub key: QueueKey,
    /// The matched text.
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// Fully enclosed in a `||spoiler||` span.
    pub spoiler: bool,
}

impl LinkMatch {
    /// A fresh, unfetched queue for this link.
    pub fn new_queue(&self) -> Queue {
        Queue::new(Arc::clone(&self.site), self.key.clone(), self.text.clone())
    }
}

/// Every match of every enabled site, ordered by position.
///
/// Patterns of different sites may overlap; all matches are kept.
pub fn find_links(
    sites: &SiteRegistry,
    content: &str,
    blacklist: &HashSet<String>,
) -> Vec<LinkMatch> {
    let spoilers = spoiler_spans(content);
    let mut matches = Vec::new();

    for site in sites.iter() {
        if blacklist.contains(site.name()) {
            continue;
        }
        for captures in site.site().pattern().captures_iter(content) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            let (start, end) = (whole.start(), whole.end());
            matches.push(LinkMatch {
                site: Arc::clone(site),
                key: QueueKey::from_captures(site.name(), &captures),
                text: whole.as_str().to_string(),
                start,
                end,
                spoiler: spoilers
                    .iter()
                    .any(|&(open, close)| open <= start && end <= close),
            });
        }
    }

    matches.sort_by_key(|link| link.start);
    matches
}

/// Byte ranges inside `||...||` markers.
pub fn spoiler_spans(content: &str) -> Vec<(usize, usize)> {
    static SPOILER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)\|\|(.+?)\|\|").expect("hardcoded regex"));
    SPOILER
        .captures_iter(content)
        .filter_map(|captures| captures.get(1))
        .map(|inner| (inner.start(), inner.end()))
        .collect()
}

/// Whether the message shows at least one link preview, i.e. has a URL not
/// wrapped in `<...>`.
pub fn has_visible_link(content: &str) -> bool {
    static URL: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"https?://[^\s<>|]+").expect("hardcoded regex"));
    URL.find_iter(content).any(|url| {
        let before = content[..url.start()].chars().next_back();
        let after = content[url.end()..].chars().next();
        !(before == Some('<') && after == Some('>'))
    })
}
