//! Per-destination crosspost settings and their merge chain.

pub mod store;

pub use store::{RedbSettingsStore, Scope, SettingsStore};

use serde::{Deserialize, Serialize};

/// Optional settings triple stored per (guild, scope).
///
/// `None` means "inherit from the less specific scope".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Post automatically when a link is seen.
    pub auto: Option<bool>,
    /// Cap on file pages per post. `0` is unlimited.
    pub max_pages: Option<u32>,
    /// Include the post's text context.
    pub text: Option<bool>,
}

impl Settings {
    /// Defaults for direct messages, where no guild settings exist.
    pub const DM_DEFAULT: Settings = Settings {
        auto: Some(true),
        max_pages: Some(0),
        text: Some(true),
    };

    /// Combine with a more specific instance: its non-null fields win.
    pub fn merge(&self, overriding: &Settings) -> Settings {
        Settings {
            auto: overriding.auto.or(self.auto),
            max_pages: overriding.max_pages.or(self.max_pages),
            text: overriding.text.or(self.text),
        }
    }

    /// Fold a chain ordered from least to most specific.
    pub fn merge_chain<'a>(chain: impl IntoIterator<Item = &'a Settings>) -> Settings {
        chain
            .into_iter()
            .fold(Settings::default(), |acc, next| acc.merge(next))
    }

    pub fn is_empty(&self) -> bool {
        self.auto.is_none() && self.max_pages.is_none() && self.text.is_none()
    }

    pub fn auto_enabled(&self) -> bool {
        self.auto.or(Self::DM_DEFAULT.auto).unwrap_or(true)
    }

    /// Page cap, `0` meaning unlimited.
    pub fn max_pages(&self) -> u32 {
        self.max_pages.or(Self::DM_DEFAULT.max_pages).unwrap_or(0)
    }

    pub fn text_enabled(&self) -> bool {
        self.text.or(Self::DM_DEFAULT.text).unwrap_or(true)
    }
}

impl std::fmt::Display for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn show<T: std::fmt::Display>(value: Option<T>) -> String {
            value.map_or_else(|| "inherit".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "auto={} max_pages={} text={}",
            show(self.auto),
            show(self.max_pages),
            show(self.text)
        )
    }
}
