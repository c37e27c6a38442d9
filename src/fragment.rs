//! Fragments: the renderable units a site adapter produces for one post.

pub mod file;

pub use file::{Downloaded, FallbackCandidate, FallbackFragment, FileFragment, PostProcess};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Fixed accounting overhead per fragment, on top of owned payload bytes.
pub(crate) const FRAGMENT_OVERHEAD: u64 = 128;

/// One unit of crosspost output.
#[derive(Debug, Clone)]
pub enum Fragment {
    File(Arc<FileFragment>),
    Fallback(Arc<FallbackFragment>),
    Embed(Arc<Embed>),
    Text(TextFragment),
}

impl Fragment {
    /// File-like fragments count against page limits and upload batches.
    pub fn is_file(&self) -> bool {
        matches!(self, Fragment::File(_) | Fragment::Fallback(_))
    }

    pub fn as_text(&self) -> Option<&TextFragment> {
        match self {
            Fragment::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Approximate in-memory size, including any downloaded bytes.
    pub fn estimated_size(&self) -> u64 {
        match self {
            Fragment::File(file) => file.estimated_size(),
            Fragment::Fallback(fallback) => fallback.estimated_size(),
            Fragment::Embed(embed) => embed.estimated_size(),
            Fragment::Text(text) => FRAGMENT_OVERHEAD + text.content.len() as u64,
        }
    }
}

/// Rich metadata block, rendered by the transport as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub color: Option<u32>,
    pub author_name: Option<String>,
    pub author_url: Option<String>,
    pub author_icon: Option<String>,
    pub image: Option<String>,
    pub thumbnail: Option<String>,
    pub footer: Option<String>,
    #[serde(default)]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl Embed {
    fn estimated_size(&self) -> u64 {
        let strings = [
            &self.title,
            &self.description,
            &self.url,
            &self.author_name,
            &self.author_url,
            &self.author_icon,
            &self.image,
            &self.thumbnail,
            &self.footer,
        ];
        let text: usize = strings.iter().filter_map(|s| s.as_ref()).map(String::len).sum();
        let fields: usize = self
            .fields
            .iter()
            .map(|field| field.name.len() + field.value.len())
            .sum();
        FRAGMENT_OVERHEAD + (text + fields) as u64
    }
}

/// Length class of a text fragment; bounds its rendered size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TextSize {
    Short,
    #[default]
    Medium,
    Long,
}

impl TextSize {
    pub fn limit(self) -> usize {
        match self {
            TextSize::Short => 256,
            TextSize::Medium => 1024,
            TextSize::Long => 4000,
        }
    }
}

/// Styling flags for a text fragment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextStyle {
    pub bold: bool,
    pub italic: bool,
    pub quote: bool,
    /// Rendered as footnote-sized subtext.
    pub diminished: bool,
    pub escape: bool,
    /// Always rendered as its own message, regardless of the text setting.
    pub force: bool,
    /// May be merged with adjacent text from the same post.
    pub interlaced: bool,
    pub skip_translate: bool,
    pub size: TextSize,
}

impl TextStyle {
    /// Post body text: escaped, mergeable, translatable.
    pub fn caption() -> Self {
        Self {
            escape: true,
            interlaced: true,
            size: TextSize::Long,
            ..Self::default()
        }
    }

    /// Pipeline notices such as the truncation count.
    pub fn notice() -> Self {
        Self {
            force: true,
            skip_translate: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFragment {
    pub content: String,
    pub style: TextStyle,
}

impl TextFragment {
    pub fn new(content: impl Into<String>, style: TextStyle) -> Self {
        Self {
            content: content.into(),
            style,
        }
    }

    /// Render with markdown styling applied.
    pub fn render(&self, spoiler: bool) -> String {
        render_styled(&self.content, &self.style, spoiler)
    }
}

/// Apply a text style to arbitrary content.
pub fn render_styled(content: &str, style: &TextStyle, spoiler: bool) -> String {
    let escaped = if style.escape {
        escape_markdown(content)
    } else {
        content.to_string()
    };
    let body = truncate_chars(escaped.trim(), style.size.limit());

    let mut prefix = String::new();
    if style.quote {
        prefix.push_str("> ");
    }
    if style.diminished {
        prefix.push_str("-# ");
    }

    body.lines()
        .map(|line| {
            if line.trim().is_empty() {
                return prefix.trim_end().trim_end_matches("-#").trim_end().to_string();
            }
            let mut styled = line.to_string();
            if style.italic {
                styled = format!("*{styled}*");
            }
            if style.bold {
                styled = format!("**{styled}**");
            }
            if spoiler {
                styled = format!("||{styled}||");
            }
            format!("{prefix}{styled}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Escape Discord markdown control characters.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        if matches!(character, '\\' | '*' | '_' | '~' | '|' | '`' | '>') {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}

/// Truncate to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some(_) => {
            let keep = max_chars.saturating_sub(1);
            let end = text
                .char_indices()
                .nth(keep)
                .map_or(text.len(), |(index, _)| index);
            format!("{}…", &text[..end])
        }
    }
}
