//! Mastodon statuses on configured instances.

use crate::config::MastodonConfig;
use crate::error::{ConfigError, Result};
use crate::fragment::{Embed, FallbackCandidate, FileFragment, TextStyle};
use crate::http::{FetchRequest, fetch_json};
use crate::queue::Queue;
use crate::sites::{FetchContext, Site};

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Node};
use serde::Deserialize;

/// Mastodon brand color for link cards.
const EMBED_COLOR: u32 = 0x6364FF;

#[derive(Debug, Deserialize)]
struct Status {
    url: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    spoiler_text: String,
    account: Account,
    #[serde(default)]
    media_attachments: Vec<Attachment>,
    card: Option<Card>,
}

#[derive(Debug, Deserialize)]
struct Account {
    acct: String,
    #[serde(default)]
    display_name: String,
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(rename = "type")]
    kind: AttachmentKind,
    url: Option<String>,
    preview_url: Option<String>,
    remote_url: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum AttachmentKind {
    Image,
    Gifv,
    Video,
    Audio,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Card {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    image: Option<String>,
}

pub struct Mastodon {
    pattern: Regex,
}

impl Mastodon {
    pub fn new(config: &MastodonConfig) -> Result<Self> {
        if config.instances.is_empty() {
            return Err(ConfigError::Invalid("mastodon needs at least one instance".into()).into());
        }
        let hosts = config
            .instances
            .iter()
            .map(|instance| regex::escape(instance.trim().trim_end_matches('/')))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(
            r"https?://({hosts})/@([\w.]+)(?:@[\w.-]+)?/(\d+)"
        ))
        .map_err(|error| ConfigError::Invalid(format!("mastodon instance pattern: {error}")))?;
        Ok(Self { pattern })
    }

    fn push_attachment(queue: &Queue, attachment: &Attachment, status_id: &str, index: usize) {
        let Some(url) = attachment.url.as_ref().or(attachment.remote_url.as_ref()) else {
            return;
        };
        match attachment.kind {
            AttachmentKind::Image => {
                let mut candidates = vec![FallbackCandidate::new(url)];
                if let Some(preview) = &attachment.preview_url {
                    candidates.push(FallbackCandidate::new(preview));
                }
                let candidates = match crate::http::url_filename(url) {
                    Some(name) => candidates
                        .into_iter()
                        .map(|candidate| candidate.filename(format!("{status_id}_{index}_{name}")))
                        .collect(),
                    None => candidates,
                };
                queue.push_fallback(candidates);
            }
            AttachmentKind::Gifv | AttachmentKind::Video | AttachmentKind::Audio => {
                queue.push_file(FileFragment::new(url).can_link(true));
            }
            AttachmentKind::Unknown => {
                if let Some(remote) = &attachment.remote_url {
                    queue.push_text(remote, TextStyle::default());
                }
            }
        }
    }
}

#[async_trait]
impl Site for Mastodon {
    fn name(&self) -> &str {
        "mastodon"
    }

    fn pattern(&self) -> &Regex {
        &self.pattern
    }

    async fn handle(
        &self,
        context: &FetchContext,
        queue: &Queue,
        args: &[Option<String>],
    ) -> Result<()> {
        let (Some(Some(instance)), Some(Some(id))) = (args.first(), args.get(2)) else {
            return Err(anyhow::anyhow!("mastodon link without instance and status id").into());
        };

        let url = format!("https://{instance}/api/v1/statuses/{id}");
        let status: Status = fetch_json(context.fetch.as_ref(), FetchRequest::get(url)).await?;

        queue.set_author(status.account.acct.clone());
        if let Some(canonical) = &status.url {
            queue.set_link(canonical.clone());
        }

        if !status.spoiler_text.trim().is_empty() {
            let warning = TextStyle {
                bold: true,
                force: true,
                escape: true,
                ..TextStyle::default()
            };
            queue.push_text(format!("CW: {}", status.spoiler_text.trim()), warning);
        }

        for (index, attachment) in status.media_attachments.iter().enumerate() {
            Self::push_attachment(queue, attachment, id, index + 1);
        }

        if let Some(card) = &status.card {
            queue.push_embed(Embed {
                title: Some(card.title.clone()).filter(|t| !t.is_empty()),
                description: Some(card.description.clone()).filter(|d| !d.is_empty()),
                url: Some(card.url.clone()),
                color: Some(EMBED_COLOR),
                author_name: Some(if status.account.display_name.is_empty() {
                    status.account.acct.clone()
                } else {
                    status.account.display_name.clone()
                }),
                author_icon: status.account.avatar.clone(),
                thumbnail: card.image.clone(),
                ..Embed::default()
            });
        }

        let text = html_to_text(&status.content);
        if !text.is_empty() {
            queue.push_text(text, TextStyle::caption());
        }

        tracing::debug!(instance, id, "mastodon status fetched");
        Ok(())
    }
}

/// Reduce status HTML to plain text with paragraph and line breaks kept.
fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut text = String::new();
    for node in fragment.tree.root().descendants() {
        match node.value() {
            Node::Text(content) => text.push_str(content),
            Node::Element(element) if element.name() == "br" => text.push('\n'),
            Node::Element(element) if element.name() == "p" && !text.is_empty() => {
                text.push_str("\n\n");
            }
            _ => {}
        }
    }
    text.trim().to_string()
}
