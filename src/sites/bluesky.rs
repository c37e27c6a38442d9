//! Bluesky posts via the public AppView.

use crate::config::BlueskyConfig;
use crate::error::{FetchError, Result};
use crate::fragment::{Embed, FallbackCandidate, FileFragment, TextStyle};
use crate::http::{FetchRequest, fetch_json};
use crate::queue::Queue;
use crate::sites::{FetchContext, Site};

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:www\.)?bsky\.app/profile/([\w.:%-]+)/post/([a-z0-9]+)")
        .expect("hardcoded regex")
});

/// Bluesky brand color for link cards.
const EMBED_COLOR: u32 = 0x1185FE;

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    thread: Thread,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "$type")]
enum Thread {
    #[serde(rename = "app.bsky.feed.defs#threadViewPost")]
    Post { post: PostView },
    #[serde(rename = "app.bsky.feed.defs#notFoundPost")]
    NotFound,
    #[serde(rename = "app.bsky.feed.defs#blockedPost")]
    Blocked,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct PostView {
    author: Author,
    record: PostRecord,
    embed: Option<EmbedView>,
}

#[derive(Debug, Deserialize)]
struct Author {
    handle: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostRecord {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "$type")]
enum EmbedView {
    #[serde(rename = "app.bsky.embed.images#view")]
    Images { images: Vec<ImageView> },
    #[serde(rename = "app.bsky.embed.video#view")]
    Video { thumbnail: Option<String> },
    #[serde(rename = "app.bsky.embed.external#view")]
    External { external: ExternalView },
    #[serde(rename = "app.bsky.embed.recordWithMedia#view")]
    RecordWithMedia { media: Box<EmbedView> },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ImageView {
    thumb: String,
    fullsize: String,
}

#[derive(Debug, Deserialize)]
struct ExternalView {
    uri: String,
    title: String,
    #[serde(default)]
    description: String,
    thumb: Option<String>,
}

pub struct Bluesky {
    appview: String,
}

impl Bluesky {
    pub fn new(config: &BlueskyConfig) -> Self {
        Self {
            appview: config.appview.trim_end_matches('/').to_string(),
        }
    }

    fn thread_url(&self, actor: &str, rkey: &str) -> Result<String> {
        let uri = format!("at://{actor}/app.bsky.feed.post/{rkey}");
        let url = reqwest::Url::parse_with_params(
            &format!("{}/xrpc/app.bsky.feed.getPostThread", self.appview),
            &[("uri", uri.as_str()), ("depth", "0"), ("parentHeight", "0")],
        )
        .with_context(|| format!("invalid AppView URL {}", self.appview))?;
        Ok(url.into())
    }

    fn push_media(&self, queue: &Queue, embed: &EmbedView, post_author: &Author, rkey: &str) {
        match embed {
            EmbedView::Images { images } => {
                for (index, image) in images.iter().enumerate() {
                    let filename = format!("{rkey}_{}.jpg", index + 1);
                    queue.push_fallback(vec![
                        FallbackCandidate::new(&image.fullsize).filename(filename.clone()),
                        FallbackCandidate::new(&image.thumb).filename(filename),
                    ]);
                }
            }
            EmbedView::Video { thumbnail } => {
                if let Some(thumbnail) = thumbnail {
                    queue.push_file(
                        FileFragment::new(thumbnail)
                            .filename(format!("{rkey}_thumb.jpg"))
                            .can_link(true),
                    );
                }
            }
            EmbedView::External { external } => {
                queue.push_embed(Embed {
                    title: Some(external.title.clone()).filter(|t| !t.is_empty()),
                    description: Some(external.description.clone()).filter(|d| !d.is_empty()),
                    url: Some(external.uri.clone()),
                    color: Some(EMBED_COLOR),
                    author_name: Some(
                        post_author
                            .display_name
                            .clone()
                            .unwrap_or_else(|| post_author.handle.clone()),
                    ),
                    author_icon: post_author.avatar.clone(),
                    thumbnail: external.thumb.clone(),
                    ..Embed::default()
                });
            }
            EmbedView::RecordWithMedia { media } => {
                self.push_media(queue, media, post_author, rkey);
            }
            EmbedView::Unknown => {}
        }
    }
}

#[async_trait]
impl Site for Bluesky {
    fn name(&self) -> &str {
        "bluesky"
    }

    fn pattern(&self) -> &Regex {
        &PATTERN
    }

    async fn handle(
        &self,
        context: &FetchContext,
        queue: &Queue,
        args: &[Option<String>],
    ) -> Result<()> {
        let (Some(Some(actor)), Some(Some(rkey))) = (args.first(), args.get(1)) else {
            return Err(anyhow::anyhow!("bluesky link without actor and post id").into());
        };

        let url = self.thread_url(actor, rkey)?;
        let response: ThreadResponse =
            fetch_json(context.fetch.as_ref(), FetchRequest::get(&url)).await?;

        let post = match response.thread {
            Thread::Post { post } => post,
            Thread::NotFound | Thread::Blocked | Thread::Unknown => {
                return Err(FetchError::NotFound { url }.into());
            }
        };

        queue.set_author(post.author.handle.clone());
        queue.set_link(format!(
            "https://bsky.app/profile/{}/post/{rkey}",
            post.author.handle
        ));

        if let Some(embed) = &post.embed {
            self.push_media(queue, embed, &post.author, rkey);
        }
        if !post.record.text.trim().is_empty() {
            queue.push_text(&post.record.text, TextStyle::caption());
        }

        tracing::debug!(actor, rkey, fragments = queue.fragments().len(), "bluesky post fetched");
        Ok(())
    }
}
