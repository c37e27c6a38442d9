//! Rendering produced items to a chat destination.

use crate::config::CrosspostConfig;
use crate::error::{Error, Result};
use crate::fragment::{FileFragment, Fragment, TextStyle, render_styled};
use crate::http::Fetch;
use crate::messaging::{
    Destination, MESSAGE_CHAR_LIMIT, Outgoing, SentLog, SentMessage, TransportDyn, Upload,
    split_message,
};
use crate::queue::Item;
use crate::translate::{Translator, translate_foreign};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

const CONFIRM: &str = "✅";
const DECLINE: &str = "❌";

/// Everything `present` needs to talk to one destination.
pub struct PresentContext<'a> {
    pub transport: &'a dyn TransportDyn,
    pub fetch: Arc<dyn Fetch>,
    pub translator: Option<Arc<dyn Translator>>,
    pub destination: &'a Destination,
    /// User who triggered the crosspost; the only one who may confirm.
    pub invoker_id: u64,
    pub sent: SentLog,
    pub config: &'a CrosspostConfig,
}

impl PresentContext<'_> {
    pub(crate) async fn send(&self, message: Outgoing) -> Result<SentMessage> {
        let sent = self.transport.send(self.destination, message).await?;
        self.sent.record(sent);
        Ok(sent)
    }

    pub(crate) async fn send_text(&self, text: &str) -> Result<()> {
        for chunk in split_message(text, MESSAGE_CHAR_LIMIT) {
            self.send(Outgoing::Text(chunk)).await?;
        }
        Ok(())
    }

    /// Ask the invoker to approve a large post. Silence counts as a no.
    async fn confirm(&self, file_count: usize) -> Result<bool> {
        let prompt = self
            .send(Outgoing::Text(format!(
                "This will post {file_count} files. React {CONFIRM} to continue or {DECLINE} to cancel."
            )))
            .await?;

        let outcome = async {
            self.transport.react(&prompt, CONFIRM).await?;
            self.transport.react(&prompt, DECLINE).await?;
            let choice = tokio::time::timeout(
                self.config.confirm_timeout(),
                self.transport
                    .await_reaction(&prompt, self.invoker_id, &[CONFIRM, DECLINE]),
            )
            .await;
            Ok::<bool, Error>(match choice {
                Ok(Ok(Some(emoji))) => emoji == CONFIRM,
                Ok(Ok(None)) => false,
                Ok(Err(error)) => {
                    tracing::warn!(%error, "reaction wait failed");
                    false
                }
                Err(_elapsed) => {
                    tracing::debug!(message_id = prompt.message_id, "confirmation timed out");
                    false
                }
            })
        }
        .await;

        if let Err(error) = self.transport.delete(&prompt).await {
            tracing::warn!(%error, message_id = prompt.message_id, "failed to delete confirmation prompt");
        }
        self.sent.forget(&prompt);
        outcome
    }
}

/// Render `items` in order. Returns whether anything was uploaded or embedded.
///
/// Files upload in batches; any other item flushes the pending batch first.
/// Posts with many files need the invoker's confirmation unless `force`.
pub async fn present(context: &PresentContext<'_>, items: Vec<Item>, force: bool) -> Result<bool> {
    let limit = context.destination.upload_limit;
    let items = resolve_fallbacks(context, items, limit).await;

    let file_count = items.iter().filter(|item| item.fragment.is_file()).count();
    if !force
        && file_count >= context.config.confirm_threshold
        && !context.confirm(file_count).await?
    {
        tracing::info!(
            channel_id = context.destination.channel_id,
            file_count,
            "large post declined"
        );
        return Ok(false);
    }

    let mut translations = Translations::spawn(context, &items);

    // Warm every download up front; rendering below awaits the same cells.
    let mut downloads = JoinSet::new();
    for item in &items {
        if let Fragment::File(file) = &item.fragment {
            if item.queue.site().concurrent() {
                let file = Arc::clone(file);
                let fetch = Arc::clone(&context.fetch);
                downloads.spawn(async move {
                    let _ = file.resolve(fetch.as_ref()).await;
                });
            }
        }
    }

    let mut renderer = Renderer {
        context,
        batch: Vec::new(),
        presented: false,
    };

    let mut index = 0;
    while index < items.len() {
        let item = &items[index];
        match &item.fragment {
            Fragment::File(file) => renderer.file(file, item.spoiler).await?,
            Fragment::Fallback(fallback) => {
                let file = fallback.resolve(context.fetch.as_ref(), limit).await;
                renderer.file(&file, item.spoiler).await?;
            }
            Fragment::Embed(embed) => {
                renderer.flush().await?;
                context.send(Outgoing::Embed(embed.as_ref().clone())).await?;
                renderer.presented = true;
            }
            Fragment::Text(text) if text.style.force => {
                renderer.flush().await?;
                context.send_text(&text.render(item.spoiler)).await?;
            }
            Fragment::Text(_) => {
                renderer.flush().await?;
                let run = items[index..]
                    .iter()
                    .take_while(|next| {
                        matches!(&next.fragment, Fragment::Text(text) if !text.style.force)
                            && Arc::ptr_eq(&next.queue, &item.queue)
                    })
                    .count();
                let mut blocks = Vec::with_capacity(run);
                for (offset, next) in items[index..index + run].iter().enumerate() {
                    if let Some(text) = next.fragment.as_text() {
                        let translated = translations.get(index + offset).await;
                        blocks.push(render_text(
                            &text.content,
                            &text.style,
                            translated,
                            next.spoiler,
                        ));
                    }
                }
                context.send_text(&blocks.join("\n")).await?;
                index += run;
                continue;
            }
        }
        index += 1;
    }
    renderer.flush().await?;
    downloads.abort_all();

    Ok(renderer.presented)
}

/// Replace every fallback with its chosen candidate.
async fn resolve_fallbacks(context: &PresentContext<'_>, items: Vec<Item>, limit: u64) -> Vec<Item> {
    let resolved = items.into_iter().map(|item| async move {
        let chosen = match &item.fragment {
            Fragment::Fallback(fallback) => {
                Some(fallback.resolve(context.fetch.as_ref(), limit).await)
            }
            _ => None,
        };
        match chosen {
            Some(file) => Item {
                fragment: Fragment::File(file),
                ..item
            },
            None => item,
        }
    });
    futures::future::join_all(resolved).await
}

/// Translation above, original beneath it in small print.
fn render_text(content: &str, style: &TextStyle, translated: Option<&str>, spoiler: bool) -> String {
    match translated {
        Some(translated) => {
            let original = TextStyle {
                diminished: true,
                ..*style
            };
            format!(
                "{}\n{}",
                render_styled(translated, style, spoiler),
                render_styled(content, &original, spoiler)
            )
        }
        None => render_styled(content, style, spoiler),
    }
}

struct Renderer<'c, 'a> {
    context: &'c PresentContext<'a>,
    batch: Vec<Upload>,
    presented: bool,
}

impl Renderer<'_, '_> {
    async fn file(&mut self, file: &FileFragment, spoiler: bool) -> Result<()> {
        let context = self.context;
        let limit = context.destination.upload_limit;
        match file.resolve(context.fetch.as_ref()).await {
            Ok(downloaded) if downloaded.len() <= limit => {
                self.batch.push(Upload {
                    filename: downloaded.filename,
                    bytes: downloaded.bytes,
                    spoiler,
                });
                if self.batch.len() >= context.config.batch_size {
                    self.flush().await?;
                }
            }
            Ok(downloaded) => {
                self.flush().await?;
                tracing::debug!(
                    filename = %downloaded.filename,
                    size = downloaded.len(),
                    limit,
                    "file exceeds upload limit"
                );
                match file.url().filter(|_| file.linkable()) {
                    Some(url) => {
                        context.send_text(&link(url, spoiler)).await?;
                        self.presented = true;
                    }
                    None => {
                        context
                            .send_text(&format!(
                                "`{}` is too large to upload ({}, limit {})",
                                downloaded.filename,
                                format_size(downloaded.len()),
                                format_size(limit)
                            ))
                            .await?;
                    }
                }
            }
            Err(error) => {
                self.flush().await?;
                tracing::warn!(url = file.url().unwrap_or_default(), %error, "file unavailable");
                match file.url().filter(|_| file.linkable()) {
                    Some(url) => {
                        context.send_text(&link(url, spoiler)).await?;
                        self.presented = true;
                    }
                    None => {
                        let message = Error::from(error).user_message();
                        context
                            .send_text(&format!("`{}`: {message}", file.name()))
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        tracing::debug!(files = batch.len(), "uploading batch");
        self.context.send(Outgoing::Files(batch)).await?;
        self.presented = true;
        Ok(())
    }
}

fn link(url: &str, spoiler: bool) -> String {
    if spoiler {
        format!("||{url}||")
    } else {
        url.to_string()
    }
}

fn format_size(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    format!("{:.1} MiB", bytes as f64 / MIB)
}

/// Background translation lookups for an item list.
struct Translations {
    pending: JoinSet<(usize, Option<String>)>,
    done: HashMap<usize, String>,
}

impl Translations {
    fn spawn(context: &PresentContext<'_>, items: &[Item]) -> Self {
        let mut pending = JoinSet::new();
        if let Some(translator) = &context.translator {
            for (index, item) in items.iter().enumerate() {
                let Fragment::Text(text) = &item.fragment else {
                    continue;
                };
                if text.style.skip_translate || text.content.trim().is_empty() {
                    continue;
                }
                let translator = Arc::clone(translator);
                let content = text.content.clone();
                let target = context.config.target_language.clone();
                pending.spawn(async move {
                    let translated = translate_foreign(translator.as_ref(), &content, &target).await;
                    (index, translated)
                });
            }
        }
        Self {
            pending,
            done: HashMap::new(),
        }
    }

    async fn get(&mut self, index: usize) -> Option<&str> {
        while let Some(joined) = self.pending.join_next().await {
            match joined {
                Ok((finished, Some(translated))) => {
                    self.done.insert(finished, translated);
                }
                Ok((_, None)) => {}
                Err(error) => tracing::warn!(%error, "translation task failed"),
            }
        }
        self.done.get(&index).map(String::as_str)
    }
}
