//! Discord transport and gateway handler (serenity).

use crate::crosspost::Crosspost;
use crate::error::{Result, TransportError};
use crate::fragment::Embed;
use crate::messaging::{
    DEFAULT_UPLOAD_LIMIT, Destination, IncomingMessage, Outgoing, SentMessage, Transport, Upload,
};

use anyhow::Context as _;
use parking_lot::Mutex;
use serenity::all::{
    ChannelId, ChannelType, Client, Context, CreateAllowedMentions, CreateAttachment, CreateEmbed,
    CreateEmbedAuthor, CreateEmbedFooter, CreateMessage, EditMessage, EventHandler,
    GatewayIntents, Guild, GuildChannel, GuildId, Message, MessageId, PremiumTier, Reaction,
    ReactionType, Ready, UserId,
};
use serenity::http::Http;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

const MIB: u64 = 1024 * 1024;

struct Waiter {
    message_id: u64,
    user_id: u64,
    choices: Vec<String>,
    reply: oneshot::Sender<String>,
}

type Waiters = Arc<Mutex<HashMap<u64, Waiter>>>;

/// Removes a reaction waiter when the wait ends for any reason.
struct WaiterGuard {
    waiters: Waiters,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.waiters.lock().remove(&self.id);
    }
}

/// Discord REST side of the bot.
pub struct DiscordTransport {
    http: Arc<Http>,
    waiters: Waiters,
    next_waiter: AtomicU64,
}

impl DiscordTransport {
    pub fn new(token: &str) -> Self {
        Self {
            http: Arc::new(Http::new(token)),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_waiter: AtomicU64::new(0),
        }
    }

    /// Hand a reaction to whoever is waiting for it.
    fn resolve_reaction(&self, message_id: u64, user_id: u64, emoji: &str) {
        let mut waiters = self.waiters.lock();
        let matched = waiters.iter().find_map(|(&id, waiter)| {
            (waiter.message_id == message_id
                && waiter.user_id == user_id
                && waiter.choices.iter().any(|choice| choice == emoji))
            .then_some(id)
        });
        if let Some(waiter) = matched.and_then(|id| waiters.remove(&id)) {
            let _ = waiter.reply.send(emoji.to_string());
        }
    }
}

impl Transport for DiscordTransport {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, destination: &Destination, message: Outgoing) -> Result<SentMessage> {
        let channel = ChannelId::new(destination.channel_id);
        let builder = CreateMessage::new().allowed_mentions(CreateAllowedMentions::new());
        let builder = match message {
            Outgoing::Text(text) => builder.content(text),
            Outgoing::Files(uploads) => builder.add_files(uploads.into_iter().map(attachment)),
            Outgoing::Embed(embed) => builder.embed(create_embed(embed)),
        };

        let sent = channel
            .send_message(&self.http, builder)
            .await
            .map_err(|error| TransportError::Send {
                channel_id: destination.channel_id,
                reason: error.to_string(),
            })?;
        Ok(SentMessage {
            channel_id: sent.channel_id.get(),
            message_id: sent.id.get(),
        })
    }

    async fn delete(&self, message: &SentMessage) -> Result<()> {
        ChannelId::new(message.channel_id)
            .delete_message(&self.http, MessageId::new(message.message_id))
            .await
            .map_err(|error| TransportError::Delete {
                message_id: message.message_id,
                reason: error.to_string(),
            })?;
        Ok(())
    }

    async fn react(&self, message: &SentMessage, emoji: &str) -> Result<()> {
        self.http
            .create_reaction(
                ChannelId::new(message.channel_id),
                MessageId::new(message.message_id),
                &ReactionType::Unicode(emoji.to_string()),
            )
            .await
            .map_err(|error| TransportError::React {
                message_id: message.message_id,
                reason: error.to_string(),
            })?;
        Ok(())
    }

    async fn await_reaction(
        &self,
        message: &SentMessage,
        user_id: u64,
        choices: &[&str],
    ) -> Result<Option<String>> {
        let (reply, receiver) = oneshot::channel();
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().insert(
            id,
            Waiter {
                message_id: message.message_id,
                user_id,
                choices: choices.iter().map(|choice| choice.to_string()).collect(),
                reply,
            },
        );
        let _guard = WaiterGuard {
            waiters: Arc::clone(&self.waiters),
            id,
        };
        Ok(receiver.await.ok())
    }

    async fn suppress_embeds(&self, channel_id: u64, message_id: u64) -> Result<()> {
        ChannelId::new(channel_id)
            .edit_message(
                &self.http,
                MessageId::new(message_id),
                EditMessage::new().suppress_embeds(true),
            )
            .await
            .map_err(|error| TransportError::Send {
                channel_id,
                reason: error.to_string(),
            })?;
        Ok(())
    }
}

fn attachment(upload: Upload) -> CreateAttachment {
    let filename = if upload.spoiler {
        format!("SPOILER_{}", upload.filename)
    } else {
        upload.filename
    };
    CreateAttachment::bytes(upload.bytes.to_vec(), filename)
}

fn create_embed(embed: Embed) -> CreateEmbed {
    let mut builder = CreateEmbed::new();
    if let Some(title) = embed.title {
        builder = builder.title(title);
    }
    if let Some(description) = embed.description {
        builder = builder.description(description);
    }
    if let Some(url) = embed.url {
        builder = builder.url(url);
    }
    if let Some(color) = embed.color {
        builder = builder.colour(color);
    }
    if let Some(name) = embed.author_name {
        let mut author = CreateEmbedAuthor::new(name);
        if let Some(url) = embed.author_url {
            author = author.url(url);
        }
        if let Some(icon) = embed.author_icon {
            author = author.icon_url(icon);
        }
        builder = builder.author(author);
    }
    if let Some(image) = embed.image {
        builder = builder.image(image);
    }
    if let Some(thumbnail) = embed.thumbnail {
        builder = builder.thumbnail(thumbnail);
    }
    if let Some(footer) = embed.footer {
        builder = builder.footer(CreateEmbedFooter::new(footer));
    }
    for field in embed.fields {
        builder = builder.field(field.name, field.value, field.inline);
    }
    builder
}

/// Upload limit granted by a guild's boost tier.
fn upload_limit(tier: PremiumTier) -> u64 {
    match tier {
        PremiumTier::Tier2 => 50 * MIB,
        PremiumTier::Tier3 => 100 * MIB,
        _ => DEFAULT_UPLOAD_LIMIT,
    }
}

fn is_thread(channel: &GuildChannel) -> bool {
    matches!(
        channel.kind,
        ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread
    )
}

/// Settings chain and limits for a guild channel, read from the cache.
fn guild_destination(guild: &Guild, channel_id: ChannelId, bot_id: UserId) -> Destination {
    let find = |id: ChannelId| {
        guild
            .channels
            .get(&id)
            .or_else(|| guild.threads.iter().find(|thread| thread.id == id))
    };

    // Thread -> channel -> category, most specific first.
    let mut chain = Vec::new();
    let mut permission_channel = None;
    let mut cursor = Some(channel_id);
    while let Some(id) = cursor {
        if chain.len() >= 3 || chain.contains(&id.get()) {
            break;
        }
        chain.push(id.get());
        let channel = find(id);
        if permission_channel.is_none() {
            permission_channel =
                channel.filter(|c| !is_thread(c) && c.kind != ChannelType::Category);
        }
        cursor = channel.and_then(|c| c.parent_id);
    }
    chain.reverse();

    let can_suppress_embeds = match (permission_channel, guild.members.get(&bot_id)) {
        (Some(channel), Some(member)) => guild.user_permissions_in(channel, member).manage_messages(),
        _ => false,
    };

    Destination {
        guild_id: Some(guild.id.get()),
        channel_id: channel_id.get(),
        scope_chain: chain,
        upload_limit: upload_limit(guild.premium_tier),
        can_suppress_embeds,
    }
}

fn destination_for(ctx: &Context, channel_id: ChannelId, guild_id: Option<GuildId>) -> Destination {
    let Some(guild_id) = guild_id else {
        return Destination::direct(channel_id.get());
    };
    let bot_id = ctx.cache.current_user().id;
    match ctx.cache.guild(guild_id) {
        Some(guild) => guild_destination(&guild, channel_id, bot_id),
        None => Destination {
            guild_id: Some(guild_id.get()),
            scope_chain: vec![channel_id.get()],
            can_suppress_embeds: false,
            ..Destination::direct(channel_id.get())
        },
    }
}

/// Gateway events feeding the orchestrator.
struct DiscordHandler {
    crosspost: Arc<Crosspost>,
    transport: Arc<DiscordTransport>,
}

#[serenity::async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            "discord connected"
        );
    }

    async fn message(&self, ctx: Context, message: Message) {
        if message.author.bot {
            return;
        }
        let destination = destination_for(&ctx, message.channel_id, message.guild_id);
        self.crosspost.on_message(IncomingMessage {
            id: message.id.get(),
            author_id: message.author.id.get(),
            content: message.content,
            destination,
        });
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        _channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        self.crosspost
            .on_message_delete(deleted_message_id.get())
            .await;
    }

    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        let (Some(user_id), ReactionType::Unicode(emoji)) = (reaction.user_id, &reaction.emoji) else {
            return;
        };
        self.transport
            .resolve_reaction(reaction.message_id.get(), user_id.get(), emoji);
    }
}

/// Build a gateway client wired to the orchestrator.
pub async fn connect(
    token: &str,
    crosspost: Arc<Crosspost>,
    transport: Arc<DiscordTransport>,
) -> Result<Client> {
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::DIRECT_MESSAGE_REACTIONS
        | GatewayIntents::MESSAGE_CONTENT;

    let client = Client::builder(token, intents)
        .event_handler(DiscordHandler {
            crosspost,
            transport,
        })
        .await
        .context("failed to build discord client")?;
    Ok(client)
}
