//! Chat transport types and adapters.

pub mod discord;
pub mod traits;

pub use traits::{Transport, TransportDyn};

use crate::fragment::Embed;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Upload limit for destinations without a boost tier.
pub const DEFAULT_UPLOAD_LIMIT: u64 = 10 * 1024 * 1024;

/// Maximum characters in one outgoing text message.
pub const MESSAGE_CHAR_LIMIT: usize = 2000;

/// Where output goes, plus what the platform allows there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    /// Settings scopes below the guild, least specific first
    /// (category, channel, thread).
    pub scope_chain: Vec<u64>,
    /// Maximum upload size in bytes.
    pub upload_limit: u64,
    /// Whether we may hide link previews on other users' messages.
    pub can_suppress_embeds: bool,
}

impl Destination {
    /// A direct-message destination.
    pub fn direct(channel_id: u64) -> Self {
        Self {
            guild_id: None,
            channel_id,
            scope_chain: vec![channel_id],
            upload_limit: DEFAULT_UPLOAD_LIMIT,
            can_suppress_embeds: false,
        }
    }
}

/// A chat message that may contain links.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: u64,
    pub author_id: u64,
    pub content: String,
    pub destination: Destination,
}

/// Handle on a message we sent, for later deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SentMessage {
    pub channel_id: u64,
    pub message_id: u64,
}

/// One file in an upload batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub filename: String,
    pub bytes: Bytes,
    pub spoiler: bool,
}

/// One outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Files(Vec<Upload>),
    Embed(Embed),
}

/// Messages sent on behalf of one invocation.
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<SentMessage>>>);

impl SentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: SentMessage) {
        self.0.lock().push(message);
    }

    pub fn forget(&self, message: &SentMessage) {
        self.0.lock().retain(|sent| sent != message);
    }

    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Split text into chunks of at most `limit` characters, preferring line
/// boundaries.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for line in text.split('\n') {
        let line_chars = line.chars().count();
        let separator = usize::from(!current.is_empty());
        if current_chars + separator + line_chars <= limit {
            if separator == 1 {
                current.push('\n');
            }
            current.push_str(line);
            current_chars += separator + line_chars;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }

        if line_chars <= limit {
            current.push_str(line);
            current_chars = line_chars;
            continue;
        }

        let characters: Vec<char> = line.chars().collect();
        let mut pieces = characters.chunks(limit).peekable();
        while let Some(piece) = pieces.next() {
            let piece: String = piece.iter().collect();
            if pieces.peek().is_some() {
                chunks.push(piece);
            } else {
                current_chars = piece.chars().count();
                current = piece;
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
