//! Transport trait and dynamic dispatch companion.

use crate::error::Result;
use crate::messaging::{Destination, Outgoing, SentMessage};

use std::future::Future;
use std::pin::Pin;

/// Static trait for chat transports.
/// Use this for type-safe implementations.
pub trait Transport: Send + Sync + 'static {
    /// Unique name for this transport.
    fn name(&self) -> &str;

    /// Send one message and return a handle to it.
    fn send(
        &self,
        destination: &Destination,
        message: Outgoing,
    ) -> impl Future<Output = Result<SentMessage>> + Send;

    fn delete(&self, message: &SentMessage) -> impl Future<Output = Result<()>> + Send;

    fn react(&self, message: &SentMessage, emoji: &str) -> impl Future<Output = Result<()>> + Send;

    /// Wait until `user_id` reacts to `message` with one of `choices`.
    ///
    /// Resolves to `None` if the transport stops listening. Callers bound
    /// the wait with their own timeout.
    fn await_reaction(
        &self,
        message: &SentMessage,
        user_id: u64,
        choices: &[&str],
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Hide the link previews of a message someone else sent.
    fn suppress_embeds(
        &self,
        channel_id: u64,
        message_id: u64,
    ) -> impl Future<Output = Result<()>> + Send {
        let _ = (channel_id, message_id);
        async { Ok(()) }
    }
}

type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn TransportDyn>`.
pub trait TransportDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn send<'a>(
        &'a self,
        destination: &'a Destination,
        message: Outgoing,
    ) -> BoxedFuture<'a, SentMessage>;

    fn delete<'a>(&'a self, message: &'a SentMessage) -> BoxedFuture<'a, ()>;

    fn react<'a>(&'a self, message: &'a SentMessage, emoji: &'a str) -> BoxedFuture<'a, ()>;

    fn await_reaction<'a>(
        &'a self,
        message: &'a SentMessage,
        user_id: u64,
        choices: &'a [&'a str],
    ) -> BoxedFuture<'a, Option<String>>;

    fn suppress_embeds<'a>(&'a self, channel_id: u64, message_id: u64) -> BoxedFuture<'a, ()>;
}

/// Blanket implementation: any type implementing Transport automatically implements TransportDyn.
impl<T: Transport> TransportDyn for T {
    fn name(&self) -> &str {
        Transport::name(self)
    }

    fn send<'a>(
        &'a self,
        destination: &'a Destination,
        message: Outgoing,
    ) -> BoxedFuture<'a, SentMessage> {
        Box::pin(Transport::send(self, destination, message))
    }

    fn delete<'a>(&'a self, message: &'a SentMessage) -> BoxedFuture<'a, ()> {
        Box::pin(Transport::delete(self, message))
    }

    fn react<'a>(&'a self, message: &'a SentMessage, emoji: &'a str) -> BoxedFuture<'a, ()> {
        Box::pin(Transport::react(self, message, emoji))
    }

    fn await_reaction<'a>(
        &'a self,
        message: &'a SentMessage,
        user_id: u64,
        choices: &'a [&'a str],
    ) -> BoxedFuture<'a, Option<String>> {
        Box::pin(Transport::await_reaction(self, message, user_id, choices))
    }

    fn suppress_embeds<'a>(&'a self, channel_id: u64, message_id: u64) -> BoxedFuture<'a, ()> {
        Box::pin(Transport::suppress_embeds(self, channel_id, message_id))
    }
}
