//! Crosspost: a Discord bot that reposts the media and text behind social
//! media links.

pub mod config;
pub mod crosspost;
pub mod error;
pub mod fragment;
pub mod http;
pub mod logging;
pub mod messaging;
pub mod queue;
pub mod settings;
pub mod sites;
pub mod translate;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
