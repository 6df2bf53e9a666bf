//! Relaybot: a multi-bot message-forwarding relay for Slack.
//!
//! N bot identities hold concurrent socket connections to one workspace.
//! Events are deduplicated across bots with a first-come-first-serve claim
//! in a shared Redis store, normalized onto a durable job stream, and
//! forwarded by worker processes into per-category master channels,
//! preserving edits and thread structure.

pub mod assign;
pub mod categ;
pub mod chat;
pub mod config;
pub mod error;
pub mod listener;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result};
