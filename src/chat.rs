//! Chat platform seam.
//!
//! Listener and worker logic talk to the platform through `ChatApi` so the
//! pipeline is testable against fakes; `slack` holds the real
//! implementation (REST + Socket Mode).

pub mod slack;

use crate::error::ChatError;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of normalized inbound events from a socket connection.
pub type EventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

/// Basic channel metadata.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub is_archived: bool,
}

/// A message fetched from a source channel (thread-parent resolution).
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub ts: String,
    pub text: String,
    pub user: Option<String>,
    pub bot_id: Option<String>,
}

/// The platform's receipt for a posted message.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub ts: String,
}

/// Whether a socket event is a fresh message or an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Edited,
}

/// A normalized inbound message event from the socket connection.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub kind: EventKind,
    pub channel_id: String,
    pub ts: String,
    pub client_msg_id: Option<String>,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    pub thread_ts: Option<String>,
    pub text: String,
    /// Raw attachment objects, passed through to the forwarded post.
    pub attachments: Vec<serde_json::Value>,
    /// Raw file objects; the worker renders these into attachment records.
    pub files: Vec<serde_json::Value>,
}

impl MessageEvent {
    /// Whether the event was produced by a bot rather than a human.
    pub fn is_bot_originated(&self) -> bool {
        self.bot_id.is_some()
    }
}

/// Outbound platform operations used by the pipeline.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Post a message, optionally into a thread and with legacy attachment
    /// records. Returns the new message's ts.
    async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
        attachments: &[serde_json::Value],
    ) -> Result<PostedMessage, ChatError>;

    /// Replace the text of an existing message.
    async fn update_message(
        &self,
        channel_id: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), ChatError>;

    /// Resolve a channel's metadata by id.
    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo, ChatError>;

    /// Fetch the single message at `ts` from a channel's history, if it
    /// still exists.
    async fn message_at(
        &self,
        channel_id: &str,
        ts: &str,
    ) -> Result<Option<SourceMessage>, ChatError>;

    /// Enumerate all channels visible to this identity (paginated).
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, ChatError>;

    /// Verify the credentials work.
    async fn auth_check(&self) -> Result<(), ChatError>;
}
