//! Slack implementation of the chat seam using slack-morphism.
//!
//! `SlackChat` covers the REST surface (posting, updates, lookups) on a
//! shared hyper client; `SlackSocketIngest` owns the Socket Mode connection
//! and normalizes push events onto an mpsc channel for the listener
//! pipeline. Reconnects are handled inside slack-morphism's listener.

use crate::chat::{
    ChannelInfo, ChatApi, EventKind, EventStream, MessageEvent, PostedMessage, SourceMessage,
};
use crate::error::ChatError;

use async_trait::async_trait;
use slack_morphism::errors::SlackClientError;
#[cfg(test)]
use slack_morphism::errors::SlackRateLimitError;
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

/// REST client bound to one bot identity.
pub struct SlackChat {
    /// Shared HTTP client — constructed once, reused across all API calls.
    /// Holds a hyper connection pool internally.
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
}

impl SlackChat {
    pub fn new(bot_token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .map_err(|error| anyhow::anyhow!("failed to create slack HTTP connector: {error}"))?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.into()));
        Ok(Self { client, token })
    }

    /// Open a session against the cached client using the cached token.
    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }
}

#[async_trait]
impl ChatApi for SlackChat {
    async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
        attachments: &[serde_json::Value],
    ) -> Result<PostedMessage, ChatError> {
        let mut content = SlackMessageContent::new().with_text(text.to_string());
        let slack_attachments = deserialize_attachments(attachments);
        if !slack_attachments.is_empty() {
            content = content.with_attachments(slack_attachments);
        }

        let mut request =
            SlackApiChatPostMessageRequest::new(SlackChannelId(channel_id.to_string()), content);
        request = request.opt_thread_ts(thread_ts.map(|ts| SlackTs(ts.to_string())));

        let response = self
            .session()
            .chat_post_message(&request)
            .await
            .map_err(map_slack_error)?;
        Ok(PostedMessage {
            ts: response.ts.0,
        })
    }

    async fn update_message(
        &self,
        channel_id: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), ChatError> {
        let request = SlackApiChatUpdateRequest::new(
            SlackChannelId(channel_id.to_string()),
            SlackMessageContent::new().with_text(text.to_string()),
            SlackTs(ts.to_string()),
        );
        self.session()
            .chat_update(&request)
            .await
            .map_err(map_slack_error)?;
        Ok(())
    }

    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo, ChatError> {
        let request =
            SlackApiConversationsInfoRequest::new(SlackChannelId(channel_id.to_string()));
        let response = self
            .session()
            .conversations_info(&request)
            .await
            .map_err(map_slack_error)?;
        Ok(decode_channel(&response.channel))
    }

    async fn message_at(
        &self,
        channel_id: &str,
        ts: &str,
    ) -> Result<Option<SourceMessage>, ChatError> {
        let request = SlackApiConversationsHistoryRequest::new()
            .with_channel(SlackChannelId(channel_id.to_string()))
            .with_latest(SlackTs(ts.to_string()))
            .with_limit(1)
            .with_inclusive(true);
        let response = self
            .session()
            .conversations_history(&request)
            .await
            .map_err(map_slack_error)?;

        Ok(response.messages.into_iter().next().map(|message| {
            SourceMessage {
                ts: message.origin.ts.0,
                text: message
                    .content
                    .text
                    .clone()
                    .unwrap_or_default(),
                user: message.sender.user.map(|user| user.0),
                bot_id: message.sender.bot_id.map(|bot| bot.0),
            }
        }))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, ChatError> {
        let session = self.session();
        let mut channels = Vec::new();
        let mut cursor: Option<SlackCursorId> = None;

        loop {
            let mut request = SlackApiConversationsListRequest::new()
                .with_limit(1000)
                .with_types(vec![
                    SlackConversationType::Public,
                    SlackConversationType::Private,
                ]);
            if let Some(cursor_id) = cursor.take() {
                request = request.with_cursor(cursor_id);
            }

            let response = session
                .conversations_list(&request)
                .await
                .map_err(map_slack_error)?;

            channels.extend(response.channels.iter().map(decode_channel));

            cursor = response
                .response_metadata
                .and_then(|metadata| metadata.next_cursor)
                .filter(|cursor| !cursor.0.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        Ok(channels)
    }

    async fn auth_check(&self) -> Result<(), ChatError> {
        self.session().auth_test().await.map_err(map_slack_error)?;
        Ok(())
    }
}

fn decode_channel(channel: &SlackChannelInfo) -> ChannelInfo {
    ChannelInfo {
        id: channel.id.0.clone(),
        name: channel.name.clone().unwrap_or_default(),
        is_archived: channel.flags.is_archived.unwrap_or(false),
    }
}

/// Convert raw attachment values into slack-morphism attachments.
///
/// Values that fail to deserialize are skipped with a warning so one bad
/// attachment doesn't kill the whole post.
fn deserialize_attachments(values: &[serde_json::Value]) -> Vec<SlackMessageAttachment> {
    values
        .iter()
        .filter_map(|value| match serde_json::from_value(value.clone()) {
            Ok(attachment) => Some(attachment),
            Err(error) => {
                tracing::warn!(%error, "failed to deserialize attachment, skipping");
                None
            }
        })
        .collect()
}

/// Map slack-morphism errors onto the retry taxonomy.
fn map_slack_error(error: SlackClientError) -> ChatError {
    match error {
        SlackClientError::RateLimitError(rate_limit) => ChatError::RateLimited {
            retry_after: rate_limit.retry_after,
        },
        SlackClientError::ApiError(api) => ChatError::Api { code: api.code },
        other => ChatError::Transport(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Socket Mode ingest
// ---------------------------------------------------------------------------

/// State shared with socket mode callbacks via `SlackClientEventsUserState`.
struct IngestState {
    events_tx: mpsc::Sender<MessageEvent>,
}

/// Socket Mode connection for one bot identity. Push events are normalized
/// into `MessageEvent`s; everything else is acknowledged and dropped.
pub struct SlackSocketIngest {
    app_token: String,
}

impl SlackSocketIngest {
    pub fn new(app_token: impl Into<String>) -> Self {
        Self {
            app_token: app_token.into(),
        }
    }

    /// Connect and return the stream of normalized events. The connection
    /// lives in a background task for the life of the process.
    pub async fn start(&self) -> anyhow::Result<EventStream> {
        let (events_tx, events_rx) = mpsc::channel(256);

        // The socket mode listener needs its own client — it owns a
        // persistent WebSocket connection. REST traffic uses SlackChat.
        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().map_err(|error| {
                anyhow::anyhow!("failed to create slack socket mode connector: {error}")
            })?,
        ));

        let state = Arc::new(IngestState { events_tx });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);
        let environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client.clone())
                .with_error_handler(socket_error_handler)
                .with_user_state(state),
        );

        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            environment,
            callbacks,
        );

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));

        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                tracing::error!(%error, "failed to start slack socket mode listener");
                return;
            }
            tracing::info!("slack socket mode connected");
            let exit_code = listener.serve().await;
            tracing::info!(exit_code, "slack socket mode listener stopped");
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(
            events_rx,
        )))
    }
}

fn socket_error_handler(
    error: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(%error, "slack socket mode error");
    HttpStatusCode::OK
}

/// Normalize incoming push events onto the ingest channel.
async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let SlackEventCallbackBody::Message(message) = event.event else {
        return Ok(());
    };

    let Some(normalized) = normalize_message_event(message) else {
        return Ok(());
    };

    let state_guard = states.read().await;
    let ingest_state = state_guard
        .get_user_state::<Arc<IngestState>>()
        .expect("IngestState must be in user_state");

    if let Err(error) = ingest_state.events_tx.send(normalized).await {
        tracing::warn!(%error, "failed to enqueue inbound slack event");
    }

    Ok(())
}

/// Turn a raw Slack message event into a `MessageEvent`.
///
/// New messages and bot messages map to `EventKind::New`; `message_changed`
/// carries the edited message in its nested `message` field and maps to
/// `EventKind::Edited`. Deletes, joins, and other subtypes are dropped.
fn normalize_message_event(event: SlackMessageEvent) -> Option<MessageEvent> {
    let channel_id = event.origin.channel.as_ref()?.0.clone();
    let subtype = event.subtype.clone();

    match subtype {
        Some(SlackMessageEventType::MessageChanged) => {
            let edited = event.message?;
            let merged = SlackMessageEvent {
                origin: event.origin,
                content: edited.content,
                sender: edited.sender,
                subtype: event.subtype,
                hidden: event.hidden,
                message: None,
                previous_message: event.previous_message,
                deleted_ts: event.deleted_ts,
            };
            Some(build_event(EventKind::Edited, channel_id, merged))
        }
        Some(SlackMessageEventType::BotMessage) | None => {
            Some(build_event(EventKind::New, channel_id, event))
        }
        _ => None,
    }
}

fn build_event(kind: EventKind, channel_id: String, event: SlackMessageEvent) -> MessageEvent {
    let (text, attachments, files) = match &event.content {
        Some(content) => (
            content.text.clone().unwrap_or_default(),
            to_value_list(content.attachments.as_deref()),
            to_value_list(content.files.as_deref()),
        ),
        None => (String::new(), Vec::new(), Vec::new()),
    };

    MessageEvent {
        kind,
        channel_id,
        ts: event.origin.ts.0.clone(),
        client_msg_id: event.origin.client_msg_id.as_ref().map(|id| id.0.clone()),
        user: event.sender.user.as_ref().map(|user| user.0.clone()),
        bot_id: event.sender.bot_id.as_ref().map(|bot| bot.0.clone()),
        thread_ts: event.origin.thread_ts.as_ref().map(|ts| ts.0.clone()),
        text,
        attachments,
        files,
    }
}

/// Serialize platform objects for passthrough on the job stream.
fn to_value_list<T: serde::Serialize>(items: Option<&[T]>) -> Vec<serde_json::Value> {
    items
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::to_value(item).ok())
                .collect()
        })
        .unwrap_or_default()
}
