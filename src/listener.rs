//! Ingest listener: one per bot identity.
//!
//! Receives message and edit events over the bot's socket connection,
//! filters and categorizes them, wins (or loses) the cross-bot FCFS claim,
//! and enqueues normalized forward jobs. The listener never posts to the
//! platform itself; all outbound traffic happens in the forwarder worker so
//! rate limits can be controlled in one place.

use crate::categ::{Category, CategorizationCache};
use crate::chat::slack::{SlackChat, SlackSocketIngest};
use crate::chat::{ChatApi, EventKind, MessageEvent};
use crate::config::{Config, MasterChannels};
use crate::error::ChatError;
use crate::queue::{ForwardJob, JobKind, JobQueue};
use crate::scheduler;
use crate::state::{FCFS_TTL, StateStore, fcfs_edit_key, fcfs_msg_key};

use futures::StreamExt as _;
use std::sync::Arc;
use std::time::Duration;

/// How long resolved channel names are reused before a fresh lookup.
const NAME_CACHE_TTL: Duration = Duration::from_secs(300);

/// What happened to a single inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Claim won, job on the stream.
    Enqueued(String),
    /// Another bot already claimed this event.
    Duplicate,
    /// Filtered before the claim.
    Dropped(DropReason),
    /// Claim won but the enqueue failed; the event is lost to this bot.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    IgnoredChannel,
    UnknownChannel,
    MasterChannel,
    BotOriginated,
    NameUnavailable,
}

/// The per-bot ingest pipeline, generic over the platform and state seams.
pub struct Listener {
    bot_id: u32,
    bot_name: String,
    masters: MasterChannels,
    categ: Arc<CategorizationCache>,
    state: Arc<dyn StateStore>,
    queue: JobQueue,
    chat: Arc<dyn ChatApi>,
    names: moka::future::Cache<String, String>,
}

impl Listener {
    pub fn new(
        bot_id: u32,
        bot_name: impl Into<String>,
        masters: MasterChannels,
        categ: Arc<CategorizationCache>,
        state: Arc<dyn StateStore>,
        chat: Arc<dyn ChatApi>,
    ) -> Self {
        let queue = JobQueue::new(state.clone());
        Self {
            bot_id,
            bot_name: bot_name.into(),
            masters,
            categ,
            state,
            queue,
            chat,
            names: moka::future::Cache::builder()
                .max_capacity(1024)
                .time_to_live(NAME_CACHE_TTL)
                .build(),
        }
    }

    /// Resolve all four master channels up front so a misconfigured id
    /// fails the process at startup instead of per event.
    pub async fn validate_master_channels(&self) -> crate::Result<()> {
        for (label, channel_id) in [
            ("agent", &self.masters.agent),
            ("apptbk", &self.masters.apptbk),
            ("managed_admin", &self.masters.managed_admin),
            ("storm_admin", &self.masters.storm_admin),
        ] {
            let info = self.chat.channel_info(channel_id).await?;
            tracing::info!(category = label, channel = %info.name, "master channel validated");
        }
        Ok(())
    }

    /// Run one event through the pipeline.
    pub async fn handle_event(&self, event: MessageEvent) -> EventOutcome {
        // Events posted into a master channel are the relay's own output.
        if self.masters.contains(&event.channel_id) {
            return EventOutcome::Dropped(DropReason::MasterChannel);
        }

        let channel_name = match self.channel_name(&event.channel_id).await {
            Ok(name) => name,
            Err(error) => {
                tracing::warn!(
                    channel_id = %event.channel_id,
                    %error,
                    "could not resolve channel name, dropping event"
                );
                return EventOutcome::Dropped(DropReason::NameUnavailable);
            }
        };

        let category = self.categ.classify(&channel_name);
        match category {
            Category::Ignored => return EventOutcome::Dropped(DropReason::IgnoredChannel),
            Category::Unknown => return EventOutcome::Dropped(DropReason::UnknownChannel),
            _ => {}
        }

        // Apptbk channels forward everything including bot traffic; every
        // other category drops bot-originated events.
        if event.is_bot_originated() && category != Category::Apptbk {
            return EventOutcome::Dropped(DropReason::BotOriginated);
        }

        let Some(target_channel_id) = self.masters.for_category(category) else {
            return EventOutcome::Dropped(DropReason::UnknownChannel);
        };
        let target_channel_id = target_channel_id.to_string();

        let identifier = message_identifier(&event);
        let claim_key = match event.kind {
            EventKind::New => fcfs_msg_key(&event.channel_id, &identifier),
            EventKind::Edited => fcfs_edit_key(&event.channel_id, &identifier),
        };

        match self.state.claim(&claim_key, &identifier, FCFS_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    bot = %self.bot_name,
                    key = %claim_key,
                    "event already claimed by another bot"
                );
                return EventOutcome::Duplicate;
            }
            Err(error) => {
                // Fail open: with the store unreachable we cannot
                // deduplicate, and a duplicate forward beats a lost message.
                tracing::warn!(
                    bot = %self.bot_name,
                    key = %claim_key,
                    %error,
                    "claim failed, proceeding without dedup"
                );
            }
        }

        let job = self.build_job(&event, category, channel_name.clone(), target_channel_id);

        match self.queue.push(&job).await {
            Ok(entry_id) => {
                tracing::info!(
                    bot = %self.bot_name,
                    entry_id = %entry_id,
                    category = %category,
                    source = %channel_name,
                    kind = job.kind.as_str(),
                    "enqueued forward job"
                );
                EventOutcome::Enqueued(entry_id)
            }
            Err(error) => {
                tracing::error!(
                    bot = %self.bot_name,
                    source = %channel_name,
                    %error,
                    "failed to enqueue forward job"
                );
                EventOutcome::Failed
            }
        }
    }

    fn build_job(
        &self,
        event: &MessageEvent,
        category: Category,
        source_channel_name: String,
        target_channel_id: String,
    ) -> ForwardJob {
        let user = event
            .user
            .clone()
            .or_else(|| event.bot_id.clone())
            .unwrap_or_else(|| "unknown".into());

        match event.kind {
            EventKind::New => {
                let is_thread_reply = event
                    .thread_ts
                    .as_ref()
                    .is_some_and(|thread_ts| *thread_ts != event.ts);
                ForwardJob {
                    kind: JobKind::Post,
                    category,
                    source_channel_id: event.channel_id.clone(),
                    source_channel_name,
                    target_channel_id,
                    user,
                    source_ts: event.ts.clone(),
                    thread_ts: event.thread_ts.clone(),
                    is_thread_reply,
                    text: event.text.clone(),
                    attachments: event.attachments.clone(),
                    files: event.files.clone(),
                    bot_id: self.bot_id,
                }
            }
            EventKind::Edited => ForwardJob {
                kind: JobKind::Update,
                category,
                source_channel_id: event.channel_id.clone(),
                source_channel_name,
                target_channel_id,
                user,
                source_ts: event.ts.clone(),
                thread_ts: None,
                is_thread_reply: false,
                text: event.text.clone(),
                attachments: Vec::new(),
                files: Vec::new(),
                bot_id: self.bot_id,
            },
        }
    }

    async fn channel_name(&self, channel_id: &str) -> Result<String, Arc<ChatError>> {
        let chat = self.chat.clone();
        let id = channel_id.to_string();
        self.names
            .try_get_with(id.clone(), async move {
                chat.channel_info(&id).await.map(|info| info.name)
            })
            .await
    }
}

/// Stable identifier for an event, shared by all bots that receive it.
///
/// Prefers the platform's unique per-message id. Without one, derives a
/// 16-hex-digit hash over channel, author, and the first 50 characters of
/// text. The platform timestamp is never used: each bot's receipt can carry
/// a different ts, which would defeat cross-bot deduplication.
pub fn message_identifier(event: &MessageEvent) -> String {
    if let Some(client_msg_id) = &event.client_msg_id {
        return client_msg_id.clone();
    }

    let author = event
        .user
        .as_deref()
        .or(event.bot_id.as_deref())
        .unwrap_or("bot");
    let prefix: String = event.text.chars().take(50).collect();
    let signature = format!("{}:{}:{}", event.channel_id, author, prefix);
    let digest = md5::compute(signature.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// Run the listener process for the configured bot identity.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let bot = config.current_bot().clone();
    tracing::info!(
        bot = %bot.name,
        total_bots = config.bots.len(),
        "starting ingest listener"
    );

    let state: Arc<dyn StateStore> =
        Arc::new(crate::state::redis::RedisStore::connect(&config.redis).await?);
    let chat: Arc<dyn ChatApi> = Arc::new(SlackChat::new(&bot.bot_token)?);
    chat.auth_check().await?;

    let categ = Arc::new(CategorizationCache::load(config.channel_lists_path()));

    let listener = Listener::new(
        bot.bot_id,
        bot.name.clone(),
        config.masters.clone(),
        categ.clone(),
        state,
        chat.clone(),
    );
    listener.validate_master_channels().await?;

    // Bot 1 refreshes discovery, categorization, and assignment for the
    // whole fleet; the others just reload the snapshots it writes.
    let _background = if bot.bot_id == 1 {
        scheduler::spawn_refresh_loop(chat, categ, &config)
    } else {
        scheduler::spawn_reload_loop(categ, config.channel_lists_path())
    };

    let mut events = SlackSocketIngest::new(&bot.app_token).start().await?;
    while let Some(event) = events.next().await {
        listener.handle_event(event).await;
    }

    tracing::info!(bot = %bot.name, "event stream closed, listener exiting");
    Ok(())
}
