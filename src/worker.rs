//! Forwarder worker: consumes normalized jobs and posts to master channels.
//!
//! Workers own all outbound platform traffic. Each job carries the index of
//! the bot that ingested it; the worker posts with that identity (it is
//! guaranteed to be a member of the source channel for thread-parent
//! fetches) and falls back to any identity for master-channel posts.

use crate::chat::ChatApi;
use crate::chat::slack::SlackChat;
use crate::config::Config;
use crate::error::ChatError;
use crate::queue::{ForwardJob, JobKind, JobQueue};
use crate::state::{MAP_TTL, StateStore, StreamEntry, map_msg_key, map_parent_key};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Attempt cap for the retry envelope (initial call included).
const MAX_ATTEMPTS: u32 = 4;

pub struct Forwarder {
    clients: BTreeMap<u32, Arc<dyn ChatApi>>,
    state: Arc<dyn StateStore>,
    queue: JobQueue,
    consumer: String,
}

impl Forwarder {
    pub fn new(
        clients: BTreeMap<u32, Arc<dyn ChatApi>>,
        state: Arc<dyn StateStore>,
        consumer: impl Into<String>,
    ) -> Self {
        let queue = JobQueue::new(state.clone());
        Self {
            clients,
            state,
            queue,
            consumer: consumer.into(),
        }
    }

    /// Read and process one batch. Every entry is acknowledged, including
    /// unparseable ones and permanent failures: a poisoned job must not
    /// block the pending-entry list.
    pub async fn run_once(&self) -> crate::Result<usize> {
        let batch = self.queue.read(&self.consumer).await?;
        let count = batch.len();
        for entry in &batch {
            self.process_entry(entry).await;
            self.queue.ack(&entry.id).await?;
        }
        Ok(count)
    }

    /// Consume until the stream read fails fatally or SIGTERM arrives.
    pub async fn run(self) -> crate::Result<()> {
        self.queue.ensure_group().await?;
        tracing::info!(consumer = %self.consumer, "forwarder worker started");

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(crate::Error::Io)?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!(consumer = %self.consumer, "terminate received, worker exiting");
                    return Ok(());
                }
                result = self.run_once() => {
                    if let Err(error) = result {
                        tracing::error!(%error, "worker loop error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    async fn process_entry(&self, entry: &StreamEntry) {
        let job = match ForwardJob::from_fields(&entry.fields) {
            Ok(job) => job,
            Err(error) => {
                tracing::warn!(entry_id = %entry.id, %error, "dropping unparseable job");
                return;
            }
        };
        self.handle_job(&job).await;
    }

    pub async fn handle_job(&self, job: &ForwardJob) {
        let Some(client) = self.client_for(job.bot_id) else {
            tracing::error!(bot_id = job.bot_id, "no chat clients configured");
            return;
        };

        match job.kind {
            JobKind::Post => self.handle_post(&client, job).await,
            JobKind::Update => self.handle_update(&client, job).await,
        }
    }

    /// The client for the originating bot, or any available identity.
    /// Posting to a master channel only needs master-channel membership,
    /// which every identity has.
    fn client_for(&self, bot_id: u32) -> Option<Arc<dyn ChatApi>> {
        self.clients
            .get(&bot_id)
            .or_else(|| self.clients.values().next())
            .cloned()
    }

    async fn handle_post(&self, client: &Arc<dyn ChatApi>, job: &ForwardJob) {
        let text = render_forward_text(
            &job.source_channel_name,
            &job.text,
            &job.user,
            &job.source_ts,
        );

        let thread_ts = if job.is_thread_reply {
            self.ensure_parent_posted(client, job).await
        } else {
            None
        };

        let mut attachments = job.attachments.clone();
        attachments.extend(file_attachments(&job.files, &job.user, &job.source_ts));

        let posted = with_retry(|| {
            client.post_message(
                &job.target_channel_id,
                &text,
                thread_ts.as_deref(),
                &attachments,
            )
        })
        .await;

        match posted {
            Ok(posted) => {
                let key = map_msg_key(&job.source_channel_id, &job.source_ts);
                if let Err(error) = self.state.set_string(&key, &posted.ts, MAP_TTL).await {
                    tracing::warn!(%key, %error, "failed to store message mapping");
                }
                tracing::info!(
                    target = %job.target_channel_id,
                    source = %job.source_channel_name,
                    "forwarded message"
                );
            }
            Err(error) => {
                tracing::error!(
                    target = %job.target_channel_id,
                    source = %job.source_channel_name,
                    %error,
                    "post failed, dropping job"
                );
            }
        }
    }

    async fn handle_update(&self, client: &Arc<dyn ChatApi>, job: &ForwardJob) {
        let key = map_msg_key(&job.source_channel_id, &job.source_ts);
        let master_ts = match self.state.get_string(&key).await {
            Ok(Some(ts)) => ts,
            Ok(None) => {
                // The original post predates this worker's knowledge (or the
                // mapping expired); nothing to update retroactively.
                tracing::warn!(%key, "no master mapping for update");
                return;
            }
            Err(error) => {
                tracing::warn!(%key, %error, "mapping lookup failed, skipping update");
                return;
            }
        };

        let text = render_forward_text(
            &job.source_channel_name,
            &job.text,
            &job.user,
            &job.source_ts,
        );

        let result = with_retry(|| {
            client.update_message(&job.target_channel_id, &master_ts, &text)
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(target = %job.target_channel_id, ts = %master_ts, "updated forwarded message");
            }
            Err(error) => {
                tracing::error!(target = %job.target_channel_id, %error, "update failed, dropping job");
            }
        }
    }

    /// Make sure the reply's thread parent exists in the master channel and
    /// return its ts there.
    ///
    /// On a mapping miss the original parent is fetched from the source
    /// channel and re-posted as a synthetic parent. Failures degrade to an
    /// unthreaded post rather than losing the reply.
    async fn ensure_parent_posted(
        &self,
        client: &Arc<dyn ChatApi>,
        job: &ForwardJob,
    ) -> Option<String> {
        let thread_ts = job.thread_ts.as_deref()?;

        let cache_key = map_parent_key(&job.source_channel_id, thread_ts);
        match self.state.get_string(&cache_key).await {
            Ok(Some(master_parent_ts)) => return Some(master_parent_ts),
            Ok(None) => {}
            Err(error) => {
                // Treated as a miss; a duplicate synthetic parent is
                // acceptable.
                tracing::warn!(key = %cache_key, %error, "parent mapping lookup failed");
            }
        }

        let parent = match client.message_at(&job.source_channel_id, thread_ts).await {
            Ok(Some(parent)) => parent,
            Ok(None) => {
                tracing::warn!(
                    channel = %job.source_channel_id,
                    thread_ts,
                    "thread parent not found in source history"
                );
                return None;
            }
            Err(error) => {
                tracing::error!(channel = %job.source_channel_id, %error, "failed to fetch thread parent");
                return None;
            }
        };

        let author = parent
            .user
            .clone()
            .or_else(|| parent.bot_id.clone())
            .unwrap_or_else(|| "unknown".into());
        let parent_text = render_forward_text(
            &job.source_channel_name,
            &parent.text,
            &author,
            &parent.ts,
        );

        let posted = match with_retry(|| {
            client.post_message(&job.target_channel_id, &parent_text, None, &[])
        })
        .await
        {
            Ok(posted) => posted,
            Err(error) => {
                tracing::error!(%error, "failed to post synthetic thread parent");
                return None;
            }
        };

        let store_key = map_parent_key(&job.source_channel_id, &parent.ts);
        if let Err(error) = self.state.set_string(&store_key, &posted.ts, MAP_TTL).await {
            tracing::warn!(key = %store_key, %error, "failed to store parent mapping");
        }

        Some(posted.ts)
    }
}

/// Retry envelope for platform calls.
///
/// An explicit Retry-After delay is honored verbatim; transient error codes
/// back off exponentially (1 s, 2 s, 4 s); anything else fails immediately.
/// At most `MAX_ATTEMPTS` calls are made in total.
async fn with_retry<T, F, Fut>(operation: F) -> Result<T, ChatError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ChatError>>,
{
    let mut backoff = Duration::from_secs(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS || !error.is_transient() {
                    return Err(error);
                }
                match error.retry_after() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
    }
}

/// The forwarded message body.
fn render_forward_text(channel_name: &str, text: &str, user: &str, source_ts: &str) -> String {
    let posted_at = eastern_time(source_ts).unwrap_or_default();
    format!("*From #{channel_name}*\n{text}\n_Posted by <@{user}> at {posted_at}_")
}

/// Render a platform ts in US/Eastern, e.g. `2023-11-14 05:13:20 PM EST`.
fn eastern_time(ts: &str) -> Option<String> {
    let seconds = ts.split('.').next()?.parse::<i64>().ok()?;
    let utc = chrono::DateTime::from_timestamp(seconds, 0)?;
    let eastern = utc.with_timezone(&chrono_tz::US::Eastern);
    Some(eastern.format("%Y-%m-%d %I:%M:%S %p %Z").to_string())
}

/// Build attachment records for shared files.
fn file_attachments(
    files: &[serde_json::Value],
    user: &str,
    source_ts: &str,
) -> Vec<serde_json::Value> {
    files
        .iter()
        .filter_map(|file| {
            let name = file
                .get("name")
                .and_then(|value| value.as_str())
                .unwrap_or("unnamed");
            let url = file.get("url_private").and_then(|value| value.as_str())?;

            let mut record = serde_json::json!({
                "fallback": format!("File: {name}"),
                "title": name,
                "title_link": url,
                "text": format!("File shared by <@{user}>"),
                "ts": source_ts,
            });
            let is_image = file
                .get("mimetype")
                .and_then(|value| value.as_str())
                .is_some_and(|mimetype| mimetype.starts_with("image/"));
            if is_image {
                record["image_url"] = serde_json::json!(url);
            }
            Some(record)
        })
        .collect()
}

/// Run the worker process.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let state: Arc<dyn StateStore> =
        Arc::new(crate::state::redis::RedisStore::connect(&config.redis).await?);

    let mut clients: BTreeMap<u32, Arc<dyn ChatApi>> = BTreeMap::new();
    for bot in &config.bots {
        clients.insert(bot.bot_id, Arc::new(SlackChat::new(&bot.bot_token)?));
    }

    let consumer = format!("worker-{}", std::process::id());
    let forwarder = Forwarder::new(clients, state, consumer);
    forwarder.run().await?;
    Ok(())
}
