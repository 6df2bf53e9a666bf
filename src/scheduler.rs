//! Periodic refresh of discovery, categorization, and assignment.
//!
//! Bot 1 runs the full refresh: enumerate admin channels, pull fresh
//! categorization sets from the provider, persist both, and extend the
//! assignment table. Every other bot only reloads the snapshots bot 1
//! writes. Both loops run inside the listener process.

use crate::assign::AssignmentTable;
use crate::categ::{CategorizationCache, CategorizationProvider, StaticListsProvider};
use crate::chat::{ChannelInfo, ChatApi};
use crate::config::Config;
use crate::error::ChatError;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Full refresh cadence.
const REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Backoff after a failed refresh.
const ERROR_RETRY: Duration = Duration::from_secs(3600);

/// Whether a channel name marks an admin channel eligible for discovery.
pub fn is_admin_channel(name: &str) -> bool {
    name.ends_with("-admin") || name.ends_with("-admins")
}

/// Enumerate all channels and keep live admin channels.
pub async fn discover_admin_channels(
    chat: &dyn ChatApi,
) -> Result<Vec<ChannelInfo>, ChatError> {
    let all = chat.list_channels().await?;
    let total = all.len();
    let admin: Vec<ChannelInfo> = all
        .into_iter()
        .filter(|channel| is_admin_channel(&channel.name) && !channel.is_archived)
        .collect();
    tracing::info!(total, admin = admin.len(), "channel discovery complete");
    Ok(admin)
}

/// The bot-1 refresh job.
pub struct Refresher {
    chat: Arc<dyn ChatApi>,
    categ: Arc<CategorizationCache>,
    provider: Arc<dyn CategorizationProvider>,
    assignment_path: PathBuf,
    lists_path: PathBuf,
    total_bots: u32,
}

impl Refresher {
    pub fn new(
        chat: Arc<dyn ChatApi>,
        categ: Arc<CategorizationCache>,
        provider: Arc<dyn CategorizationProvider>,
        assignment_path: PathBuf,
        lists_path: PathBuf,
        total_bots: u32,
    ) -> Self {
        Self {
            chat,
            categ,
            provider,
            assignment_path,
            lists_path,
            total_bots,
        }
    }

    /// One full refresh pass.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let admin_channels = discover_admin_channels(self.chat.as_ref()).await?;

        let lists = self.provider.refresh().await?;
        if let Some(parent) = self.lists_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.lists_path, serde_json::to_string_pretty(&lists)?)?;
        self.categ.replace(lists);

        let channel_ids: Vec<String> = admin_channels
            .iter()
            .map(|channel| channel.id.clone())
            .collect();
        let mut assignments = AssignmentTable::load(&self.assignment_path, self.total_bots);
        assignments.assign_channels(&channel_ids);

        for (bot, count) in assignments.distribution() {
            tracing::info!(bot, channels = count, "assignment distribution");
        }
        Ok(())
    }
}

/// Spawn the bot-1 refresh loop: refresh immediately, then every 12 hours,
/// retrying after an hour on failure.
pub fn spawn_refresh_loop(
    chat: Arc<dyn ChatApi>,
    categ: Arc<CategorizationCache>,
    config: &Config,
) -> tokio::task::JoinHandle<()> {
    let refresher = Refresher::new(
        chat,
        categ,
        Arc::new(StaticListsProvider::new(config.channel_lists_path())),
        config.assignment_path(),
        config.channel_lists_path(),
        config.bots.len() as u32,
    );

    tokio::spawn(async move {
        tracing::info!("refresh scheduler started, updating every 12 hours");
        loop {
            let delay = match refresher.refresh().await {
                Ok(()) => REFRESH_INTERVAL,
                Err(error) => {
                    tracing::error!(%error, "refresh failed, retrying in an hour");
                    ERROR_RETRY
                }
            };
            tokio::time::sleep(delay).await;
        }
    })
}

/// Spawn the follower loop: bots other than 1 reload the categorization
/// snapshot bot 1 persists.
pub fn spawn_reload_loop(
    categ: Arc<CategorizationCache>,
    lists_path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        // Skip catch-up ticks if reloading falls behind.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick; snapshot is already loaded

        loop {
            ticker.tick().await;
            if let Err(error) = categ.reload() {
                tracing::warn!(path = %lists_path.display(), %error, "categorization reload failed");
            }
        }
    })
}
