//! Process supervision: one listener child per bot identity plus the
//! forwarder workers.
//!
//! Children are respawned after a grace period when they exit unexpectedly.
//! Shutdown delivers SIGTERM so children can finish their current job, with
//! a hard kill after the timeout. Cross-process state never lives here; the
//! supervisor only owns lifecycle.

use crate::assign::AssignmentTable;
use crate::chat::ChatApi;
use crate::chat::slack::SlackChat;
use crate::config::Config;
use crate::error::ChatError;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// Channels that have historically been archived out from under the
/// assignment table. Resolved at startup and pruned when gone.
const POTENTIALLY_ARCHIVED_CHANNELS: &[&str] =
    &["C05UNJX2B4H", "C06AJ4QJ3V0", "C06Q1TSD9BW"];

/// Delay before restarting a crashed child.
const RESTART_GRACE: Duration = Duration::from_secs(5);

/// How long a child gets to exit after SIGTERM before SIGKILL.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Stagger between listener starts so N socket connections don't all
/// handshake at once.
const START_STAGGER: Duration = Duration::from_secs(2);

/// Definition of one supervised child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl ChildSpec {
    pub fn listener(bot_id: u32) -> Self {
        Self {
            name: format!("listener-{bot_id}"),
            args: vec![
                "listener".to_string(),
                "--bot".to_string(),
                bot_id.to_string(),
            ],
        }
    }

    pub fn worker(index: usize) -> Self {
        Self {
            name: format!("worker-{index}"),
            args: vec!["worker".to_string()],
        }
    }
}

type StatusMap = Arc<Mutex<HashMap<String, bool>>>;

/// Run the supervisor until interrupted.
pub async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        bots = config.bots.len(),
        workers = config.worker_count,
        "starting supervisor"
    );

    // Resolve channels that may have been archived since the last run and
    // drop them from the assignment table before any child loads it.
    let bot_one = config
        .bots
        .first()
        .ok_or_else(|| anyhow::anyhow!("no bots configured"))?;
    let chat = SlackChat::new(&bot_one.bot_token)?;
    prune_archived_channels(
        &chat,
        &config.assignment_path(),
        config.bots.len() as u32,
    )
    .await;

    let mut specs = Vec::new();
    for bot in &config.bots {
        specs.push(ChildSpec::listener(bot.bot_id));
    }
    for index in 1..=config.worker_count {
        specs.push(ChildSpec::worker(index));
    }

    let statuses: StatusMap = Arc::new(Mutex::new(
        specs
            .iter()
            .map(|spec| (spec.name.clone(), false))
            .collect(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for spec in specs {
        let is_listener = spec.args.first().is_some_and(|arg| arg == "listener");
        handles.push(tokio::spawn(supervise_child(
            spec,
            statuses.clone(),
            shutdown_rx.clone(),
        )));
        if is_listener {
            tokio::time::sleep(START_STAGGER).await;
        }
    }

    let heartbeat_statuses = statuses.clone();
    let mut heartbeat_shutdown = shutdown_rx.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = heartbeat_statuses.lock().unwrap().clone();
                    let alive = snapshot.values().filter(|alive| **alive).count();
                    tracing::info!(alive, total = snapshot.len(), "heartbeat");
                    for (name, alive) in snapshot {
                        tracing::debug!(child = %name, alive, "child status");
                    }
                }
                _ = heartbeat_shutdown.changed() => break,
            }
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping children");
    shutdown_tx.send(true).ok();

    for handle in handles {
        handle.await.ok();
    }
    heartbeat.await.ok();

    tracing::info!("all children stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Keep one child running, restarting after the grace period when it
/// exits unexpectedly.
async fn supervise_child(spec: ChildSpec, statuses: StatusMap, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let mut child = match spawn_child(&spec) {
            Ok(child) => child,
            Err(error) => {
                tracing::error!(child = %spec.name, %error, "failed to spawn child");
                tokio::time::sleep(RESTART_GRACE).await;
                continue;
            }
        };
        set_status(&statuses, &spec.name, true);
        tracing::info!(child = %spec.name, pid = child.id(), "child started");

        tokio::select! {
            exit = child.wait() => {
                set_status(&statuses, &spec.name, false);
                match exit {
                    Ok(status) => {
                        tracing::warn!(child = %spec.name, %status, "child exited, restarting after grace");
                    }
                    Err(error) => {
                        tracing::error!(child = %spec.name, %error, "child wait failed, restarting after grace");
                    }
                }
                tokio::time::sleep(RESTART_GRACE).await;
            }
            _ = shutdown_rx.changed() => {
                terminate_child(&spec.name, &mut child).await;
                set_status(&statuses, &spec.name, false);
                break;
            }
        }
    }
}

fn set_status(statuses: &StatusMap, name: &str, alive: bool) {
    statuses.lock().unwrap().insert(name.to_string(), alive);
}

fn spawn_child(spec: &ChildSpec) -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    Command::new(exe)
        .args(&spec.args)
        .kill_on_drop(true)
        .spawn()
}

/// SIGTERM the child so it finishes its current job, escalate to SIGKILL
/// after the timeout.
async fn terminate_child(name: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
        Ok(_) => {
            tracing::info!(child = %name, "child stopped");
        }
        Err(_) => {
            tracing::warn!(child = %name, "child did not stop in time, killing");
            child.start_kill().ok();
            child.wait().await.ok();
        }
    }
}

/// Resolve the hard-coded potentially-archived channels and remove the
/// dead ones from the assignment table.
async fn prune_archived_channels(chat: &dyn ChatApi, assignment_path: &std::path::Path, total_bots: u32) {
    let mut table = AssignmentTable::load(assignment_path, total_bots);

    for channel_id in POTENTIALLY_ARCHIVED_CHANNELS {
        match chat.channel_info(channel_id).await {
            Ok(info) if info.is_archived => {
                if table.remove(channel_id) {
                    tracing::info!(%channel_id, name = %info.name, "removed archived channel from assignments");
                }
            }
            Ok(_) => {}
            Err(ChatError::Api { code }) if code == "channel_not_found" => {
                if table.remove(channel_id) {
                    tracing::info!(%channel_id, "removed missing channel from assignments");
                }
            }
            Err(error) => {
                tracing::warn!(%channel_id, %error, "could not resolve channel during health check");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChannelInfo, PostedMessage, SourceMessage};
    use async_trait::async_trait;

    struct HealthChat;

    #[async_trait]
    impl ChatApi for HealthChat {
        async fn post_message(
            &self,
            _channel_id: &str,
            _text: &str,
            _thread_ts: Option<&str>,
            _attachments: &[serde_json::Value],
        ) -> Result<PostedMessage, ChatError> {
            Err(ChatError::Transport("not used".into()))
        }

        async fn update_message(
            &self,
            _channel_id: &str,
            _ts: &str,
            _text: &str,
        ) -> Result<(), ChatError> {
            Err(ChatError::Transport("not used".into()))
        }

        async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo, ChatError> {
            match channel_id {
                // First probe channel still exists and is live.
                "C05UNJX2B4H" => Ok(ChannelInfo {
                    id: channel_id.into(),
                    name: "still-alive-admin".into(),
                    is_archived: false,
                }),
                // Second is archived.
                "C06AJ4QJ3V0" => Ok(ChannelInfo {
                    id: channel_id.into(),
                    name: "gone-admin".into(),
                    is_archived: true,
                }),
                // Third no longer resolves at all.
                _ => Err(ChatError::Api {
                    code: "channel_not_found".into(),
                }),
            }
        }

        async fn message_at(
            &self,
            _channel_id: &str,
            _ts: &str,
        ) -> Result<Option<SourceMessage>, ChatError> {
            Ok(None)
        }

        async fn list_channels(&self) -> Result<Vec<ChannelInfo>, ChatError> {
            Ok(Vec::new())
        }

        async fn auth_check(&self) -> Result<(), ChatError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn health_check_prunes_archived_and_missing_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_assignment.json");

        let mut table = AssignmentTable::load(&path, 2);
        table.assign_channels(&[
            "C05UNJX2B4H".to_string(),
            "C06AJ4QJ3V0".to_string(),
            "C06Q1TSD9BW".to_string(),
            "C_UNRELATED".to_string(),
        ]);

        prune_archived_channels(&HealthChat, &path, 2).await;

        let table = AssignmentTable::load(&path, 2);
        assert!((1..=2).any(|bot| table.is_assigned_to("C05UNJX2B4H", bot)));
        assert!(!(1..=2).any(|bot| table.is_assigned_to("C06AJ4QJ3V0", bot)));
        assert!(!(1..=2).any(|bot| table.is_assigned_to("C06Q1TSD9BW", bot)));
        assert!((1..=2).any(|bot| table.is_assigned_to("C_UNRELATED", bot)));
    }

    #[test]
    fn child_specs_map_to_cli_modes() {
        let listener = ChildSpec::listener(3);
        assert_eq!(listener.name, "listener-3");
        assert_eq!(listener.args, vec!["listener", "--bot", "3"]);

        let worker = ChildSpec::worker(2);
        assert_eq!(worker.name, "worker-2");
        assert_eq!(worker.args, vec!["worker"]);
    }
}
