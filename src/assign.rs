//! Channel → bot assignment for distributing discovery and administrative
//! work across bot identities.
//!
//! Assignments are stable: a channel is hashed to a bot exactly once and
//! keeps that bot even when the bot count changes later. The forwarding hot
//! path never consults this table; correctness there comes from the FCFS
//! claim.

use crate::error::{ConfigError, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct AssignmentMetadata {
    total_bots: u32,
    total_channels: usize,
    bot_ids: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssignmentFile {
    metadata: AssignmentMetadata,
    assignments: HashMap<String, u32>,
}

/// Persistent channel → bot index table. Written only by bot 1; other bots
/// load read-only snapshots.
pub struct AssignmentTable {
    assignments: HashMap<String, u32>,
    total_bots: u32,
    path: PathBuf,
}

impl AssignmentTable {
    /// Load the table from disk; a missing file yields an empty table.
    pub fn load(path: impl Into<PathBuf>, total_bots: u32) -> Self {
        let path = path.into();
        let assignments = match read_assignments(&path) {
            Ok(assignments) => assignments,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "starting with empty assignment table");
                HashMap::new()
            }
        };
        Self {
            assignments,
            total_bots: total_bots.max(1),
            path,
        }
    }

    /// Partition `channel_ids` into new and existing channels, hash the new
    /// ones onto bots, persist, and return the complete per-bot picture
    /// (existing assignments included).
    pub fn assign_channels(&mut self, channel_ids: &[String]) -> HashMap<u32, Vec<String>> {
        let mut per_bot: HashMap<u32, Vec<String>> =
            (1..=self.total_bots).map(|bot| (bot, Vec::new())).collect();

        let new_count = channel_ids
            .iter()
            .filter(|id| !self.assignments.contains_key(*id))
            .count();
        if new_count > 0 {
            tracing::info!(
                new = new_count,
                existing = channel_ids.len() - new_count,
                "assigning new channels"
            );
        }

        for channel_id in channel_ids {
            let bot = *self
                .assignments
                .entry(channel_id.clone())
                .or_insert_with(|| hash_to_bot(channel_id, self.total_bots));
            per_bot.entry(bot).or_default().push(channel_id.clone());
        }

        if let Err(error) = self.persist() {
            tracing::error!(%error, "failed to persist channel assignments");
        }

        per_bot
    }

    /// Whether `channel_id` is assigned to `bot_id`. Administrative
    /// reporting only; forwarding does not depend on assignment.
    pub fn is_assigned_to(&self, channel_id: &str, bot_id: u32) -> bool {
        self.assignments.get(channel_id) == Some(&bot_id)
    }

    /// Channels currently assigned to `bot_id`.
    pub fn channels_for(&self, bot_id: u32) -> Vec<String> {
        let mut channels: Vec<String> = self
            .assignments
            .iter()
            .filter(|(_, assigned)| **assigned == bot_id)
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Drop a channel from the table (archived channel cleanup). Returns
    /// whether it was present.
    pub fn remove(&mut self, channel_id: &str) -> bool {
        let removed = self.assignments.remove(channel_id).is_some();
        if removed {
            if let Err(error) = self.persist() {
                tracing::error!(%error, "failed to persist channel assignments");
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn total_bots(&self) -> u32 {
        self.total_bots
    }

    /// Write the table and its metadata block to disk.
    pub fn persist(&self) -> Result<()> {
        let file = AssignmentFile {
            metadata: AssignmentMetadata {
                total_bots: self.total_bots,
                total_channels: self.assignments.len(),
                bot_ids: (1..=self.total_bots).collect(),
            },
            assignments: self.assignments.clone(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&file)
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Replace the in-memory table with the on-disk snapshot.
    pub fn reload(&mut self) -> Result<()> {
        self.assignments = read_assignments(&self.path)?;
        Ok(())
    }

    /// Per-bot channel counts for the heartbeat / admin report.
    pub fn distribution(&self) -> HashMap<u32, usize> {
        let mut counts: HashMap<u32, usize> =
            (1..=self.total_bots).map(|bot| (bot, 0)).collect();
        for bot in self.assignments.values() {
            *counts.entry(*bot).or_default() += 1;
        }
        counts
    }
}

fn read_assignments(path: &Path) -> Result<HashMap<String, u32>> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
        path: path.display().to_string(),
        source,
    })?;
    let file: AssignmentFile = serde_json::from_str(&raw)
        .map_err(|error| ConfigError::Invalid(format!("{}: {error}", path.display())))?;
    Ok(file.assignments)
}

/// Stable hash of a channel id onto a 1-based bot index.
fn hash_to_bot(channel_id: &str, total_bots: u32) -> u32 {
    let digest = md5::compute(channel_id.as_bytes());
    let value = u128::from_be_bytes(digest.0);
    (value % u128::from(total_bots)) as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(dir: &tempfile::TempDir, total_bots: u32) -> AssignmentTable {
        AssignmentTable::load(dir.path().join("channel_assignment.json"), total_bots)
    }

    #[test]
    fn hash_is_stable_and_in_range() {
        for id in ["C0123456789", "C99ZZZZZZ", "CABCDEF"] {
            let bot = hash_to_bot(id, 3);
            assert_eq!(bot, hash_to_bot(id, 3));
            assert!((1..=3).contains(&bot));
        }
    }

    #[test]
    fn new_channels_are_assigned_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = table(&dir, 3);

        let channels: Vec<String> = (0..20).map(|i| format!("C{i:08}")).collect();
        let per_bot = table.assign_channels(&channels);

        let assigned: usize = per_bot.values().map(Vec::len).sum();
        assert_eq!(assigned, 20);

        // A fresh load sees the same assignments.
        let reloaded = AssignmentTable::load(dir.path().join("channel_assignment.json"), 3);
        for channel in &channels {
            let bot = (1..=3).find(|b| reloaded.is_assigned_to(channel, *b));
            assert!(bot.is_some(), "{channel} lost on reload");
        }
    }

    #[test]
    fn existing_assignments_survive_new_channels_and_bot_count_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_assignment.json");

        let mut table = AssignmentTable::load(&path, 2);
        let first: Vec<String> = (0..10).map(|i| format!("C{i:08}")).collect();
        table.assign_channels(&first);
        let before: HashMap<String, u32> = first
            .iter()
            .map(|c| {
                let bot = (1..=2).find(|b| table.is_assigned_to(c, *b)).unwrap();
                (c.clone(), bot)
            })
            .collect();

        // Reload with a larger fleet and add more channels. Old channels
        // keep their bots even though the hash modulus changed.
        let mut table = AssignmentTable::load(&path, 5);
        let second: Vec<String> = (10..30).map(|i| format!("C{i:08}")).collect();
        let mut all = first.clone();
        all.extend(second);
        table.assign_channels(&all);

        for (channel, bot) in &before {
            assert!(
                table.is_assigned_to(channel, *bot),
                "{channel} was re-hashed away from bot {bot}"
            );
        }
    }

    #[test]
    fn result_includes_existing_assignments() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = table(&dir, 2);

        let channels = vec!["C00000001".to_string(), "C00000002".to_string()];
        table.assign_channels(&channels);
        let per_bot = table.assign_channels(&channels);

        let total: usize = per_bot.values().map(Vec::len).sum();
        assert_eq!(total, 2, "existing channels must appear in the result");
    }

    #[test]
    fn remove_drops_the_channel_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_assignment.json");
        let mut table = AssignmentTable::load(&path, 2);
        table.assign_channels(&["C00000001".to_string()]);

        assert!(table.remove("C00000001"));
        assert!(!table.remove("C00000001"));

        let reloaded = AssignmentTable::load(&path, 2);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn metadata_block_reflects_the_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_assignment.json");
        let mut table = AssignmentTable::load(&path, 3);
        table.assign_channels(&["C00000001".to_string()]);

        let raw = std::fs::read_to_string(&path).unwrap();
        let file: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(file["metadata"]["total_bots"], 3);
        assert_eq!(file["metadata"]["total_channels"], 1);
        assert_eq!(file["metadata"]["bot_ids"], serde_json::json!([1, 2, 3]));
    }
}
