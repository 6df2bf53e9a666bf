//! Channel categorization: which master channel a source channel feeds.
//!
//! Categories are derived from the channel name suffix plus three sets of
//! names produced by the external categorization job and persisted at
//! `data/channel_lists.json`. The snapshot is swapped atomically so
//! listeners pick up a refresh without locking the hot path.

use crate::error::{ConfigError, Result};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Channel names that are never forwarded regardless of categorization.
pub const ALWAYS_IGNORED: &[&str] = &[
    "ccdocs-agents",
    "ccdocs-admin",
    "ccdocs-apptbk",
    "ccdocs-dialer",
    "building-universal-agents",
    "master-agent",
    "master-admin-storm",
];

/// Source channel category. Determines the destination master channel;
/// `Ignored` and `Unknown` are dropped at ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ManagedAdmin,
    StormAdmin,
    Agent,
    Apptbk,
    Ignored,
    Unknown,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::ManagedAdmin => "managed_admin",
            Category::StormAdmin => "storm_admin",
            Category::Agent => "agent",
            Category::Apptbk => "apptbk",
            Category::Ignored => "ignored",
            Category::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "managed_admin" => Some(Category::ManagedAdmin),
            "storm_admin" => Some(Category::StormAdmin),
            "agent" => Some(Category::Agent),
            "apptbk" => Some(Category::Apptbk),
            "ignored" => Some(Category::Ignored),
            "unknown" => Some(Category::Unknown),
            _ => None,
        }
    }

    /// Whether events in this category are forwarded at all.
    pub fn is_forwarded(self) -> bool {
        !matches!(self, Category::Ignored | Category::Unknown)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three disjoint name sets yielded by the categorization provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelLists {
    #[serde(default)]
    pub managed_channels: HashSet<String>,
    #[serde(default)]
    pub storm_channels: HashSet<String>,
    #[serde(default)]
    pub ignored_channels: HashSet<String>,
}

impl ChannelLists {
    /// Fallback used when no lists file has been written yet.
    fn bootstrap() -> Self {
        Self {
            managed_channels: HashSet::new(),
            storm_channels: HashSet::new(),
            ignored_channels: ["ccdocs-admin", "test-admins"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        let lists = serde_json::from_str(&raw)
            .map_err(|error| ConfigError::Invalid(format!("{}: {error}", path.display())))?;
        Ok(lists)
    }
}

/// Hot-swappable categorization snapshot.
pub struct CategorizationCache {
    lists: ArcSwap<ChannelLists>,
    path: PathBuf,
}

impl CategorizationCache {
    /// Load from the lists file, falling back to the bootstrap sets when
    /// the file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lists = match ChannelLists::load(&path) {
            Ok(lists) => lists,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "channel lists unavailable, using bootstrap categorizations"
                );
                ChannelLists::bootstrap()
            }
        };
        Self {
            lists: ArcSwap::from_pointee(lists),
            path,
        }
    }

    /// Re-read the lists file in place. Keeps the current snapshot when the
    /// file is unreadable.
    pub fn reload(&self) -> Result<()> {
        let lists = ChannelLists::load(&self.path)?;
        self.replace(lists);
        Ok(())
    }

    /// Swap in a fresh snapshot (scheduler refresh).
    pub fn replace(&self, lists: ChannelLists) {
        tracing::info!(
            managed = lists.managed_channels.len(),
            storm = lists.storm_channels.len(),
            ignored = lists.ignored_channels.len(),
            "categorization snapshot updated"
        );
        self.lists.store(Arc::new(lists));
    }

    pub fn snapshot(&self) -> Arc<ChannelLists> {
        self.lists.load_full()
    }

    /// Categorize a channel by name.
    pub fn classify(&self, channel_name: &str) -> Category {
        let lists = self.lists.load();

        if ALWAYS_IGNORED.contains(&channel_name)
            || lists.ignored_channels.contains(channel_name)
        {
            return Category::Ignored;
        }

        if channel_name.ends_with("-apptbk") {
            return Category::Apptbk;
        }

        if channel_name.ends_with("-admin") || channel_name.ends_with("-admins") {
            if lists.managed_channels.contains(channel_name) {
                return Category::ManagedAdmin;
            }
            if lists.storm_channels.contains(channel_name) {
                return Category::StormAdmin;
            }
            // Admin channel the categorization job hasn't claimed yet.
            return Category::Unknown;
        }

        if channel_name.ends_with("-agent") || channel_name.ends_with("-agents") {
            return Category::Agent;
        }

        Category::Unknown
    }
}

/// The external job that produces the three name sets. The real
/// implementation matches channels against the task-management system; the
/// relay only depends on this interface.
#[async_trait::async_trait]
pub trait CategorizationProvider: Send + Sync {
    async fn refresh(&self) -> Result<ChannelLists>;
}

/// Provider that re-yields the sets already on disk. Stands in for the
/// external categorization job when it runs out of process.
pub struct StaticListsProvider {
    path: PathBuf,
}

impl StaticListsProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl CategorizationProvider for StaticListsProvider {
    async fn refresh(&self) -> Result<ChannelLists> {
        match ChannelLists::load(&self.path) {
            Ok(lists) => Ok(lists),
            Err(_) => Ok(ChannelLists::bootstrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(managed: &[&str], storm: &[&str], ignored: &[&str]) -> CategorizationCache {
        let cache = CategorizationCache::load("/nonexistent/channel_lists.json");
        cache.replace(ChannelLists {
            managed_channels: managed.iter().map(|s| s.to_string()).collect(),
            storm_channels: storm.iter().map(|s| s.to_string()).collect(),
            ignored_channels: ignored.iter().map(|s| s.to_string()).collect(),
        });
        cache
    }

    #[test]
    fn hardcoded_ignore_list_wins_over_everything() {
        let cache = cache_with(&["ccdocs-admin"], &[], &[]);
        assert_eq!(cache.classify("ccdocs-admin"), Category::Ignored);
        assert_eq!(cache.classify("master-agent"), Category::Ignored);
    }

    #[test]
    fn ignored_set_beats_suffix_rules() {
        let cache = cache_with(&[], &[], &["acme-admin", "acme-apptbk"]);
        assert_eq!(cache.classify("acme-admin"), Category::Ignored);
        assert_eq!(cache.classify("acme-apptbk"), Category::Ignored);
    }

    #[test]
    fn admin_suffix_resolves_through_the_sets() {
        let cache = cache_with(&["acme-admin"], &["rainy-admins"], &[]);
        assert_eq!(cache.classify("acme-admin"), Category::ManagedAdmin);
        assert_eq!(cache.classify("rainy-admins"), Category::StormAdmin);
        // Admin channel in neither set is dropped.
        assert_eq!(cache.classify("orphan-admin"), Category::Unknown);
    }

    #[test]
    fn suffix_rules_cover_agents_and_apptbk() {
        let cache = cache_with(&[], &[], &[]);
        assert_eq!(cache.classify("acme-agent"), Category::Agent);
        assert_eq!(cache.classify("acme-agents"), Category::Agent);
        assert_eq!(cache.classify("acme-apptbk"), Category::Apptbk);
        assert_eq!(cache.classify("random-channel"), Category::Unknown);
    }

    #[test]
    fn missing_file_bootstraps_default_ignores() {
        let cache = CategorizationCache::load("/nonexistent/channel_lists.json");
        assert_eq!(cache.classify("test-admins"), Category::Ignored);
    }

    #[test]
    fn lists_round_trip_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_lists.json");
        let lists = ChannelLists {
            managed_channels: ["acme-admin".to_string()].into_iter().collect(),
            storm_channels: HashSet::new(),
            ignored_channels: HashSet::new(),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&lists).unwrap()).unwrap();

        let cache = CategorizationCache::load(&path);
        assert_eq!(cache.classify("acme-admin"), Category::ManagedAdmin);

        // A rewrite is picked up on reload.
        let updated = ChannelLists {
            storm_channels: ["acme-admin".to_string()].into_iter().collect(),
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&updated).unwrap()).unwrap();
        cache.reload().unwrap();
        assert_eq!(cache.classify("acme-admin"), Category::StormAdmin);
    }
}
