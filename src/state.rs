//! Shared state store: cross-bot claims, ts mappings, and the job stream.
//!
//! The store provides the two primitives the rest of the pipeline relies on:
//! set-if-absent-with-expiry (FCFS claims) and consumer-group streams (the
//! forwarding queue). `redis::RedisStore` is the production backend;
//! `memory::MemoryStore` implements the same contract in-process and backs
//! the deduplication tests.

pub mod memory;
pub mod redis;

use crate::error::StateError;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// TTL for cross-bot FCFS claims.
pub const FCFS_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL for source-ts → master-ts mappings (message edits, thread parents).
pub const MAP_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Claim key for a new message event.
pub fn fcfs_msg_key(channel_id: &str, identifier: &str) -> String {
    format!("fcfs:msg:{channel_id}:{identifier}")
}

/// Claim key for an edit event.
pub fn fcfs_edit_key(channel_id: &str, identifier: &str) -> String {
    format!("fcfs:edit:{channel_id}:{identifier}")
}

/// Mapping from a forwarded source message to its master-channel copy.
pub fn map_msg_key(channel_id: &str, source_ts: &str) -> String {
    format!("map:msg:{channel_id}:{source_ts}")
}

/// Mapping from a source thread parent to its (possibly synthetic) master
/// copy.
pub fn map_parent_key(channel_id: &str, parent_ts: &str) -> String {
    format!("map:parent:{channel_id}:{parent_ts}")
}

/// One entry read from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Key/value plus append-only stream operations shared by all bots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomically set `key = value` with expiry, only if absent. Returns
    /// whether the caller became the owner.
    ///
    /// Callers on the ingest path treat `Err` as a won claim (fail-open):
    /// a duplicate forward under a store partition is preferred to a
    /// silently dropped message.
    async fn claim(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError>;

    async fn get_string(&self, key: &str) -> Result<Option<String>, StateError>;

    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError>;

    /// Append to a stream with approximate length capping. Returns the new
    /// entry id.
    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String, StateError>;

    /// Create a consumer group reading from the stream tail. Creating a
    /// group that already exists is not an error.
    async fn stream_ensure_group(&self, stream: &str, group: &str) -> Result<(), StateError>;

    /// Read up to `count` new entries for `consumer`, blocking up to
    /// `block`. Entries stay pending until acknowledged.
    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StateError>;

    async fn stream_ack(&self, stream: &str, group: &str, entry_id: &str)
        -> Result<(), StateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_namespaces_match_store_layout() {
        assert_eq!(fcfs_msg_key("C123", "abc"), "fcfs:msg:C123:abc");
        assert_eq!(fcfs_edit_key("C123", "abc"), "fcfs:edit:C123:abc");
        assert_eq!(
            map_msg_key("C123", "1700000000.0001"),
            "map:msg:C123:1700000000.0001"
        );
        assert_eq!(
            map_parent_key("C123", "1700000000.0001"),
            "map:parent:C123:1700000000.0001"
        );
    }
}
