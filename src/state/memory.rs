//! In-process state store implementing the same contract as the Redis
//! backend. Used by the deduplication and forwarding tests, including the
//! simulated-outage cases (`set_unreachable`).

use crate::error::StateError;
use crate::state::{StateStore, StreamEntry};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Group {
    /// Index of the next unread entry for this group.
    cursor: usize,
    pending: HashSet<String>,
}

#[derive(Default)]
struct Stream {
    next_seq: u64,
    entries: Vec<StreamEntry>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
pub struct MemoryStore {
    kv: Mutex<HashMap<String, (String, Option<Instant>)>>,
    streams: Mutex<HashMap<String, Stream>>,
    unreachable: AtomicBool,
    claims_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `StateError::Unavailable`, simulating
    /// a store partition.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail only claim calls, simulating a partition that hits the dedup
    /// path while the rest of the store still responds.
    pub fn set_claims_unavailable(&self, unavailable: bool) {
        self.claims_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), StateError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StateError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }

    /// All entries ever appended to `stream`, for assertions.
    pub fn stream_entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Unacknowledged entry ids for a group, for assertions.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                let mut ids: Vec<String> = g.pending.iter().cloned().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn claim(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError> {
        self.check_reachable()?;
        if self.claims_unavailable.load(Ordering::SeqCst) {
            return Err(StateError::Unavailable("simulated claim outage".into()));
        }
        let mut kv = self.kv.lock().unwrap();
        let now = Instant::now();
        kv.retain(|_, (_, expiry)| expiry.is_none_or(|at| at > now));
        if kv.contains_key(key) {
            return Ok(false);
        }
        kv.insert(key.to_string(), (value.to_string(), Some(now + ttl)));
        Ok(true)
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, StateError> {
        self.check_reachable()?;
        let kv = self.kv.lock().unwrap();
        let now = Instant::now();
        Ok(kv
            .get(key)
            .filter(|(_, expiry)| expiry.is_none_or(|at| at > now))
            .map(|(value, _)| value.clone()))
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError> {
        self.check_reachable()?;
        self.kv.lock().unwrap().insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        _maxlen: usize,
    ) -> Result<String, StateError> {
        self.check_reachable()?;
        let mut streams = self.streams.lock().unwrap();
        let entry_stream = streams.entry(stream.to_string()).or_default();
        entry_stream.next_seq += 1;
        let id = format!("{}-0", entry_stream.next_seq);
        entry_stream.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        });
        Ok(id)
    }

    async fn stream_ensure_group(&self, stream: &str, group: &str) -> Result<(), StateError> {
        self.check_reachable()?;
        let mut streams = self.streams.lock().unwrap();
        let entry_stream = streams.entry(stream.to_string()).or_default();
        let tail = entry_stream.entries.len();
        // Group starts at the tail, mirroring XGROUP CREATE `$`.
        entry_stream
            .groups
            .entry(group.to_string())
            .or_insert_with(|| Group {
                cursor: tail,
                pending: HashSet::new(),
            });
        Ok(())
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamEntry>, StateError> {
        self.check_reachable()?;
        let mut streams = self.streams.lock().unwrap();
        let entry_stream = streams.entry(stream.to_string()).or_default();
        let tail = entry_stream.entries.len();
        let group_state = entry_stream
            .groups
            .entry(group.to_string())
            .or_insert_with(|| Group {
                cursor: tail,
                pending: HashSet::new(),
            });

        let start = group_state.cursor;
        let end = (start + count).min(entry_stream.entries.len());
        group_state.cursor = end;

        let batch: Vec<StreamEntry> = entry_stream.entries[start..end].to_vec();
        for entry in &batch {
            group_state.pending.insert(entry.id.clone());
        }
        Ok(batch)
    }

    async fn stream_ack(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<(), StateError> {
        self.check_reachable()?;
        let mut streams = self.streams.lock().unwrap();
        if let Some(group_state) = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pending.remove(entry_id);
        }
        Ok(())
    }
}
