//! The forwarding queue: normalized jobs on an append-only stream.
//!
//! Stream entries are flat string fields, so nested values (attachments,
//! files) travel JSON-encoded and booleans as `"1"`/`"0"`. Decoding is
//! lenient where the original payloads were: malformed nested fields fall
//! back to empty rather than poisoning the job.

use crate::categ::Category;
use crate::error::JobError;
use crate::state::{StateStore, StreamEntry};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Stream carrying normalized forward jobs.
pub const JOBS_STREAM: &str = "forwarding:jobs";

/// The single consumer group workers read through.
pub const WORKERS_GROUP: &str = "workers";

/// Approximate stream cap to bound growth.
pub const JOBS_MAXLEN: usize = 10_000;

/// What the worker should do with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Post,
    Update,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Post => "post",
            JobKind::Update => "update",
        }
    }
}

/// A normalized forwarding job. Written once by the winning listener,
/// consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct ForwardJob {
    pub kind: JobKind,
    pub category: Category,
    pub source_channel_id: String,
    pub source_channel_name: String,
    pub target_channel_id: String,
    pub user: String,
    pub source_ts: String,
    pub thread_ts: Option<String>,
    pub is_thread_reply: bool,
    pub text: String,
    pub attachments: Vec<serde_json::Value>,
    pub files: Vec<serde_json::Value>,
    /// Which bot received the event; the worker posts with this identity
    /// because it is guaranteed to be a member of the source channel.
    pub bot_id: u32,
}

impl ForwardJob {
    /// Encode into flat stream fields. `thread_ts` is omitted when absent.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("type".to_string(), self.kind.as_str().to_string()),
            ("category".to_string(), self.category.as_str().to_string()),
            (
                "source_channel_id".to_string(),
                self.source_channel_id.clone(),
            ),
            (
                "source_channel_name".to_string(),
                self.source_channel_name.clone(),
            ),
            (
                "target_channel_id".to_string(),
                self.target_channel_id.clone(),
            ),
            ("user".to_string(), self.user.clone()),
            ("ts".to_string(), self.source_ts.clone()),
            (
                "is_thread_reply".to_string(),
                if self.is_thread_reply { "1" } else { "0" }.to_string(),
            ),
            ("text".to_string(), self.text.clone()),
            (
                "attachments".to_string(),
                serde_json::to_string(&self.attachments).unwrap_or_else(|_| "[]".into()),
            ),
            (
                "files".to_string(),
                serde_json::to_string(&self.files).unwrap_or_else(|_| "[]".into()),
            ),
            ("bot_id".to_string(), self.bot_id.to_string()),
        ];
        if let Some(thread_ts) = &self.thread_ts {
            fields.push(("thread_ts".to_string(), thread_ts.clone()));
        }
        fields
    }

    /// Decode from stream fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, JobError> {
        let get = |name: &'static str| -> Result<String, JobError> {
            fields
                .get(name)
                .cloned()
                .ok_or(JobError::MissingField(name))
        };

        let kind = match fields.get("type").map(String::as_str) {
            Some("update") => JobKind::Update,
            // Posts are the default, matching what listeners have always
            // enqueued without an explicit type.
            Some("post") | None => JobKind::Post,
            Some(other) => {
                return Err(JobError::Invalid {
                    field: "type",
                    value: other.to_string(),
                });
            }
        };

        let category = fields
            .get("category")
            .and_then(|raw| Category::parse(raw))
            .unwrap_or(Category::Unknown);

        let thread_ts = fields.get("thread_ts").cloned().filter(|ts| !ts.is_empty());
        let is_thread_reply = matches!(
            fields.get("is_thread_reply").map(String::as_str),
            Some("1") | Some("true") | Some("True")
        );

        let bot_id = fields
            .get("bot_id")
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(1);

        Ok(Self {
            kind,
            category,
            source_channel_id: get("source_channel_id")?,
            source_channel_name: fields
                .get("source_channel_name")
                .cloned()
                .unwrap_or_default(),
            target_channel_id: get("target_channel_id")?,
            user: fields
                .get("user")
                .cloned()
                .unwrap_or_else(|| "unknown".into()),
            source_ts: get("ts")?,
            thread_ts,
            is_thread_reply,
            text: fields.get("text").cloned().unwrap_or_default(),
            attachments: parse_json_list(fields.get("attachments")),
            files: parse_json_list(fields.get("files")),
            bot_id,
        })
    }
}

fn parse_json_list(raw: Option<&String>) -> Vec<serde_json::Value> {
    raw.and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// Handle on the forwarding stream shared by listeners (push) and workers
/// (read/ack).
#[derive(Clone)]
pub struct JobQueue {
    state: Arc<dyn StateStore>,
}

impl JobQueue {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    /// Append a job. Returns the stream entry id.
    pub async fn push(&self, job: &ForwardJob) -> crate::Result<String> {
        let id = self
            .state
            .stream_append(JOBS_STREAM, &job.to_fields(), JOBS_MAXLEN)
            .await?;
        Ok(id)
    }

    /// Create the worker group if it does not exist yet.
    pub async fn ensure_group(&self) -> crate::Result<()> {
        self.state
            .stream_ensure_group(JOBS_STREAM, WORKERS_GROUP)
            .await?;
        Ok(())
    }

    /// Read the next batch for `consumer` (count ≤ 10, block ≤ 5 s).
    pub async fn read(&self, consumer: &str) -> crate::Result<Vec<StreamEntry>> {
        let entries = self
            .state
            .stream_read_group(
                JOBS_STREAM,
                WORKERS_GROUP,
                consumer,
                10,
                Duration::from_secs(5),
            )
            .await?;
        Ok(entries)
    }

    pub async fn ack(&self, entry_id: &str) -> crate::Result<()> {
        self.state
            .stream_ack(JOBS_STREAM, WORKERS_GROUP, entry_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryStore;
    use tokio_test::assert_ok;

    fn sample_job() -> ForwardJob {
        ForwardJob {
            kind: JobKind::Post,
            category: Category::ManagedAdmin,
            source_channel_id: "C123".into(),
            source_channel_name: "acme-admin".into(),
            target_channel_id: "CMASTER".into(),
            user: "U42".into(),
            source_ts: "1700000100.000100".into(),
            thread_ts: Some("1700000000.000100".into()),
            is_thread_reply: true,
            text: "deploy finished".into(),
            attachments: vec![serde_json::json!({"fallback": "File: report.pdf"})],
            files: Vec::new(),
            bot_id: 2,
        }
    }

    #[test]
    fn jobs_survive_the_flat_field_encoding() {
        let job = sample_job();
        let fields: HashMap<String, String> = job.to_fields().into_iter().collect();

        assert_eq!(fields["is_thread_reply"], "1");
        assert_eq!(fields["bot_id"], "2");

        let decoded = ForwardJob::from_fields(&fields).unwrap();
        assert_eq!(decoded.kind, JobKind::Post);
        assert_eq!(decoded.category, Category::ManagedAdmin);
        assert_eq!(decoded.thread_ts.as_deref(), Some("1700000000.000100"));
        assert!(decoded.is_thread_reply);
        assert_eq!(decoded.attachments.len(), 1);
        assert_eq!(decoded.bot_id, 2);
    }

    #[test]
    fn thread_ts_is_omitted_when_absent() {
        let mut job = sample_job();
        job.thread_ts = None;
        job.is_thread_reply = false;

        let fields: HashMap<String, String> = job.to_fields().into_iter().collect();
        assert!(!fields.contains_key("thread_ts"));

        let decoded = ForwardJob::from_fields(&fields).unwrap();
        assert_eq!(decoded.thread_ts, None);
        assert!(!decoded.is_thread_reply);
    }

    #[test]
    fn malformed_nested_fields_decode_to_empty() {
        let mut fields: HashMap<String, String> =
            sample_job().to_fields().into_iter().collect();
        fields.insert("attachments".into(), "{not json".into());
        fields.insert("bot_id".into(), "q".into());

        let decoded = ForwardJob::from_fields(&fields).unwrap();
        assert!(decoded.attachments.is_empty());
        assert_eq!(decoded.bot_id, 1);
    }

    #[test]
    fn missing_required_fields_fail_decoding() {
        let mut fields: HashMap<String, String> =
            sample_job().to_fields().into_iter().collect();
        fields.remove("target_channel_id");
        assert!(matches!(
            ForwardJob::from_fields(&fields),
            Err(JobError::MissingField("target_channel_id"))
        ));
    }

    #[tokio::test]
    async fn queue_round_trips_through_the_store() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone());
        queue.ensure_group().await.unwrap();

        let pushed_id = queue.push(&sample_job()).await.unwrap();
        let batch = queue.read("worker-test").await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, pushed_id);

        let decoded = ForwardJob::from_fields(&batch[0].fields).unwrap();
        assert_eq!(decoded.source_channel_id, "C123");

        assert_ok!(queue.ack(&batch[0].id).await);
        assert!(store.pending_ids(JOBS_STREAM, WORKERS_GROUP).is_empty());
    }
}
