//! # Persistence Port
//!
//! The bus appends serializable payloads to a [`MessageStore`] when
//! persistence is enabled and can replay them per topic. Storage engines live
//! outside the bus; two adapters ship with it:
//!
//! - [`InMemoryMessageStore`]: process-local, for tests and embedding
//! - [`FileMessageStore`]: one JSON-lines file per topic under a directory

use async_trait::async_trait;
use bus_types::{BusError, Topic};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Position within the topic, starting at 0.
    pub sequence: u64,
    /// Publish time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// JSON-encoded payload.
    pub payload: Vec<u8>,
}

/// Stream of stored messages in append order.
pub type ReplayStream = BoxStream<'static, Result<StoredMessage, BusError>>;

/// Append/replay port (Driven Port).
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append an encoded payload to the topic's log.
    async fn append(&self, topic: &Topic, payload: Vec<u8>, timestamp: u64) -> Result<(), BusError>;

    /// Replay everything stored for `topic`.
    ///
    /// Unknown topics yield [`BusError::TopicNotFound`].
    async fn replay(&self, topic: &Topic) -> Result<ReplayStream, BusError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    topics: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages stored for `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Whether nothing has been stored at all.
    pub fn is_empty(&self) -> bool {
        self.topics.read().values().all(Vec::is_empty)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        topic: &Topic,
        payload: Vec<u8>,
        timestamp: u64,
    ) -> Result<(), BusError> {
        let mut topics = self.topics.write();
        let log = topics.entry(topic.to_string()).or_default();
        log.push(StoredMessage {
            topic: topic.to_string(),
            sequence: log.len() as u64,
            timestamp,
            payload,
        });
        Ok(())
    }

    async fn replay(&self, topic: &Topic) -> Result<ReplayStream, BusError> {
        let messages = self
            .topics
            .read()
            .get(topic.as_str())
            .cloned()
            .ok_or_else(|| BusError::TopicNotFound(topic.to_string()))?;
        Ok(stream::iter(messages.into_iter().map(Ok)).boxed())
    }
}

/// Line format of [`FileMessageStore`] logs.
#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    timestamp: u64,
    payload: serde_json::Value,
}

/// Store writing one `<topic>.jsonl` file per topic.
///
/// The directory is created on first append.
#[derive(Debug)]
pub struct FileMessageStore {
    directory: PathBuf,
    appended: AtomicU64,
    // Serialises appends so lines never interleave; guards "directory created".
    write_lock: tokio::sync::Mutex<bool>,
}

impl FileMessageStore {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            appended: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(false),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Messages appended through this instance.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    fn log_path(&self, topic: &Topic) -> PathBuf {
        self.directory.join(format!("{}.jsonl", topic.as_str()))
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn append(
        &self,
        topic: &Topic,
        payload: Vec<u8>,
        timestamp: u64,
    ) -> Result<(), BusError> {
        let payload: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|e| BusError::Persistence(format!("payload is not JSON: {e}")))?;
        let mut line = serde_json::to_vec(&LogLine { timestamp, payload })
            .map_err(|e| BusError::Persistence(e.to_string()))?;
        line.push(b'\n');

        let path = self.log_path(topic);
        let mut created = self.write_lock.lock().await;
        if !*created {
            tokio::fs::create_dir_all(&self.directory)
                .await
                .map_err(|e| BusError::Persistence(format!("{}: {e}", self.directory.display())))?;
            debug!(directory = %self.directory.display(), "Created message store directory");
            *created = true;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| BusError::Persistence(format!("{}: {e}", path.display())))?;
        file.write_all(&line)
            .await
            .map_err(|e| BusError::Persistence(format!("{}: {e}", path.display())))?;
        file.flush()
            .await
            .map_err(|e| BusError::Persistence(e.to_string()))?;

        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn replay(&self, topic: &Topic) -> Result<ReplayStream, BusError> {
        let path = self.log_path(topic);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BusError::TopicNotFound(topic.to_string()))
            }
            Err(e) => return Err(BusError::Persistence(format!("{}: {e}", path.display()))),
        };

        let topic = topic.to_string();
        let messages: Vec<Result<StoredMessage, BusError>> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(sequence, line)| {
                let parsed: LogLine = serde_json::from_str(line)
                    .map_err(|e| {
                        BusError::Persistence(format!("corrupt log line {sequence}: {e}"))
                    })?;
                let payload = serde_json::to_vec(&parsed.payload)
                    .map_err(|e| BusError::Persistence(e.to_string()))?;
                Ok(StoredMessage {
                    topic: topic.clone(),
                    sequence: sequence as u64,
                    timestamp: parsed.timestamp,
                    payload,
                })
            })
            .collect();
        Ok(stream::iter(messages).boxed())
    }
}
