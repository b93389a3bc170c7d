//! Platform collaborators of the chat engine: the backend document store,
//! file storage, the local key-value store, the realtime channel, and the
//! connectivity signal.
//!
//! The traits are the seams a real backend adapter plugs into; the in-memory
//! implementations here are complete enough to back the engine in tests and
//! the smoke app, including failure and latency injection.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use chat_core::{ChatError, ChatErrorCategory, ConversationSummary, Message};

const DEFAULT_REALTIME_CAPACITY: usize = 64;

/// Document store holding the messages and conversations collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist one message document; returns the server-assigned id.
    async fn create_message(&self, message: &Message) -> Result<String, ChatError>;

    /// Most recent messages of a conversation, newest-first, at most `limit`.
    async fn list_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError>;

    /// Overwrite the conversation-summary document.
    async fn update_summary(&self, summary: &ConversationSummary) -> Result<(), ChatError>;
}

/// File storage that turns a local media resource into a durable URL.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Upload a local resource; failure is retryable.
    async fn upload(&self, local_path: &str) -> Result<String, ChatError>;
}

/// Local persistent key-value store backing the message cache.
///
/// The cache is non-authoritative, so reads are infallible (`None` covers
/// both miss and corruption at this layer) and write failures surface as
/// errors the caller logs rather than propagates.
pub trait KeyValueStore: Send + Sync {
    /// Read one value.
    fn get(&self, key: &str) -> Option<String>;
    /// Write one value, overwriting wholesale.
    fn set(&self, key: &str, value: &str) -> Result<(), ChatError>;
}

/// Realtime channel delivering message-creation events with full payloads.
///
/// Consumers filter client-side by conversation and sender. Events are
/// assumed delivered in creation order by the transport.
#[derive(Clone, Debug)]
pub struct RealtimeHub {
    tx: broadcast::Sender<Message>,
}

impl RealtimeHub {
    /// Hub with the given subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to message-creation events.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    /// Publish one creation event to all subscribers, best-effort.
    pub fn publish(&self, message: Message) {
        let _ = self.tx.send(message);
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(DEFAULT_REALTIME_CAPACITY)
    }
}

/// Connectivity signal emitting connected/disconnected transitions.
///
/// Only edges are published; setting the current state again is a no-op.
/// The engine reacts to the disconnected-to-connected edge by draining its
/// retry queue.
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    connected: Arc<AtomicBool>,
    tx: broadcast::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Monitor starting in the given state.
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _) = broadcast::channel(8);
        Self {
            connected: Arc::new(AtomicBool::new(initially_connected)),
            tx,
        }
    }

    /// Current connectivity state.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to connectivity transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Record a state change, publishing only on an actual edge.
    pub fn set_connected(&self, connected: bool) {
        let previous = self.connected.swap(connected, Ordering::SeqCst);
        if previous != connected {
            let _ = self.tx.send(connected);
        }
    }
}

fn lock_poisoned() -> ChatError {
    ChatError::new(
        ChatErrorCategory::Internal,
        "lock_poisoned",
        "in-memory store lock poisoned",
    )
}

fn store_offline() -> ChatError {
    ChatError::network("store_offline", "document store is unreachable")
}

#[derive(Debug, Default)]
struct DocumentStoreInner {
    messages: Vec<Message>,
    summaries: HashMap<String, ConversationSummary>,
    next_id: u64,
}

/// In-memory document store with offline and latency injection.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    inner: Arc<Mutex<DocumentStoreInner>>,
    offline: Arc<AtomicBool>,
    fail_summary: Arc<AtomicBool>,
    list_delay: Arc<Mutex<Option<Duration>>>,
    realtime: Option<RealtimeHub>,
}

impl InMemoryDocumentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that publishes every created message to `hub`, mimicking a
    /// backend whose realtime channel echoes document creation.
    pub fn with_realtime(hub: RealtimeHub) -> Self {
        Self {
            realtime: Some(hub),
            ..Self::default()
        }
    }

    /// Make every operation fail with a transient network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make only `update_summary` fail, leaving message creation working.
    pub fn set_fail_summary(&self, fail: bool) {
        self.fail_summary.store(fail, Ordering::SeqCst);
    }

    /// Delay `list_recent` responses, for cache-first rendering tests.
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.list_delay.lock() {
            *guard = delay;
        }
    }

    /// Seed a persisted message directly, bypassing the send path.
    pub fn seed_message(&self, mut message: Message) {
        if let Ok(mut inner) = self.inner.lock() {
            if message.id.remote.is_none() {
                inner.next_id += 1;
                message.id.remote = Some(format!("srv-{}", inner.next_id));
            }
            inner.messages.push(message);
        }
    }

    /// Count of persisted messages across all conversations.
    pub fn message_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.messages.len()).unwrap_or(0)
    }

    /// Latest summary recorded for a conversation.
    pub fn summary(&self, conversation_id: &str) -> Option<ConversationSummary> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.summaries.get(conversation_id).cloned())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create_message(&self, message: &Message) -> Result<String, ChatError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(store_offline());
        }

        let (stored, remote_id) = {
            let mut inner = self.inner.lock().map_err(|_| lock_poisoned())?;
            inner.next_id += 1;
            let remote_id = format!("srv-{}", inner.next_id);
            let mut stored = message.clone();
            stored.id.remote = Some(remote_id.clone());
            stored.state = chat_core::DeliveryState::Sent;
            inner.messages.push(stored.clone());
            (stored, remote_id)
        };

        if let Some(hub) = &self.realtime {
            hub.publish(stored);
        }
        Ok(remote_id)
    }

    async fn list_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        let delay = self.list_delay.lock().ok().and_then(|guard| *guard);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(store_offline());
        }

        let inner = self.inner.lock().map_err(|_| lock_poisoned())?;
        let mut matching: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        matching.truncate(limit.max(1));
        Ok(matching)
    }

    async fn update_summary(&self, summary: &ConversationSummary) -> Result<(), ChatError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(store_offline());
        }
        if self.fail_summary.load(Ordering::SeqCst) {
            return Err(ChatError::new(
                ChatErrorCategory::Storage,
                "summary_write_failed",
                "conversation summary write rejected",
            ));
        }

        let mut inner = self.inner.lock().map_err(|_| lock_poisoned())?;
        inner
            .summaries
            .insert(summary.conversation_id.clone(), summary.clone());
        Ok(())
    }
}

/// In-memory file storage that mints durable URLs and counts uploads.
#[derive(Clone, Default)]
pub struct InMemoryFileStorage {
    uploads: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl InMemoryFileStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make uploads fail with a transient network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful uploads, for retry-replay assertions.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileStorage for InMemoryFileStorage {
    async fn upload(&self, local_path: &str) -> Result<String, ChatError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChatError::network(
                "upload_failed",
                "file storage is unreachable",
            ));
        }

        let slug: String = local_path
            .trim_start_matches("file://")
            .trim_start_matches('/')
            .replace('/', "-");
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("https://files.example/{n}-{slug}"))
    }
}

/// In-memory key-value store with write-failure injection.
#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<Mutex<HashMap<String, String>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryKeyValueStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail; reads keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ChatError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatError::new(
                ChatErrorCategory::Storage,
                "cache_write_failed",
                "key-value store rejected the write",
            ));
        }
        let mut data = self.data.lock().map_err(|_| lock_poisoned())?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Key-value store persisted as one JSON object on disk.
///
/// The whole map is rewritten on every `set`; values are small bounded
/// snapshots, so the simplicity wins over incremental writes. A missing or
/// corrupt file loads as empty.
pub struct JsonFileKeyValueStore {
    path: PathBuf,
    data: Mutex<HashMap<String, String>>,
}

impl JsonFileKeyValueStore {
    /// Open the store at `path`, loading any existing content.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            data: Mutex::new(data),
        }
    }
}

impl KeyValueStore for JsonFileKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ChatError> {
        let mut data = self.data.lock().map_err(|_| lock_poisoned())?;
        data.insert(key.to_owned(), value.to_owned());
        let encoded = serde_json::to_string(&*data).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Serialization,
                "cache_encode_failed",
                err.to_string(),
            )
        })?;
        fs::write(&self.path, encoded).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Storage,
                "cache_write_failed",
                err.to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::{DeliveryState, MessageContent, MessageId};

    fn message(local: &str, conversation_id: &str, created_at_ms: u64) -> Message {
        Message {
            id: MessageId::local_only(local),
            conversation_id: conversation_id.to_owned(),
            sender_id: "alice".to_owned(),
            receiver_id: "bob".to_owned(),
            content: MessageContent::Text {
                body: local.to_owned(),
            },
            created_at_ms,
            state: DeliveryState::Sending,
        }
    }

    #[tokio::test]
    async fn create_assigns_server_ids_and_lists_newest_first() {
        let store = InMemoryDocumentStore::new();
        store
            .create_message(&message("a", "c1", 100))
            .await
            .expect("create a");
        let id_b = store
            .create_message(&message("b", "c1", 300))
            .await
            .expect("create b");
        store
            .create_message(&message("other", "c2", 200))
            .await
            .expect("create in other conversation");

        assert_eq!(id_b, "srv-2");

        let recent = store.list_recent("c1", 10).await.expect("list");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id.local, "b");
        assert_eq!(recent[0].state, DeliveryState::Sent);
        assert_eq!(recent[1].id.local, "a");
    }

    #[tokio::test]
    async fn offline_store_fails_every_operation_with_network_error() {
        let store = InMemoryDocumentStore::new();
        store.set_offline(true);

        let err = store
            .create_message(&message("a", "c1", 100))
            .await
            .expect_err("create must fail offline");
        assert!(err.is_retryable());
        assert_eq!(err.code, "store_offline");

        let err = store
            .list_recent("c1", 10)
            .await
            .expect_err("list must fail offline");
        assert_eq!(err.code, "store_offline");
    }

    #[tokio::test]
    async fn summary_failure_is_injectable_separately_from_create() {
        let store = InMemoryDocumentStore::new();
        store.set_fail_summary(true);

        store
            .create_message(&message("a", "c1", 100))
            .await
            .expect("create still works");

        let summary = ConversationSummary {
            conversation_id: "c1".to_owned(),
            participants: ["alice".to_owned(), "bob".to_owned()],
            last_preview: "a".to_owned(),
            last_message_ms: 100,
        };
        let err = store
            .update_summary(&summary)
            .await
            .expect_err("summary write must fail");
        assert!(err.is_retryable());
        assert_eq!(err.code, "summary_write_failed");

        store.set_fail_summary(false);
        store.update_summary(&summary).await.expect("summary works again");
        assert_eq!(store.summary("c1"), Some(summary));
    }

    #[tokio::test]
    async fn create_publishes_to_attached_realtime_hub() {
        let hub = RealtimeHub::default();
        let mut rx = hub.subscribe();
        let store = InMemoryDocumentStore::with_realtime(hub);

        store
            .create_message(&message("a", "c1", 100))
            .await
            .expect("create");

        let event = rx.recv().await.expect("hub should deliver the creation");
        assert_eq!(event.id.local, "a");
        assert_eq!(event.id.remote.as_deref(), Some("srv-1"));
    }

    #[tokio::test]
    async fn connectivity_monitor_publishes_only_edges() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        monitor.set_connected(false); // no edge
        monitor.set_connected(true);
        monitor.set_connected(true); // no edge

        let edge = rx.recv().await.expect("edge should be delivered");
        assert!(edge);
        assert!(rx.try_recv().is_err(), "repeated states must not re-emit");
        assert!(monitor.is_connected());
    }

    #[tokio::test]
    async fn file_storage_counts_uploads_and_fails_offline() {
        let files = InMemoryFileStorage::new();
        let url = files.upload("file:///photos/a.jpg").await.expect("upload");
        assert!(url.starts_with("https://files.example/"));
        assert_eq!(files.upload_count(), 1);

        files.set_offline(true);
        let err = files
            .upload("file:///photos/b.jpg")
            .await
            .expect_err("offline upload must fail");
        assert!(err.is_retryable());
        assert_eq!(files.upload_count(), 1);
    }

    #[test]
    fn json_file_store_survives_reopen_and_tolerates_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");

        let kv = JsonFileKeyValueStore::open(&path);
        assert_eq!(kv.get("chat-cache:c1"), None);
        kv.set("chat-cache:c1", "[1,2,3]").expect("write");
        drop(kv);

        let reopened = JsonFileKeyValueStore::open(&path);
        assert_eq!(reopened.get("chat-cache:c1").as_deref(), Some("[1,2,3]"));

        std::fs::write(&path, "{not json").expect("corrupt the file");
        let corrupt = JsonFileKeyValueStore::open(&path);
        assert_eq!(corrupt.get("chat-cache:c1"), None, "corrupt file loads empty");
        corrupt.set("k", "v").expect("store recovers on next write");
    }

    #[test]
    fn key_value_store_write_failure_is_injectable() {
        let kv = InMemoryKeyValueStore::new();
        kv.set("k", "v").expect("write should work");
        assert_eq!(kv.get("k").as_deref(), Some("v"));

        kv.set_fail_writes(true);
        let err = kv.set("k", "v2").expect_err("write must fail");
        assert_eq!(err.code, "cache_write_failed");
        assert_eq!(kv.get("k").as_deref(), Some("v"), "old value survives");
    }
}
