use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use chat_core::{
    cache_key, decode_cached, encode_bounded, ChatCommand, ChatError, ChatErrorCategory,
    ChatEvent, ConversationSummary, DeliveryState, MediaSource, MergeError, Message,
    MessageContent, MessageId, MessageLog, RetryEntry, RetryQueue, SendRequest,
};
use chat_platform::{ConnectivityMonitor, DocumentStore, FileStorage, KeyValueStore, RealtimeHub};

/// Collaborators and tuning shared by every session, owned by the
/// composition root.
pub struct EngineContext {
    /// Backend document store (messages + conversations collections).
    pub documents: Arc<dyn DocumentStore>,
    /// File storage for outbound media.
    pub files: Arc<dyn FileStorage>,
    /// Local persistent key-value store backing the message cache.
    pub cache: Arc<dyn KeyValueStore>,
    /// Realtime message-creation feed.
    pub realtime: RealtimeHub,
    /// Connectivity signal; the engine reacts to the reconnect edge.
    pub connectivity: ConnectivityMonitor,
    /// Current user id, used for realtime self-exclusion.
    pub user_id: String,
    /// Cache retention cap per conversation.
    pub cache_cap: usize,
    /// Limit for the initial remote fetch.
    pub fetch_limit: usize,
}

#[derive(Default)]
struct SessionInner {
    log: MessageLog,
    retry: RetryQueue,
    /// Realtime events that arrived before the initial fetch settled.
    buffered_realtime: Vec<Message>,
    /// Timestamp of the newest send whose summary write succeeded.
    last_summary_ms: Option<u64>,
    fetch_settled: bool,
    closed: bool,
}

struct Shared {
    ctx: Arc<EngineContext>,
    conversation_id: String,
    peer_id: String,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<ChatEvent>,
    cancel: CancellationToken,
}

/// One open conversation view.
///
/// Opening hydrates the cached snapshot immediately, then lets the remote
/// fetch replace it and the realtime stream extend it. All completions check
/// the session's `closed` flag before touching shared state, so in-flight
/// work at teardown cannot corrupt a conversation no longer displayed.
pub struct ConversationSession {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversationSession {
    /// Open a conversation: hydrate from cache, start the realtime
    /// subscription, issue the initial fetch, and watch connectivity.
    ///
    /// Must be called within a tokio runtime.
    pub fn open(
        ctx: Arc<EngineContext>,
        conversation_id: impl Into<String>,
        peer_id: impl Into<String>,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            ctx,
            conversation_id: conversation_id.into(),
            peer_id: peer_id.into(),
            inner: Mutex::new(SessionInner::default()),
            events,
            cancel: CancellationToken::new(),
        });

        shared.hydrate_from_cache();

        // Both subscriptions are taken here, not inside the spawned tasks,
        // so events racing the open cannot slip past an unsubscribed
        // receiver. The realtime subscription in particular must exist
        // before the fetch so racing events are buffered rather than lost.
        let realtime_rx = shared.ctx.realtime.subscribe();
        let connectivity_rx = shared.ctx.connectivity.subscribe();
        let tasks = vec![
            tokio::spawn(Arc::clone(&shared).run_realtime(realtime_rx)),
            tokio::spawn(Arc::clone(&shared).run_initial_fetch()),
            tokio::spawn(Arc::clone(&shared).run_connectivity(connectivity_rx)),
        ];

        Self {
            shared,
            tasks: Mutex::new(tasks),
        }
    }

    /// Conversation id this session targets.
    pub fn conversation_id(&self) -> &str {
        &self.shared.conversation_id
    }

    /// Current messages, newest-first.
    pub fn messages(&self) -> Vec<Message> {
        self.shared.lock().log.items().to_vec()
    }

    /// Number of sends waiting for a reconnect.
    pub fn retry_len(&self) -> usize {
        self.shared.lock().retry.len()
    }

    /// Run the outbound send pipeline.
    ///
    /// Invalid input is rejected before any optimistic state exists; every
    /// failure past that point is converted into per-message `Error` state
    /// and a retry entry, never an `Err` to the caller.
    pub async fn send(&self, request: SendRequest) -> Result<(), ChatError> {
        request.validate()?;
        if self.shared.lock().closed {
            return Err(ChatError::new(
                ChatErrorCategory::Internal,
                "session_closed",
                "cannot send on a closed session",
            ));
        }

        let local_id = Uuid::new_v4().to_string();
        let created_at_ms = now_ms();
        let content = optimistic_content(&request.text, &request.media)?;

        // Optimistic insert is visible before any collaborator I/O.
        {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(ChatError::new(
                    ChatErrorCategory::Internal,
                    "session_closed",
                    "cannot send on a closed session",
                ));
            }
            let optimistic = Message {
                id: MessageId::local_only(local_id.clone()),
                conversation_id: self.shared.conversation_id.clone(),
                sender_id: self.shared.ctx.user_id.clone(),
                receiver_id: self.shared.peer_id.clone(),
                content,
                created_at_ms,
                state: DeliveryState::Sending,
            };
            if let Err(err) = inner.log.prepend(optimistic) {
                warn!(%local_id, %err, "optimistic insert rejected");
            }
        }
        self.shared.save_cache();
        self.shared
            .emit_state(&local_id, DeliveryState::Sending, None);
        self.shared.emit_snapshot();

        self.shared
            .dispatch(local_id, created_at_ms, request.text, request.media)
            .await;
        Ok(())
    }

    /// Tear the session down: cancel the realtime subscription and the
    /// watcher tasks, and discard any late completions.
    pub async fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        debug!(conversation_id = %self.shared.conversation_id, "session closed");
    }

    /// Drive the session from a command channel until `Close` or channel
    /// shutdown, then tear down.
    pub async fn run(self, mut commands: mpsc::Receiver<ChatCommand>) {
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(ChatCommand::Send(request)) => {
                        if let Err(err) = self.send(request).await {
                            self.shared.emit(ChatEvent::SendRejected {
                                code: err.code,
                                message: err.message,
                            });
                        }
                    }
                    Some(ChatCommand::Close) | None => break,
                },
            }
        }
        self.close().await;
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn emit_snapshot(&self) {
        let messages = self.lock().log.items().to_vec();
        self.emit(ChatEvent::Snapshot {
            conversation_id: self.conversation_id.clone(),
            messages,
        });
    }

    fn emit_state(&self, local_id: &str, state: DeliveryState, remote_id: Option<String>) {
        self.emit(ChatEvent::MessageState {
            conversation_id: self.conversation_id.clone(),
            local_id: local_id.to_owned(),
            state,
            remote_id,
        });
    }

    /// Best-effort cache write; the cache is non-authoritative, so failures
    /// are logged and swallowed.
    fn save_cache(&self) {
        let messages = self.lock().log.items().to_vec();
        let encoded = match encode_bounded(&messages, self.ctx.cache_cap) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(%err, "cache encode failed");
                return;
            }
        };
        if let Err(err) = self
            .ctx
            .cache
            .set(&cache_key(&self.conversation_id), &encoded)
        {
            warn!(%err, "cache save failed");
        }
    }

    fn hydrate_from_cache(&self) {
        let cached = self
            .ctx
            .cache
            .get(&cache_key(&self.conversation_id))
            .map(|raw| decode_cached(&raw))
            .unwrap_or_default();
        trace!(
            conversation_id = %self.conversation_id,
            count = cached.len(),
            "hydrated from cache"
        );
        self.lock().log.replace(cached);
        self.emit_snapshot();
    }

    async fn run_initial_fetch(self: Arc<Self>) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self
                .ctx
                .documents
                .list_recent(&self.conversation_id, self.ctx.fetch_limit) => result,
        };

        match result {
            Ok(snapshot) => {
                {
                    let mut inner = self.lock();
                    if inner.closed {
                        return;
                    }
                    inner.log.replace(snapshot);
                    let fetch_head = inner.log.latest_ms();
                    let buffered = std::mem::take(&mut inner.buffered_realtime);
                    let applied = inner.log.reapply_buffered(buffered, fetch_head);
                    inner.fetch_settled = true;
                    if applied > 0 {
                        trace!(applied, "re-applied realtime events buffered during fetch");
                    }
                }
                self.save_cache();
                self.emit_snapshot();
            }
            Err(err) => {
                // Local-first degradation: the cached view stays up and
                // buffered realtime events land on top of it.
                warn!(code = %err.code, "initial fetch failed; keeping cached view");
                let applied = {
                    let mut inner = self.lock();
                    if inner.closed {
                        return;
                    }
                    inner.fetch_settled = true;
                    let buffered = std::mem::take(&mut inner.buffered_realtime);
                    let mut applied = 0;
                    for message in buffered {
                        if inner.log.prepend(message).is_ok() {
                            applied += 1;
                        }
                    }
                    applied
                };
                if applied > 0 {
                    self.save_cache();
                    self.emit_snapshot();
                }
            }
        }
    }

    async fn run_realtime(self: Arc<Self>, mut rx: broadcast::Receiver<Message>) {
        enum Outcome {
            Applied,
            Buffered,
            Duplicate,
            Closed,
        }

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            // Self-originated messages are already visible via the
            // optimistic path.
            if message.conversation_id != self.conversation_id
                || message.sender_id == self.ctx.user_id
            {
                continue;
            }

            let outcome = {
                let mut inner = self.lock();
                if inner.closed {
                    Outcome::Closed
                } else if !inner.fetch_settled {
                    inner.buffered_realtime.push(message);
                    Outcome::Buffered
                } else {
                    match inner.log.prepend(message) {
                        Ok(()) => Outcome::Applied,
                        Err(_) => Outcome::Duplicate,
                    }
                }
            };

            match outcome {
                Outcome::Closed => break,
                Outcome::Applied => {
                    self.save_cache();
                    self.emit_snapshot();
                }
                Outcome::Buffered => trace!("buffered realtime event until fetch settles"),
                Outcome::Duplicate => trace!("dropped duplicate realtime event"),
            }
        }
    }

    async fn run_connectivity(self: Arc<Self>, mut rx: broadcast::Receiver<bool>) {
        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(connected) => connected,
                    Err(RecvError::Lagged(_)) => self.ctx.connectivity.is_connected(),
                    Err(RecvError::Closed) => break,
                },
            };
            if connected {
                self.drain_retries().await;
            }
        }
    }

    /// Replay queued failed sends after a reconnect edge.
    ///
    /// The queue is cleared before dispatch so a redispatch failure
    /// re-enqueues without racing this loop.
    async fn drain_retries(self: &Arc<Self>) {
        let entries = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.retry.drain()
        };
        if entries.is_empty() {
            return;
        }

        debug!(count = entries.len(), "connectivity restored; draining retry queue");

        let mut dispatched = 0;
        for entry in entries {
            if !self.reenter_sending(&entry) {
                continue;
            }
            self.emit_state(&entry.local_id, DeliveryState::Sending, None);
            self.dispatch(
                entry.local_id,
                entry.created_at_ms,
                entry.text,
                entry.media,
            )
            .await;
            dispatched += 1;
        }

        self.emit(ChatEvent::RetryDrained { dispatched });
    }

    /// Move a retried message back to `Sending`, rebuilding the optimistic
    /// entry if a fetch replace dropped it from the log.
    fn reenter_sending(&self, entry: &RetryEntry) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        match inner.log.mark(&entry.local_id, DeliveryState::Sending) {
            Ok(()) => true,
            Err(MergeError::UnknownMessage(_)) => {
                let content = match optimistic_content(&entry.text, &entry.media) {
                    Ok(content) => content,
                    Err(err) => {
                        warn!(local_id = %entry.local_id, %err, "retry entry has no content");
                        return false;
                    }
                };
                let rebuilt = Message {
                    id: MessageId::local_only(entry.local_id.clone()),
                    conversation_id: self.conversation_id.clone(),
                    sender_id: self.ctx.user_id.clone(),
                    receiver_id: entry.receiver_id.clone(),
                    content,
                    created_at_ms: entry.created_at_ms,
                    state: DeliveryState::Sending,
                };
                inner.log.prepend(rebuilt).is_ok()
            }
            Err(err) => {
                warn!(local_id = %entry.local_id, %err, "retry re-entry rejected");
                false
            }
        }
    }

    /// Steps 2-6 of the send pipeline for one attempt with a fixed temp id.
    async fn dispatch(
        self: &Arc<Self>,
        local_id: String,
        created_at_ms: u64,
        text: Option<String>,
        media: Option<MediaSource>,
    ) {
        // Media is resolved to a durable URL first, so a failure in the
        // persistence steps retries without replaying the upload.
        let content = match self.resolve_content(&text, media.clone()).await {
            Ok(content) => content,
            Err(err) => {
                self.fail_send(&local_id, created_at_ms, text, media, err);
                return;
            }
        };
        let retry_media = match &content {
            MessageContent::Image { url } => Some(MediaSource::Remote(url.clone())),
            MessageContent::Text { .. } => None,
        };

        match self.persist(&local_id, created_at_ms, content).await {
            Ok((remote_id, summary)) => {
                let confirmed = {
                    let mut inner = self.lock();
                    if inner.closed {
                        return;
                    }
                    inner.log.confirm(&local_id, remote_id.clone())
                };
                if let Err(err) = confirmed {
                    warn!(%local_id, %err, "confirmation did not match an optimistic entry");
                }
                self.save_cache();
                self.emit_state(&local_id, DeliveryState::Sent, Some(remote_id));
                if let Some(summary) = summary {
                    self.emit(ChatEvent::SummaryUpdated(summary));
                }
                self.emit_snapshot();
            }
            Err(err) => self.fail_send(&local_id, created_at_ms, text, retry_media, err),
        }
    }

    async fn resolve_content(
        &self,
        text: &Option<String>,
        media: Option<MediaSource>,
    ) -> Result<MessageContent, ChatError> {
        match media {
            Some(MediaSource::Local(path)) => {
                let url = self.ctx.files.upload(&path).await?;
                Ok(MessageContent::Image { url })
            }
            Some(MediaSource::Remote(url)) => Ok(MessageContent::Image { url }),
            None => {
                let body = text.clone().ok_or_else(|| {
                    ChatError::invalid_input("empty_send", "send requires text or media")
                })?;
                Ok(MessageContent::Text { body })
            }
        }
    }

    /// Persist the message document and, when it advances the conversation,
    /// the summary.
    ///
    /// The two writes are not atomic at the storage layer; a failure between
    /// them leaves the summary stale, which is tolerated (the whole pipeline
    /// is retried). A drained retry older than the newest summarized send
    /// skips the summary write so the preview never moves backwards.
    async fn persist(
        &self,
        local_id: &str,
        created_at_ms: u64,
        content: MessageContent,
    ) -> Result<(String, Option<ConversationSummary>), ChatError> {
        let message = Message {
            id: MessageId::local_only(local_id),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.ctx.user_id.clone(),
            receiver_id: self.peer_id.clone(),
            content: content.clone(),
            created_at_ms,
            state: DeliveryState::Sent,
        };
        let remote_id = self.ctx.documents.create_message(&message).await?;

        let summarize = {
            let inner = self.lock();
            inner.last_summary_ms.map_or(true, |ms| created_at_ms >= ms)
        };
        if !summarize {
            trace!(%local_id, "summary already ahead of this send; skipping update");
            return Ok((remote_id, None));
        }

        let summary = ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            participants: [self.ctx.user_id.clone(), self.peer_id.clone()],
            last_preview: content.preview().to_owned(),
            last_message_ms: created_at_ms,
        };
        self.ctx.documents.update_summary(&summary).await?;
        {
            let mut inner = self.lock();
            let newest = inner.last_summary_ms.get_or_insert(created_at_ms);
            *newest = (*newest).max(created_at_ms);
        }
        Ok((remote_id, Some(summary)))
    }

    fn fail_send(
        &self,
        local_id: &str,
        created_at_ms: u64,
        text: Option<String>,
        media: Option<MediaSource>,
        err: ChatError,
    ) {
        warn!(%local_id, code = %err.code, "send failed");
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            if let Err(mark_err) = inner.log.mark(local_id, DeliveryState::Error) {
                warn!(%local_id, %mark_err, "failed send not found in log");
            }
            if err.is_retryable() {
                inner.retry.enqueue(RetryEntry {
                    local_id: local_id.to_owned(),
                    receiver_id: self.peer_id.clone(),
                    text,
                    media,
                    created_at_ms,
                });
            }
        }
        self.save_cache();
        self.emit_state(local_id, DeliveryState::Error, None);
        if !err.is_retryable() {
            self.emit(ChatEvent::FatalError {
                code: err.code,
                message: err.message,
            });
        }
    }
}

fn optimistic_content(
    text: &Option<String>,
    media: &Option<MediaSource>,
) -> Result<MessageContent, ChatError> {
    match (text, media) {
        (Some(body), None) => Ok(MessageContent::Text { body: body.clone() }),
        (None, Some(MediaSource::Local(path))) => Ok(MessageContent::Image { url: path.clone() }),
        (None, Some(MediaSource::Remote(url))) => Ok(MessageContent::Image { url: url.clone() }),
        _ => Err(ChatError::invalid_input(
            "empty_send",
            "send requires text or media",
        )),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
