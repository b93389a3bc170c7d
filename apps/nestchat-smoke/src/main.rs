//! Composition root: wires the chat engine to the in-memory platform and
//! scripts an offline send that recovers on reconnect, driving the session
//! through its command loop.

mod config;
mod logging;

use std::{sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{info, warn};

use chat_core::{ChatEvent, DeliveryState, EngineChannels, Message, SendRequest};
use chat_engine::{ConversationSession, EngineContext, SweepJob};
use chat_platform::{
    ConnectivityMonitor, InMemoryDocumentStore, InMemoryFileStorage, InMemoryKeyValueStore,
    RealtimeHub,
};

use config::SmokeConfig;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let hub = RealtimeHub::default();
    let store = InMemoryDocumentStore::with_realtime(hub.clone());
    let monitor = ConnectivityMonitor::new(false);

    let ctx = Arc::new(EngineContext {
        documents: Arc::new(store.clone()),
        files: Arc::new(InMemoryFileStorage::new()),
        cache: Arc::new(InMemoryKeyValueStore::new()),
        realtime: hub,
        connectivity: monitor.clone(),
        user_id: config.user_id.clone(),
        cache_cap: config.cache_cap,
        fetch_limit: config.fetch_limit,
    });

    let (channels, command_rx) = EngineChannels::new(8, 64);
    let mut events = channels.subscribe();
    let session = ConversationSession::open(
        Arc::clone(&ctx),
        config.conversation_id.clone(),
        config.peer_id.clone(),
        channels.event_sender(),
    );
    let session_loop = tokio::spawn(session.run(command_rx));

    // The periodic sweep is owned here, not by a module-level singleton.
    let sweep = SweepJob::new();
    let sweep_store = store.clone();
    if let Err(err) = sweep.start(
        Duration::from_millis(config.sweep_interval_ms),
        move || {
            let store = sweep_store.clone();
            async move {
                info!(persisted = store.message_count(), "periodic sweep");
            }
        },
    ) {
        warn!(%err, "sweep job failed to start");
    }

    // The UI-facing view of the conversation, rebuilt from snapshot events.
    let mut timeline: Vec<Message> = Vec::new();

    store.set_offline(true);
    info!("sending while disconnected");
    if let Err(err) = channels.send(SendRequest::text("Căn hộ này còn không?")).await {
        warn!(%err, "send command not accepted");
    }

    let errored = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ChatEvent::Snapshot { messages, .. }) => timeline = messages,
                Ok(ChatEvent::MessageState {
                    state: DeliveryState::Error,
                    ..
                }) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await;
    match errored {
        Ok(true) => info!("send failed while offline, queued for retry"),
        _ => warn!("expected the offline send to error"),
    }

    store.set_offline(false);
    monitor.set_connected(true);

    let drained = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ChatEvent::Snapshot { messages, .. }) => timeline = messages,
                Ok(ChatEvent::RetryDrained { dispatched }) => break dispatched,
                Ok(_) => continue,
                Err(_) => break 0,
            }
        }
    })
    .await;
    match drained {
        Ok(dispatched) => info!(dispatched, "retry queue drained after reconnect"),
        Err(_) => warn!("timed out waiting for the retry drain"),
    }

    println!("--- timeline ({}) ---", config.conversation_id);
    for message in timeline.iter().rev() {
        let state = match message.state {
            DeliveryState::Sending => "sending",
            DeliveryState::Sent => "sent",
            DeliveryState::Error => "error",
        };
        println!(
            "[{state}] {} -> {}: {}",
            message.sender_id,
            message.receiver_id,
            message.content.preview()
        );
    }
    if let Some(summary) = store.summary(&config.conversation_id) {
        println!("summary: {} ({} ms)", summary.last_preview, summary.last_message_ms);
    }

    if let Err(err) = sweep.stop().await {
        warn!(%err, "sweep job stop failed");
    }
    if let Err(err) = channels.close().await {
        warn!(%err, "close command not accepted");
    }
    let _ = session_loop.await;
}
