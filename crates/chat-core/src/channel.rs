use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ChatCommand, ChatEvent, SendRequest};

/// Broadcast event stream type used by engine subscribers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// Errors returned by engine channel operations.
#[derive(Debug, Error)]
pub enum EngineChannelError {
    /// The session loop has exited, so commands have nowhere to go.
    #[error("conversation session loop has exited")]
    SessionGone,
}

/// Handle a caller keeps on a conversation session loop: sends and the close
/// request go in over a bounded command queue, and session output fans out to
/// any number of event subscribers.
///
/// The event sender half is handed to the session at open; this handle only
/// ever subscribes. Send rejections come back asynchronously as
/// [`ChatEvent::SendRejected`] rather than as command errors.
#[derive(Clone, Debug)]
pub struct EngineChannels {
    commands: mpsc::Sender<ChatCommand>,
    events: broadcast::Sender<ChatEvent>,
}

impl EngineChannels {
    /// Build the channel pair, returning the command receiver the session
    /// loop consumes.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<ChatCommand>) {
        let (commands, command_rx) = mpsc::channel(command_buffer.max(1));
        let (events, _) = broadcast::channel(event_buffer.max(1));
        (Self { commands, events }, command_rx)
    }

    /// Event sender for the session to emit through.
    pub fn event_sender(&self) -> broadcast::Sender<ChatEvent> {
        self.events.clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Queue one outbound send.
    pub async fn send(&self, request: SendRequest) -> Result<(), EngineChannelError> {
        self.command(ChatCommand::Send(request)).await
    }

    /// Ask the session loop to tear down.
    pub async fn close(&self) -> Result<(), EngineChannelError> {
        self.command(ChatCommand::Close).await
    }

    async fn command(&self, command: ChatCommand) -> Result<(), EngineChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineChannelError::SessionGone)
    }
}
