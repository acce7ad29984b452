use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{SyncCommand, SyncEvent};

/// Broadcast event stream type used by UI subscribers.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Errors returned by sync channel operations.
#[derive(Debug, Error)]
pub enum SyncChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/event channel pair shared by runtime and UI layers.
#[derive(Clone, Debug)]
pub struct SyncChannels {
    command_tx: mpsc::Sender<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<SyncCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    pub fn command_sender(&self) -> mpsc::Sender<SyncCommand> {
        self.command_tx.clone()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted sync events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Namespace;

    #[tokio::test]
    async fn sends_commands_to_receiver() {
        let (channels, mut rx) = SyncChannels::new(8, 8);
        channels
            .send_command(SyncCommand::Connect {
                auth_token: "tok-1".into(),
            })
            .await
            .expect("command send should work");

        let cmd = rx.recv().await.expect("receiver should have a command");
        match cmd {
            SyncCommand::Connect { auth_token } => assert_eq!(auth_token, "tok-1"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _) = SyncChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(SyncEvent::ConnectionChanged {
            namespace: Namespace::Chat,
            connected: true,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }
}
