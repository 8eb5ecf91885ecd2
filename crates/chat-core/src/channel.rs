//! Plumbing between one chat session runtime and its frontends.
//!
//! The runtime task owns the single command receiver, so sends and
//! reconnects are applied in the order frontends issued them. Events fan out
//! over a broadcast channel; a subscriber that lags loses events and must
//! resync from the session's latest snapshot instead.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ChatCommand, ChatEvent, ChatNotice};

/// Session events as seen by one frontend subscriber.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// Errors returned by session channel operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatChannelError {
    /// The runtime has shut down and no longer accepts commands.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command sender plus event fan-out for one chat session.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    command_tx: mpsc::Sender<ChatCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<ChatCommand>) {
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

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChatChannelError::CommandChannelClosed)
    }

    /// Emit an event to all current subscribers. Without subscribers the
    /// event is dropped.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Emit a user-visible notice.
    pub fn notify(&self, notice: ChatNotice) {
        self.emit(ChatEvent::Notice(notice));
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::RecvError;

    use super::*;
    use crate::types::ConnectionState;

    #[tokio::test]
    async fn sends_commands_to_receiver() {
        let (channels, mut rx) = ChatChannels::new(8, 8);
        channels
            .send_command(ChatCommand::Send {
                text: "hello".into(),
            })
            .await
            .expect("command send should work");

        let cmd = rx.recv().await.expect("receiver should have a command");
        assert_eq!(
            cmd,
            ChatCommand::Send {
                text: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn reports_closed_command_channel() {
        let (channels, rx) = ChatChannels::new(1, 1);
        drop(rx);
        let err = channels
            .send_command(ChatCommand::Shutdown)
            .await
            .expect_err("send should fail without receiver");
        assert_eq!(err, ChatChannelError::CommandChannelClosed);
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _) = ChatChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(ChatEvent::StateChanged {
            state: ConnectionState::Connecting,
        });
        channels.notify(ChatNotice::Connected);

        for rx in [&mut a, &mut b] {
            let first = rx.recv().await.expect("first event");
            let second = rx.recv().await.expect("second event");
            assert_eq!(
                first,
                ChatEvent::StateChanged {
                    state: ConnectionState::Connecting
                }
            );
            assert_eq!(second, ChatEvent::Notice(ChatNotice::Connected));
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_how_much_it_missed() {
        let (channels, _) = ChatChannels::new(1, 2);
        let mut slow = channels.subscribe();
        for text in ["a", "b", "c"] {
            channels.notify(ChatNotice::SendRejected {
                reason: text.into(),
            });
        }

        assert_eq!(slow.recv().await, Err(RecvError::Lagged(1)));
        assert_eq!(
            slow.recv().await,
            Ok(ChatEvent::Notice(ChatNotice::SendRejected {
                reason: "b".into()
            }))
        );
    }
}
