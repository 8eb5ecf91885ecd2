use crate::{
    error::ChatError,
    types::{ChatEvent, ChatNotice, ConnectionState},
};

/// Input observed from the transport that may move the connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// A fresh `connect(session)` was requested.
    Connect,
    /// The handshake completed and the channel is live.
    HandshakeSucceeded,
    /// One connect attempt failed for a transient reason; retries continue.
    AttemptFailed { message: String },
    /// An established channel dropped; an automatic reconnect follows.
    Dropped,
    /// The handshake was rejected (bad or expired token).
    HandshakeRejected(ChatError),
    /// The channel was released.
    Close,
}

/// Channel connection lifecycle.
///
/// `Disconnected -> Connecting -> Connected`, `Connected -> Connecting` on
/// drop, any state `-> Errored` on rejection, and only `Connect` leaves
/// `Errored`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    handshakes: u32,
    outage_reported: bool,
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Number of successful handshakes so far, reconnects included.
    pub fn handshakes(&self) -> u32 {
        self.handshakes
    }

    /// Apply a signal and return the events it produces, in emission order.
    pub fn apply(&mut self, signal: &ConnectionSignal) -> Result<Vec<ChatEvent>, ChatError> {
        use ConnectionState::*;

        match signal {
            ConnectionSignal::Connect => match self.state {
                Disconnected | Errored => {
                    self.outage_reported = false;
                    Ok(self.transition(Connecting))
                }
                Connecting | Connected => Err(ChatError::invalid_state(self.state, "connect")),
            },
            ConnectionSignal::HandshakeSucceeded => {
                if self.state != Connecting {
                    return Err(ChatError::invalid_state(self.state, "handshake_succeeded"));
                }
                self.handshakes = self.handshakes.saturating_add(1);
                self.outage_reported = false;
                let mut events = self.transition(Connected);
                if self.handshakes == 1 {
                    events.push(ChatEvent::Notice(ChatNotice::Connected));
                }
                Ok(events)
            }
            ConnectionSignal::AttemptFailed { message } => {
                if self.state != Connecting {
                    return Err(ChatError::invalid_state(self.state, "attempt_failed"));
                }
                if self.outage_reported {
                    return Ok(Vec::new());
                }
                self.outage_reported = true;
                Ok(vec![ChatEvent::Notice(ChatNotice::Unreachable {
                    message: message.clone(),
                })])
            }
            ConnectionSignal::Dropped => match self.state {
                Connected => Ok(self.transition(Connecting)),
                Connecting => Ok(Vec::new()),
                Disconnected | Errored => Err(ChatError::invalid_state(self.state, "dropped")),
            },
            ConnectionSignal::HandshakeRejected(error) => {
                if self.state == Errored {
                    return Ok(Vec::new());
                }
                let mut events = self.transition(Errored);
                events.push(ChatEvent::Notice(ChatNotice::Errored {
                    code: error.code.clone(),
                    message: error.message.clone(),
                }));
                Ok(events)
            }
            ConnectionSignal::Close => {
                if self.state == Disconnected {
                    return Ok(Vec::new());
                }
                Ok(self.transition(Disconnected))
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) -> Vec<ChatEvent> {
        self.state = next;
        vec![ChatEvent::StateChanged { state: next }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn rejected() -> ConnectionSignal {
        ConnectionSignal::HandshakeRejected(ChatError::new(
            ErrorCategory::Auth,
            "handshake_rejected",
            "invalid token",
        ))
    }

    #[test]
    fn runs_happy_path_with_reconnect() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        sm.apply(&ConnectionSignal::Connect).expect("connect");
        assert_eq!(sm.state(), ConnectionState::Connecting);

        let events = sm
            .apply(&ConnectionSignal::HandshakeSucceeded)
            .expect("handshake");
        assert_eq!(
            events,
            vec![
                ChatEvent::StateChanged {
                    state: ConnectionState::Connected
                },
                ChatEvent::Notice(ChatNotice::Connected),
            ]
        );

        sm.apply(&ConnectionSignal::Dropped).expect("drop");
        assert_eq!(sm.state(), ConnectionState::Connecting);

        let events = sm
            .apply(&ConnectionSignal::HandshakeSucceeded)
            .expect("reconnect");
        assert_eq!(
            events,
            vec![ChatEvent::StateChanged {
                state: ConnectionState::Connected
            }]
        );
        assert_eq!(sm.handshakes(), 2);

        sm.apply(&ConnectionSignal::Close).expect("close");
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(
            sm.apply(&ConnectionSignal::Close)
                .expect("close is idempotent")
                .is_empty()
        );
    }

    #[test]
    fn rejection_is_sticky_until_fresh_connect() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(&ConnectionSignal::Connect).expect("connect");

        let events = sm.apply(&rejected()).expect("rejection");
        assert_eq!(sm.state(), ConnectionState::Errored);
        assert!(matches!(
            events.last(),
            Some(ChatEvent::Notice(ChatNotice::Errored { code, .. })) if code == "handshake_rejected"
        ));

        let err = sm
            .apply(&ConnectionSignal::Dropped)
            .expect_err("drop must not leave Errored");
        assert_eq!(err.code, "invalid_state_transition");
        let err = sm
            .apply(&ConnectionSignal::HandshakeSucceeded)
            .expect_err("handshake must not leave Errored");
        assert_eq!(err.code, "invalid_state_transition");

        sm.apply(&ConnectionSignal::Connect)
            .expect("fresh connect leaves Errored");
        assert_eq!(sm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn reports_unreachable_once_per_outage() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(&ConnectionSignal::Connect).expect("connect");

        let failed = ConnectionSignal::AttemptFailed {
            message: "connection refused".into(),
        };
        assert_eq!(sm.apply(&failed).expect("first failure").len(), 1);
        assert!(sm.apply(&failed).expect("second failure").is_empty());

        sm.apply(&ConnectionSignal::HandshakeSucceeded)
            .expect("handshake");
        sm.apply(&ConnectionSignal::Dropped).expect("drop");
        assert_eq!(sm.apply(&failed).expect("new outage").len(), 1);
    }

    #[test]
    fn rejects_connect_while_already_connecting() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(&ConnectionSignal::Connect).expect("connect");
        let err = sm
            .apply(&ConnectionSignal::Connect)
            .expect_err("second connect should fail");
        assert_eq!(err.code, "invalid_state_transition");
    }
}
