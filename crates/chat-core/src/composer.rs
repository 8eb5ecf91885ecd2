use uuid::Uuid;

use crate::{
    error::ComposeRejected,
    normalization::{InboundMessage, OutboundPayload},
    types::{Message, MessageId, Session, SessionTuning},
};

#[derive(Debug, Clone)]
struct PendingEcho {
    provisional_id: MessageId,
    payload: OutboundPayload,
    sent_at_ms: u64,
    transmitted: bool,
    retried: bool,
    /// Reported as unconfirmed; still matched so a late echo replaces it.
    expired: bool,
}

/// Creates provisional messages and matches them against server echoes.
#[derive(Debug, Clone)]
pub struct OutboundComposer {
    pending: Vec<PendingEcho>,
    echo_window_ms: u64,
    echo_timeout_ms: u64,
}

impl OutboundComposer {
    pub fn new(echo_window_ms: u64, echo_timeout_ms: u64) -> Self {
        Self {
            pending: Vec::new(),
            echo_window_ms,
            echo_timeout_ms,
        }
    }

    pub fn from_tuning(tuning: &SessionTuning) -> Self {
        Self::new(
            tuning.echo_window_ms(),
            tuning.echo_timeout().as_millis() as u64,
        )
    }

    /// Validate `text` and build a provisional message for it.
    ///
    /// Empty or whitespace-only text is rejected and nothing is tracked.
    pub fn compose(
        &mut self,
        text: &str,
        session: &Session,
        now_ms: u64,
    ) -> Result<Message, ComposeRejected> {
        if text.trim().is_empty() {
            return Err(ComposeRejected::EmptyText);
        }

        let message = Message {
            id: MessageId::Local(Uuid::new_v4().to_string()),
            text: text.to_owned(),
            sender_id: session.user.id.clone(),
            sender_name: session.user.username.clone(),
            timestamp_ms: now_ms,
        };
        self.pending.push(PendingEcho {
            provisional_id: message.id.clone(),
            payload: OutboundPayload::from_provisional(&message),
            sent_at_ms: now_ms,
            transmitted: false,
            retried: false,
            expired: false,
        });
        Ok(message)
    }

    /// Wire payload for a pending provisional message.
    pub fn payload(&self, provisional_id: &MessageId) -> Option<&OutboundPayload> {
        self.pending
            .iter()
            .find(|pending| &pending.provisional_id == provisional_id)
            .map(|pending| &pending.payload)
    }

    /// Record that the payload was handed to the channel.
    pub fn mark_transmitted(&mut self, provisional_id: &MessageId) {
        if let Some(pending) = self
            .pending
            .iter_mut()
            .find(|pending| &pending.provisional_id == provisional_id)
        {
            pending.transmitted = true;
        }
    }

    /// Payloads that never reached the channel and have not been retried yet.
    ///
    /// Each returned entry is marked as retried, so a message gets at most one
    /// automatic retry.
    pub fn take_retryable(&mut self) -> Vec<(MessageId, OutboundPayload)> {
        self.pending
            .iter_mut()
            .filter(|pending| !pending.transmitted && !pending.retried && !pending.expired)
            .map(|pending| {
                pending.retried = true;
                (pending.provisional_id.clone(), pending.payload.clone())
            })
            .collect()
    }

    /// Find and stop tracking the provisional message an inbound echo confirms.
    ///
    /// An echoed `clientId` wins, expired messages included; otherwise the
    /// oldest pending message with the same sender and text sent within the
    /// echo window matches.
    pub fn match_echo(&mut self, inbound: &InboundMessage) -> Option<MessageId> {
        let by_client_id = inbound.client_id.as_deref().and_then(|client_id| {
            self.pending
                .iter()
                .position(|pending| pending.payload.client_id == client_id)
        });

        let index = by_client_id.or_else(|| {
            let message = &inbound.message;
            self.pending.iter().position(|pending| {
                pending.payload.sender_id == message.sender_id
                    && pending.payload.text == message.text
                    && pending.sent_at_ms.abs_diff(message.timestamp_ms) <= self.echo_window_ms
            })
        })?;

        Some(self.pending.remove(index).provisional_id)
    }

    /// Report provisional messages whose echo did not arrive in time, once
    /// each.
    ///
    /// The messages stay in the timeline and keep their correlation id until
    /// an echo confirms them, but are no longer retried.
    pub fn expire(&mut self, now_ms: u64) -> Vec<MessageId> {
        let timeout = self.echo_timeout_ms;
        self.pending
            .iter_mut()
            .filter(|pending| {
                !pending.expired && now_ms.saturating_sub(pending.sent_at_ms) > timeout
            })
            .map(|pending| {
                pending.expired = true;
                pending.provisional_id.clone()
            })
            .collect()
    }

    /// Messages still awaiting their echo within the timeout.
    pub fn pending_len(&self) -> usize {
        self.pending.iter().filter(|pending| !pending.expired).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{UserId, UserIdentity};

    fn session() -> Session {
        Session::new(
            "jwt",
            UserIdentity {
                id: UserId::new("3"),
                username: "alice".into(),
            },
        )
    }

    fn echo(text: &str, sender: &str, ts: u64, client_id: Option<&str>) -> InboundMessage {
        InboundMessage {
            message: Message {
                id: MessageId::Server(format!("srv-{ts}")),
                text: text.to_owned(),
                sender_id: UserId::new(sender),
                sender_name: "alice".into(),
                timestamp_ms: ts,
            },
            client_id: client_id.map(ToOwned::to_owned),
        }
    }

    #[test]
    fn rejects_blank_text_without_tracking() {
        let mut composer = OutboundComposer::new(1_000, 5_000);
        assert_eq!(
            composer.compose("", &session(), 10),
            Err(ComposeRejected::EmptyText)
        );
        assert_eq!(
            composer.compose(" \t\n ", &session(), 10),
            Err(ComposeRejected::EmptyText)
        );
        assert_eq!(composer.pending_len(), 0);
    }

    #[test]
    fn composes_provisional_stamped_with_session_user() {
        let mut composer = OutboundComposer::new(1_000, 5_000);
        let message = composer
            .compose("hi", &session(), 1_234)
            .expect("compose should accept text");

        assert!(message.is_provisional());
        assert_eq!(message.text, "hi");
        assert_eq!(message.sender_id, UserId::new("3"));
        assert_eq!(message.sender_name, "alice");
        assert_eq!(message.timestamp_ms, 1_234);

        let payload = composer.payload(&message.id).expect("payload is tracked");
        assert_eq!(payload.client_id, message.id.as_str());
    }

    #[test]
    fn matches_echo_by_sender_text_and_window() {
        let mut composer = OutboundComposer::new(1_000, 5_000);
        let first = composer.compose("hi", &session(), 10_000).expect("first");
        let second = composer.compose("hi", &session(), 10_500).expect("second");

        assert_eq!(composer.match_echo(&echo("hi", "4", 10_100, None)), None);
        assert_eq!(composer.match_echo(&echo("hey", "3", 10_100, None)), None);
        assert_eq!(composer.match_echo(&echo("hi", "3", 20_000, None)), None);

        assert_eq!(
            composer.match_echo(&echo("hi", "3", 10_200, None)),
            Some(first.id)
        );
        assert_eq!(
            composer.match_echo(&echo("hi", "3", 10_200, None)),
            Some(second.id)
        );
        assert_eq!(composer.pending_len(), 0);
    }

    #[test]
    fn echoed_client_id_takes_precedence() {
        let mut composer = OutboundComposer::new(1_000, 5_000);
        let first = composer.compose("same", &session(), 100).expect("first");
        let second = composer.compose("same", &session(), 200).expect("second");

        let matched = composer.match_echo(&echo("same", "3", 90_000, Some(second.id.as_str())));
        assert_eq!(matched, Some(second.id));
        assert_eq!(composer.pending_len(), 1);
        assert!(composer.payload(&first.id).is_some());
    }

    #[test]
    fn retries_untransmitted_payloads_once() {
        let mut composer = OutboundComposer::new(1_000, 5_000);
        let sent = composer.compose("sent", &session(), 1).expect("sent");
        let unsent = composer.compose("unsent", &session(), 2).expect("unsent");
        composer.mark_transmitted(&sent.id);

        let retry = composer.take_retryable();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].0, unsent.id);
        assert_eq!(retry[0].1.text, "unsent");
        assert!(composer.take_retryable().is_empty());
    }

    #[test]
    fn expires_stale_pending_echoes() {
        let mut composer = OutboundComposer::new(1_000, 5_000);
        let old = composer.compose("old", &session(), 1_000).expect("old");
        let fresh = composer.compose("fresh", &session(), 5_000).expect("fresh");

        assert_eq!(composer.expire(6_500), vec![old.id.clone()]);
        assert_eq!(composer.pending_len(), 1);
        assert!(composer.payload(&fresh.id).is_some());
        assert_eq!(composer.expire(7_000), Vec::new());
    }

    #[test]
    fn late_echo_still_confirms_expired_message() {
        let mut composer = OutboundComposer::new(1_000, 5_000);
        let late = composer.compose("late", &session(), 1_000).expect("late");
        assert_eq!(composer.expire(10_000), vec![late.id.clone()]);
        assert!(composer.take_retryable().is_empty());

        let matched = composer.match_echo(&echo("late", "3", 12_000, Some(late.id.as_str())));
        assert_eq!(matched, Some(late.id));
        assert_eq!(composer.match_echo(&echo("late", "3", 12_000, None)), None);
    }
}
