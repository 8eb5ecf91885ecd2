use std::collections::HashSet;

use thiserror::Error;

use crate::types::{Message, MessageId};

/// Errors that can occur while merging into the timeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// History may only be seeded once per session.
    #[error("timeline was already seeded with history")]
    AlreadySeeded,
    /// A provisional-only operation received a server id.
    #[error("message '{0}' is not a provisional message")]
    NotProvisional(MessageId),
}

/// Ordered, duplicate-free message timeline.
///
/// Items are unique by id and non-decreasing by timestamp; equal timestamps
/// keep arrival order. All mutation goes through `seed`, `ingest_live`,
/// `insert_provisional` and `reconcile`.
#[derive(Debug, Clone, Default)]
pub struct TimelineMerger {
    items: Vec<Message>,
    ids: HashSet<MessageId>,
    seeded: bool,
}

impl TimelineMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current items in display order.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    /// Owned copy of the current items for presentation.
    pub fn snapshot(&self) -> Vec<Message> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Establish the timeline from a history batch.
    ///
    /// The batch is deduplicated by id (first occurrence wins) and stably
    /// sorted by timestamp. Live or provisional items that arrived before the
    /// history are merged back in. Returns the number of history items kept.
    pub fn seed(&mut self, history: Vec<Message>) -> Result<usize, TimelineMergeError> {
        if self.seeded {
            return Err(TimelineMergeError::AlreadySeeded);
        }
        self.seeded = true;

        let mut ids = HashSet::with_capacity(history.len());
        let mut batch = Vec::with_capacity(history.len());
        for message in history {
            if ids.insert(message.id.clone()) {
                batch.push(message);
            }
        }
        batch.sort_by_key(|message| message.timestamp_ms);
        let kept = batch.len();

        let earlier = std::mem::replace(&mut self.items, batch);
        self.ids = ids;
        for message in earlier {
            self.ingest_live(message);
        }

        Ok(kept)
    }

    /// Insert one live message. Returns `false` when its id is already present.
    pub fn ingest_live(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Insert an optimistic local echo.
    pub fn insert_provisional(&mut self, message: Message) -> Result<bool, TimelineMergeError> {
        if !message.id.is_local() {
            return Err(TimelineMergeError::NotProvisional(message.id));
        }
        Ok(self.ingest_live(message))
    }

    /// Swap a provisional item for its confirmed counterpart in one step.
    ///
    /// Returns `true` when `confirmed` was inserted, `false` when its id was
    /// already present.
    pub fn reconcile(
        &mut self,
        provisional_id: &MessageId,
        confirmed: Message,
    ) -> Result<bool, TimelineMergeError> {
        if !provisional_id.is_local() {
            return Err(TimelineMergeError::NotProvisional(provisional_id.clone()));
        }

        if self.ids.remove(provisional_id)
            && let Some(index) = self.items.iter().position(|it| &it.id == provisional_id)
        {
            self.items.remove(index);
        }

        Ok(self.ingest_live(confirmed))
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = match self.items.last() {
            Some(tail) if message.timestamp_ms < tail.timestamp_ms => self
                .items
                .partition_point(|it| it.timestamp_ms <= message.timestamp_ms),
            _ => self.items.len(),
        };
        self.ids.insert(message.id.clone());
        self.items.insert(index, message);
    }
}
