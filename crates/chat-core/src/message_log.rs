use thiserror::Error;

use crate::types::{DeliveryState, Message};

/// Errors produced while merging into the message log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// A message with the same local or remote id is already present.
    #[error("message '{0}' is already in the log")]
    Duplicate(String),
    /// No message with the given local id exists.
    #[error("message with local id '{0}' was not found")]
    UnknownMessage(String),
    /// The requested delivery-state transition is not legal.
    #[error("illegal delivery transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state.
        from: DeliveryState,
        /// Requested state.
        to: DeliveryState,
    },
}

/// The single in-memory message list for one conversation, newest-first by
/// creation time at every observation point.
///
/// Cache hydration and remote fetch `replace` the list outright; realtime
/// arrivals and optimistic sends `prepend`. Both the cache writer and the UI
/// read from this log, so reconciliation overwrites rather than
/// merge-mutates shared copies.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    items: Vec<Message>,
}

impl MessageLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current messages, newest-first.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    /// Creation time of the newest message, when any.
    pub fn latest_ms(&self) -> Option<u64> {
        self.items.first().map(|m| m.created_at_ms)
    }

    /// Replace the list wholesale with an authoritative snapshot.
    ///
    /// The snapshot is re-sorted defensively so the ordering invariant holds
    /// even if the source returned items out of order.
    pub fn replace(&mut self, mut snapshot: Vec<Message>) {
        snapshot.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        self.items = snapshot;
    }

    /// Insert a strictly-new message, normally at the head.
    ///
    /// Duplicates (by local id, or by remote id when both sides carry one)
    /// are rejected, which makes retry confirmation and realtime self-echo
    /// idempotent. A message older than the current head falls back to a
    /// sorted insert so the invariant survives late arrivals.
    pub fn prepend(&mut self, message: Message) -> Result<(), MergeError> {
        if self.contains(&message) {
            return Err(MergeError::Duplicate(message.id.local));
        }

        match self.items.first() {
            Some(head) if message.created_at_ms < head.created_at_ms => {
                let pos = self
                    .items
                    .iter()
                    .position(|m| m.created_at_ms <= message.created_at_ms)
                    .unwrap_or(self.items.len());
                self.items.insert(pos, message);
            }
            _ => self.items.insert(0, message),
        }
        Ok(())
    }

    /// Transition a message's delivery state in place, matched by local id.
    pub fn mark(&mut self, local_id: &str, next: DeliveryState) -> Result<(), MergeError> {
        let message = self
            .items
            .iter_mut()
            .find(|m| m.id.local == local_id)
            .ok_or_else(|| MergeError::UnknownMessage(local_id.to_owned()))?;

        if !message.state.can_transition_to(next) {
            return Err(MergeError::IllegalTransition {
                from: message.state,
                to: next,
            });
        }
        message.state = next;
        Ok(())
    }

    /// Confirm persistence: mark `Sent` and attach the server-assigned id.
    pub fn confirm(&mut self, local_id: &str, remote_id: impl Into<String>) -> Result<(), MergeError> {
        self.mark(local_id, DeliveryState::Sent)?;
        if let Some(message) = self.items.iter_mut().find(|m| m.id.local == local_id) {
            message.id.remote = Some(remote_id.into());
        }
        Ok(())
    }

    /// Re-apply realtime events buffered while the initial fetch was in
    /// flight, after the fetch has replaced the list.
    ///
    /// Only events strictly newer than the fetch head are considered; the
    /// rest are assumed covered by the fetch result. Duplicates by id are
    /// dropped. Returns how many events were applied.
    pub fn reapply_buffered(&mut self, buffered: Vec<Message>, fetch_latest_ms: Option<u64>) -> usize {
        let mut applied = 0;
        for message in buffered {
            if let Some(cutoff) = fetch_latest_ms {
                if message.created_at_ms <= cutoff {
                    continue;
                }
            }
            if self.prepend(message).is_ok() {
                applied += 1;
            }
        }
        applied
    }

    fn contains(&self, message: &Message) -> bool {
        self.items.iter().any(|m| {
            m.id.local == message.id.local
                || (message.id.remote.is_some() && m.id.remote == message.id.remote)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageContent, MessageId};

    fn message(local: &str, remote: Option<&str>, created_at_ms: u64) -> Message {
        Message {
            id: MessageId {
                local: local.to_owned(),
                remote: remote.map(str::to_owned),
            },
            conversation_id: "c1".to_owned(),
            sender_id: "alice".to_owned(),
            receiver_id: "bob".to_owned(),
            content: MessageContent::Text {
                body: format!("msg-{local}"),
            },
            created_at_ms,
            state: DeliveryState::Sent,
        }
    }

    fn assert_newest_first(log: &MessageLog) {
        let times: Vec<u64> = log.items().iter().map(|m| m.created_at_ms).collect();
        let mut sorted = times.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(times, sorted, "log must be newest-first");
    }

    #[test]
    fn replace_sorts_snapshot_newest_first() {
        let mut log = MessageLog::new();
        log.replace(vec![
            message("a", Some("s1"), 100),
            message("b", Some("s2"), 300),
            message("c", Some("s3"), 200),
        ]);

        assert_eq!(log.items().len(), 3);
        assert_eq!(log.items()[0].id.local, "b");
        assert_eq!(log.latest_ms(), Some(300));
        assert_newest_first(&log);
    }

    #[test]
    fn prepend_keeps_ordering_for_newer_and_late_arrivals() {
        let mut log = MessageLog::new();
        log.replace(vec![message("a", Some("s1"), 100), message("b", Some("s2"), 200)]);

        log.prepend(message("c", Some("s3"), 300)).expect("newer prepend");
        assert_eq!(log.items()[0].id.local, "c");

        log.prepend(message("d", Some("s4"), 150)).expect("late arrival");
        assert_newest_first(&log);
        assert_eq!(log.items().len(), 4);
        assert_eq!(log.items()[2].id.local, "d");
    }

    #[test]
    fn prepend_rejects_duplicates_by_local_and_remote_id() {
        let mut log = MessageLog::new();
        log.prepend(message("a", Some("s1"), 100)).expect("first insert");

        let err = log
            .prepend(message("a", None, 200))
            .expect_err("same local id must be rejected");
        assert_eq!(err, MergeError::Duplicate("a".to_owned()));

        let err = log
            .prepend(message("other", Some("s1"), 200))
            .expect_err("same remote id must be rejected");
        assert_eq!(err, MergeError::Duplicate("other".to_owned()));

        assert_eq!(log.items().len(), 1);
    }

    #[test]
    fn mark_enforces_legal_transitions() {
        let mut log = MessageLog::new();
        let mut optimistic = message("a", None, 100);
        optimistic.state = DeliveryState::Sending;
        log.prepend(optimistic).expect("insert");

        log.mark("a", DeliveryState::Error).expect("sending -> error");
        log.mark("a", DeliveryState::Sending).expect("error -> sending (retry)");
        log.mark("a", DeliveryState::Sent).expect("sending -> sent");

        let err = log
            .mark("a", DeliveryState::Sending)
            .expect_err("sent is terminal");
        assert_eq!(
            err,
            MergeError::IllegalTransition {
                from: DeliveryState::Sent,
                to: DeliveryState::Sending,
            }
        );

        let err = log
            .mark("missing", DeliveryState::Sent)
            .expect_err("unknown id must be reported");
        assert_eq!(err, MergeError::UnknownMessage("missing".to_owned()));
    }

    #[test]
    fn confirm_attaches_remote_id() {
        let mut log = MessageLog::new();
        let mut optimistic = message("a", None, 100);
        optimistic.state = DeliveryState::Sending;
        log.prepend(optimistic).expect("insert");

        log.confirm("a", "srv-9").expect("confirm");
        assert_eq!(log.items()[0].state, DeliveryState::Sent);
        assert_eq!(log.items()[0].id.remote.as_deref(), Some("srv-9"));
    }

    #[test]
    fn reapply_buffered_keeps_only_events_newer_than_fetch_head() {
        let mut log = MessageLog::new();
        log.replace(vec![message("a", Some("s1"), 100), message("b", Some("s2"), 200)]);

        let applied = log.reapply_buffered(
            vec![
                // Covered by the fetch result: same remote id.
                message("x", Some("s2"), 200),
                // Older than the fetch head: assumed included server-side.
                message("y", Some("s0"), 150),
                // Genuinely newer: must survive the replace.
                message("z", Some("s3"), 250),
            ],
            Some(200),
        );

        assert_eq!(applied, 1);
        assert_eq!(log.items().len(), 3);
        assert_eq!(log.items()[0].id.local, "z");
        assert_newest_first(&log);
    }

    #[test]
    fn reapply_buffered_without_cutoff_applies_all_non_duplicates() {
        let mut log = MessageLog::new();
        log.replace(vec![message("a", Some("s1"), 100)]);

        let applied = log.reapply_buffered(
            vec![message("b", Some("s2"), 50), message("a", Some("s1"), 100)],
            None,
        );

        assert_eq!(applied, 1);
        assert_eq!(log.items().len(), 2);
        assert_newest_first(&log);
    }
}
