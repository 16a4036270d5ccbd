use crate::model::AckKind;
use crate::protocol::{CommandKind, Reply};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct PendingCommand {
    sent_at: Instant,
    deadline_at: Instant,
}

/// Outstanding commands keyed by kind; at most one per kind.
#[derive(Debug)]
pub struct CommandTracker {
    pending: HashMap<CommandKind, PendingCommand>,
    ack_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyPending(pub CommandKind);

impl CommandTracker {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ack_timeout,
        }
    }

    /// Reserves `kind` before its write goes out. Kinds that expect no reply
    /// are never tracked.
    pub fn reserve(&mut self, kind: CommandKind, now: Instant) -> Result<(), AlreadyPending> {
        if kind.expected_reply().is_none() {
            return Ok(());
        }
        if self.pending.contains_key(&kind) {
            return Err(AlreadyPending(kind));
        }
        self.pending.insert(
            kind,
            PendingCommand {
                sent_at: now,
                deadline_at: now + self.ack_timeout,
            },
        );
        Ok(())
    }

    /// Drops a reservation whose write failed.
    pub fn release(&mut self, kind: CommandKind) {
        self.pending.remove(&kind);
    }

    /// Resolves the command answered by an `ACK:<kind>` line, returning how
    /// long the device took.
    pub fn resolve_ack(&mut self, ack: &AckKind, now: Instant) -> Option<(CommandKind, Duration)> {
        let kind = self
            .pending
            .keys()
            .copied()
            .find(|kind| kind.expected_reply() == Some(Reply::Ack(ack.clone())))?;
        self.take(kind, now)
    }

    pub fn resolve_memory_report(&mut self, now: Instant) -> Option<(CommandKind, Duration)> {
        self.take(CommandKind::GetMem, now)
    }

    /// An END also answers an outstanding FETCH whose ACK got lost.
    pub fn resolve_end_of_stream(&mut self, now: Instant) -> Option<(CommandKind, Duration)> {
        self.take(CommandKind::Fetch, now)
    }

    pub fn expire(&mut self, now: Instant) -> Vec<CommandKind> {
        let mut expired: Vec<CommandKind> = self
            .pending
            .iter()
            .filter_map(|(kind, pending)| (now >= pending.deadline_at).then_some(*kind))
            .collect();
        expired.sort_by_key(|kind| self.pending[kind].sent_at);
        for kind in &expired {
            self.pending.remove(kind);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, kind: CommandKind) -> bool {
        self.pending.contains_key(&kind)
    }

    pub fn pending_kinds(&self) -> Vec<CommandKind> {
        let mut kinds: Vec<(CommandKind, Instant)> = self
            .pending
            .iter()
            .map(|(kind, pending)| (*kind, pending.sent_at))
            .collect();
        kinds.sort_by_key(|(_, sent_at)| *sent_at);
        kinds.into_iter().map(|(kind, _)| kind).collect()
    }

    fn take(&mut self, kind: CommandKind, now: Instant) -> Option<(CommandKind, Duration)> {
        let pending = self.pending.remove(&kind)?;
        Some((kind, now.saturating_duration_since(pending.sent_at)))
    }
}
