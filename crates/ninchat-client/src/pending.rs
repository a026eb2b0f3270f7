//! Pending set: in-flight actions awaiting acknowledgement.
//!
//! Kept sorted by (retry deadline, action id); the head is always the next
//! action due for resend.  Confined to the engine task, so no locking.

use ninchat_proto::Action;
use tokio::time::Instant;

pub(crate) struct PendingAction {
    pub action: Action,
    pub transient_for: Option<String>,
    /// Completed sends of this action.
    pub attempts: u32,
    pub deadline: Instant,
}

#[derive(Default)]
pub(crate) struct PendingSet {
    entries: Vec<PendingAction>,
}

impl PendingSet {
    pub fn new() -> Self {
        PendingSet::default()
    }

    /// When the earliest retry comes due, if anything is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    /// Remove and return the head entry if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<PendingAction> {
        if self.entries.first().is_some_and(|e| e.deadline <= now) {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    pub fn insert(&mut self, entry: PendingAction) {
        let key = (entry.deadline, entry.action.action_id());
        let pos = self
            .entries
            .partition_point(|e| (e.deadline, e.action.action_id()) <= key);
        self.entries.insert(pos, entry);
    }

    /// An event acknowledged `action_id`.  Interim replies to a multi-reply
    /// action leave the entry in place; everything else removes it.
    pub fn ack(&mut self, action_id: i64, interim: bool) {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.action.action_id() == Some(action_id))
        {
            if interim && self.entries[pos].action.expects_multiple_replies() {
                return;
            }
            self.entries.remove(pos);
        }
    }

    /// Drop actions tied to a server session that no longer exists.
    pub fn purge_transient(&mut self) {
        self.entries.retain(|e| e.transient_for.is_none());
    }

    /// Collapse every deadline to `now`, so that after a reconnect pending
    /// actions replay immediately, in action-id order, ahead of new sends.
    pub fn make_all_due(&mut self, now: Instant) {
        for entry in &mut self.entries {
            entry.deadline = now;
        }
        self.entries.sort_by_key(|e| e.action.action_id());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
