//! Reply registry: routes reply events back to their callbacks.
//!
//! Shared between the facade (inserts on `send_with_reply`) and the engine
//! task (removes on final replies, drains on close) behind a mutex.  The
//! mutex is never held across a callback invocation: the engine takes an
//! entry out, invokes it unlocked, and restores it for interim replies.

use std::collections::HashMap;

use crate::session::ReplyFn;

pub(crate) struct ReplyEntry {
    pub callback: ReplyFn,
    pub multi_reply: bool,
    pub transient_for: Option<String>,
}

#[derive(Default)]
pub(crate) struct ReplyRegistry {
    entries: HashMap<i64, ReplyEntry>,
}

impl ReplyRegistry {
    pub fn insert(&mut self, action_id: i64, entry: ReplyEntry) {
        self.entries.insert(action_id, entry);
    }

    pub fn take(&mut self, action_id: i64) -> Option<ReplyEntry> {
        self.entries.remove(&action_id)
    }

    pub fn restore(&mut self, action_id: i64, entry: ReplyEntry) {
        self.entries.insert(action_id, entry);
    }

    pub fn is_multi(&self, action_id: i64) -> Option<bool> {
        self.entries.get(&action_id).map(|e| e.multi_reply)
    }

    /// Remove entries whose action was transient for a server session other
    /// than `current`.  Their replies can no longer arrive.
    pub fn take_transients_not_for(&mut self, current: Option<&str>) -> Vec<(i64, ReplyEntry)> {
        let stale: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.transient_for
                    .as_deref()
                    .is_some_and(|session| Some(session) != current)
            })
            .map(|(id, _)| *id)
            .collect();
        let mut removed: Vec<(i64, ReplyEntry)> = stale
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e)))
            .collect();
        removed.sort_by_key(|(id, _)| *id);
        removed
    }

    /// Remove every entry, in action-id order.  Used at session close.
    pub fn drain_all(&mut self) -> Vec<(i64, ReplyEntry)> {
        let mut drained: Vec<(i64, ReplyEntry)> = self.entries.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }
}
