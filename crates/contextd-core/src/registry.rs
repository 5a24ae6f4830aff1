//! Subscription bookkeeping.
//!
//! Tracks which session watches which property. Pure bookkeeping: the
//! broker asks [`SubscriptionRegistry::sessions_for`] after every
//! observable change and owns the delivery path itself.

use std::collections::{BTreeSet, HashMap, HashSet};

/// Identifier of a subscriber session, unique for the daemon's lifetime.
pub type SessionId = u64;

/// Property-name → watching-sessions index with a per-session reverse map.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    watchers: HashMap<String, BTreeSet<SessionId>>,
    by_session: HashMap<SessionId, HashSet<String>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest of `session` in `key`.
    ///
    /// Returns `false` when the subscription already existed; the caller
    /// still re-pushes the current value either way.
    pub fn subscribe(&mut self, session: SessionId, key: &str) -> bool {
        let inserted = self
            .watchers
            .entry(key.to_string())
            .or_default()
            .insert(session);
        self.by_session
            .entry(session)
            .or_default()
            .insert(key.to_string());
        inserted
    }

    /// Drops one subscription; unknown pairs are ignored.
    pub fn unsubscribe(&mut self, session: SessionId, key: &str) {
        if let Some(sessions) = self.watchers.get_mut(key) {
            sessions.remove(&session);
            if sessions.is_empty() {
                self.watchers.remove(key);
            }
        }
        if let Some(keys) = self.by_session.get_mut(&session) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_session.remove(&session);
            }
        }
    }

    /// Revokes every subscription a closing session holds. Idempotent.
    pub fn unsubscribe_all(&mut self, session: SessionId) {
        let Some(keys) = self.by_session.remove(&session) else {
            return;
        };
        for key in keys {
            if let Some(sessions) = self.watchers.get_mut(&key) {
                sessions.remove(&session);
                if sessions.is_empty() {
                    self.watchers.remove(&key);
                }
            }
        }
    }

    /// Sessions currently watching `key`, in ascending id order.
    pub fn sessions_for(&self, key: &str) -> impl Iterator<Item = SessionId> + '_ {
        self.watchers.get(key).into_iter().flatten().copied()
    }

    /// Number of live subscriptions `session` holds.
    #[must_use]
    pub fn subscription_count(&self, session: SessionId) -> usize {
        self.by_session.get(&session).map_or(0, HashSet::len)
    }
}
