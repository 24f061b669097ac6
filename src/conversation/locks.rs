use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::ConversationKey;
use crate::util::lock;

/// A held conversation lock.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub key: ConversationKey,
    pub held_since: DateTime<Utc>,
}

/// Table of conversations that currently have a run executing.
///
/// # Invariants
/// - A key is present iff a run is executing for it.
/// - `try_lock` is a linearizable test-and-set: under concurrent calls for
///   the same key exactly one succeeds.
/// - `unlock` is idempotent and never fails.
#[derive(Debug, Default)]
pub struct ConversationLocks {
    held: Mutex<HashMap<ConversationKey, DateTime<Utc>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key` if nobody holds it. Never blocks.
    pub fn try_lock(&self, key: &ConversationKey) -> bool {
        let mut held = lock(&self.held);
        match held.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        }
    }

    /// Release the lock for `key`. Returns whether it was held.
    pub fn unlock(&self, key: &ConversationKey) -> bool {
        lock(&self.held).remove(key).is_some()
    }

    pub fn is_locked(&self, key: &ConversationKey) -> bool {
        lock(&self.held).contains_key(key)
    }

    pub fn list_locked(&self) -> Vec<ConversationKey> {
        lock(&self.held).keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<LockEntry> {
        lock(&self.held)
            .iter()
            .map(|(key, held_since)| LockEntry {
                key: key.clone(),
                held_since: *held_since,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.held).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
