//! In-process lock table serialising ratchet advancement and conversation
//! membership changes.
//!
//! Keys are totally ordered (every conversation key sorts before every
//! session key). An operation acquires its keys in ascending order, may
//! extend its set only with keys greater than everything it holds, and
//! takes all of them before it touches the database. Lock order is therefore
//! global and a database transaction never waits on a lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use dk_proto::{ConversationId, DeviceId};

const PRUNE_ABOVE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum LockKey {
    Conversation(ConversationId),
    /// Directional: (local, remote).
    Session(DeviceId, DeviceId),
}

#[derive(Default)]
pub(crate) struct LockTable {
    slots: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

/// Held locks; released on drop.
pub(crate) struct LockSet {
    held: Vec<(LockKey, OwnedMutexGuard<()>)>,
}

impl LockSet {
    pub fn holds(&self, key: &LockKey) -> bool {
        self.held.iter().any(|(k, _)| k == key)
    }
}

impl LockTable {
    pub async fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> LockSet {
        let mut set = LockSet { held: Vec::new() };
        self.extend(&mut set, keys).await;
        set
    }

    /// Add keys to an existing set. Keys already held are skipped; new keys
    /// must sort after every held key.
    pub async fn extend(&self, set: &mut LockSet, keys: impl IntoIterator<Item = LockKey>) {
        let mut keys: Vec<LockKey> = keys.into_iter().filter(|k| !set.holds(k)).collect();
        keys.sort();
        keys.dedup();
        if let (Some(first), Some((last_held, _))) = (keys.first(), set.held.last()) {
            debug_assert!(first > last_held, "lock order violated: {first:?} after {last_held:?}");
        }

        for key in keys {
            let slot = self.slot(&key);
            let guard = slot.lock_owned().await;
            set.held.push((key, guard));
        }
    }

    fn slot(&self, key: &LockKey) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        if slots.len() > PRUNE_ABOVE {
            slots.retain(|_, m| Arc::strong_count(m) > 1);
        }
        slots.entry(key.clone()).or_default().clone()
    }
}

pub(crate) fn session_key(local: DeviceId, remote: DeviceId) -> LockKey {
    LockKey::Session(local, remote)
}

pub(crate) fn conversation_key(conversation: &ConversationId) -> LockKey {
    LockKey::Conversation(conversation.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn conversations_sort_before_sessions() {
        let s = LockKey::Session(DeviceId::new(), DeviceId::new());
        let c = LockKey::Conversation(ConversationId::from("zzz"));
        assert!(c < s);
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let table = Arc::new(LockTable::default());
        let (a, b) = (DeviceId::new(), DeviceId::new());
        let held = table.acquire([session_key(a, b)]).await;

        let t2 = table.clone();
        let waiter = tokio::spawn(async move {
            let _g = t2.acquire([session_key(a, b)]).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter acquires after release")
            .unwrap();
    }

    #[tokio::test]
    async fn extend_skips_held_keys() {
        let table = LockTable::default();
        let conv = ConversationId::from("c1");
        let (a, b) = (DeviceId::new(), DeviceId::new());
        let mut set = table.acquire([conversation_key(&conv)]).await;
        table
            .extend(&mut set, [conversation_key(&conv), session_key(a, b), session_key(a, b)])
            .await;
        assert!(set.holds(&session_key(a, b)));
        assert_eq!(set.held.len(), 2);
    }
}
