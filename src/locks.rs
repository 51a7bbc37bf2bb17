//! Per-conversation exclusive locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Proof that the holder has exclusive access to one conversation.
///
/// Destructive operations take a guard instead of an id so they cannot run
/// outside the conversation's critical section.
type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Debug)]
pub struct ConversationGuard {
    conversation_id: String,
    table: LockTable,
    _permit: OwnedMutexGuard<()>,
}

impl ConversationGuard {
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        // The table and this guard's permit are the only holders when
        // nobody else is waiting; the entry can go.
        let mut table = lock_unpoisoned(&self.table);
        if table
            .get(&self.conversation_id)
            .is_some_and(|entry| Arc::strong_count(entry) <= 2)
        {
            table.remove(&self.conversation_id);
        }
    }
}

#[derive(Debug, Default)]
pub struct ConversationLocks {
    locks: LockTable,
}

impl ConversationLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the conversation is free.
    pub async fn lock(&self, conversation_id: &str) -> ConversationGuard {
        let permit = self.entry(conversation_id).lock_owned().await;
        self.guard(conversation_id, permit)
    }

    pub fn try_lock(&self, conversation_id: &str) -> Option<ConversationGuard> {
        let permit = self.entry(conversation_id).try_lock_owned().ok()?;
        Some(self.guard(conversation_id, permit))
    }

    /// Conversations currently locked or waited on.
    #[must_use]
    pub fn tracked(&self) -> usize {
        lock_unpoisoned(&self.locks).len()
    }

    /// Locks two distinct conversations in id order so concurrent pair locks
    /// cannot deadlock. Returns guards in argument order, or `None` when the
    /// ids are equal.
    pub async fn lock_pair(
        &self,
        first: &str,
        second: &str,
    ) -> Option<(ConversationGuard, ConversationGuard)> {
        if first == second {
            return None;
        }
        if first < second {
            let a = self.lock(first).await;
            let b = self.lock(second).await;
            Some((a, b))
        } else {
            let b = self.lock(second).await;
            let a = self.lock(first).await;
            Some((a, b))
        }
    }

    fn guard(&self, conversation_id: &str, permit: OwnedMutexGuard<()>) -> ConversationGuard {
        ConversationGuard {
            conversation_id: conversation_id.to_string(),
            table: Arc::clone(&self.locks),
            _permit: permit,
        }
    }

    fn entry(&self, conversation_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = lock_unpoisoned(&self.locks);
        Arc::clone(
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_lock_waits_for_release() {
        let locks = ConversationLocks::new();
        let guard = locks.lock("conv-1").await;

        assert!(locks.try_lock("conv-1").is_none());
        assert!(locks.try_lock("conv-2").is_some());

        drop(guard);
        assert!(locks.try_lock("conv-1").is_some());
    }

    #[tokio::test]
    async fn pair_lock_returns_guards_in_argument_order() {
        let locks = ConversationLocks::new();

        let (a, b) = locks.lock_pair("zeta", "alpha").await.expect("distinct ids");
        assert_eq!(a.conversation_id(), "zeta");
        assert_eq!(b.conversation_id(), "alpha");
        assert!(locks.lock_pair("same", "same").await.is_none());
    }

    #[tokio::test]
    async fn released_conversations_are_forgotten() {
        let locks = ConversationLocks::new();

        let first = locks.lock("conv-1").await;
        let second = locks.lock("conv-2").await;
        assert_eq!(locks.tracked(), 2);

        drop(first);
        drop(second);
        assert_eq!(locks.tracked(), 0);
        assert!(locks.try_lock("conv-1").is_some());
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_someone_waits() {
        let locks = Arc::new(ConversationLocks::new());
        let held = locks.lock("conv-1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let guard = locks.lock("conv-1").await;
                guard.conversation_id().to_string()
            })
        };
        tokio::task::yield_now().await;
        drop(held);

        assert_eq!(waiter.await.expect("waiter"), "conv-1");
        assert_eq!(locks.tracked(), 0);
    }
}
