use crate::core::MutationRecord;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ledger of the change-notification subscriptions a session holds open.
///
/// A [`Subscription`] deregisters itself when dropped; [`release_all`]
/// tears down whatever is still registered when the session ends. Either
/// path removes an entry once, so the teardown of every subscription runs
/// exactly once.
///
/// [`release_all`]: SubscriptionRegistry::release_all
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    live: HashMap<u64, Entry>,
    released: u64,
}

struct Entry {
    label: String,
    token: CancellationToken,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscription whose token is a child of `parent`.
    pub fn register(
        &self,
        label: impl Into<String>,
        parent: &CancellationToken,
        receiver: broadcast::Receiver<MutationRecord>,
    ) -> Subscription {
        let token = parent.child_token();
        let label = label.into();
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = state.next_id;
            state.live.insert(
                id,
                Entry {
                    label: label.clone(),
                    token: token.clone(),
                },
            );
            id
        };
        debug!(id, %label, "subscription registered");
        Subscription {
            id,
            registry: self.clone(),
            token,
            receiver,
        }
    }

    pub fn live(&self) -> usize {
        self.state().live.len()
    }

    pub fn live_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.state().live.values().map(|e| e.label.clone()).collect();
        labels.sort();
        labels
    }

    /// Total number of teardowns performed so far.
    pub fn released(&self) -> u64 {
        self.state().released
    }

    /// Cancels and forgets every subscription still registered.
    pub fn release_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut state = self.state();
            let drained: Vec<Entry> = state.live.drain().map(|(_, entry)| entry).collect();
            state.released += drained.len() as u64;
            drained
        };
        for entry in &drained {
            debug!(label = %entry.label, "releasing subscription at teardown");
            entry.token.cancel();
        }
        drained.len()
    }

    fn deregister(&self, id: u64) {
        let mut state = self.state();
        if state.live.remove(&id).is_some() {
            state.released += 1;
        }
    }
}

/// A live change-notification subscription. Dropping it releases it.
pub struct Subscription {
    id: u64,
    registry: SubscriptionRegistry,
    pub(crate) token: CancellationToken,
    pub(crate) receiver: broadcast::Receiver<MutationRecord>,
}

impl Subscription {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> broadcast::Receiver<MutationRecord> {
        broadcast::channel(4).1
    }

    #[test]
    fn drop_deregisters_once() {
        let registry = SubscriptionRegistry::new();
        let session = CancellationToken::new();
        let first = registry.register("first", &session, feed());
        let second = registry.register("second", &session, feed());
        assert_eq!(registry.live(), 2);
        assert_eq!(registry.live_labels(), vec!["first", "second"]);

        drop(first);
        assert_eq!(registry.live(), 1);
        assert_eq!(registry.released(), 1);
        drop(second);
        assert_eq!(registry.live(), 0);
        assert_eq!(registry.released(), 2);
    }

    #[test]
    fn release_all_cancels_and_later_drop_is_a_no_op() {
        let registry = SubscriptionRegistry::new();
        let session = CancellationToken::new();
        let pending = registry.register("pending", &session, feed());

        assert_eq!(registry.release_all(), 1);
        assert!(pending.is_cancelled());
        assert!(!session.is_cancelled());
        drop(pending);
        assert_eq!(registry.released(), 1);
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn session_cancellation_reaches_every_subscription() {
        let registry = SubscriptionRegistry::new();
        let session = CancellationToken::new();
        let a = registry.register("a", &session, feed());
        let b = registry.register("b", &session, feed());
        session.cancel();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
