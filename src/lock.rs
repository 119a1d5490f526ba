use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use tracing::debug;

/// Keyed, non-blocking mutual exclusion. At most one action runs per key; callers that find
/// the key busy get their default value back immediately instead of waiting.
#[derive(Debug, Default)]
pub struct ActionLock {
    busy: Mutex<HashSet<String>>,
}

impl ActionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.busy.lock().contains(key)
    }

    /// Run `action` unless another action for `key` is in flight, in which case `default` is
    /// returned without running `action`. The key is released on every exit path, including
    /// panics and cancellation of the returned future.
    pub async fn perform_action<T, F, Fut>(&self, key: &str, default: T, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(_guard) = self.try_acquire(key) else {
            debug!("Action for {key} is already in progress");
            return default;
        };
        action().await
    }

    fn try_acquire(&self, key: &str) -> Option<ActionGuard<'_>> {
        let mut busy = self.busy.lock();
        if busy.insert(key.to_string()) {
            Some(ActionGuard {
                lock: self,
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

#[must_use]
#[clippy::has_significant_drop]
struct ActionGuard<'a> {
    lock: &'a ActionLock,
    key: String,
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.lock.busy.lock().remove(&self.key);
    }
}
