//! Duplicate suppression for long-running control commands.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// `(conversation_key, account_key)`.
pub type InFlightKey = (String, String);

/// Set of keys with a handler currently running.
///
/// The lock is only taken inside `try_mark` and the guard's `Drop`, so it
/// is never held across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    keys: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> MutexGuard<'_, HashSet<InFlightKey>> {
        // A poisoned set is still a valid set of keys.
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a key as in flight.
    ///
    /// Returns `None` if it already is. The key is unmarked when the
    /// returned guard drops, whether the handler succeeded or not.
    pub fn try_mark(&self, conversation_key: &str, account_key: &str) -> Option<InFlightGuard> {
        let key = (conversation_key.to_string(), account_key.to_string());
        if !self.keys().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            tracker: self.clone(),
            key,
        })
    }

    pub fn is_in_flight(&self, conversation_key: &str, account_key: &str) -> bool {
        self.keys()
            .contains(&(conversation_key.to_string(), account_key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unmarks its key on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: InFlightTracker,
    key: InFlightKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.keys().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_mark_is_refused() {
        let tracker = InFlightTracker::new();
        let guard = tracker.try_mark("conv", "acc").unwrap();
        assert!(tracker.try_mark("conv", "acc").is_none());
        assert!(tracker.is_in_flight("conv", "acc"));

        // Different account, different key.
        assert!(tracker.try_mark("conv", "other").is_some());

        drop(guard);
        assert!(!tracker.is_in_flight("conv", "acc"));
        assert!(tracker.try_mark("conv", "acc").is_some());
    }

    #[test]
    fn test_unmarked_when_handler_fails() {
        let tracker = InFlightTracker::new();
        let result: Result<(), &str> = (|| {
            let _guard = tracker.try_mark("conv", "acc").ok_or("busy")?;
            Err("handler failed")
        })();
        assert_eq!(result, Err("handler failed"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let tracker = InFlightTracker::new();
        let clone = tracker.clone();
        let _guard = tracker.try_mark("conv", "acc").unwrap();
        assert!(clone.try_mark("conv", "acc").is_none());
        assert_eq!(clone.len(), 1);
    }
}
