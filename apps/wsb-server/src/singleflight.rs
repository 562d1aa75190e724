//! At-most-one-in-flight discipline for cache refills, plus the per-key
//! validator debounce.
//!
//! Both maps are process-wide: every session funnels through the same
//! [`PendingRefills`] so two callers hitting the same cold lookup key observe
//! a single subprocess spawn, and through the same [`ValidatorDebounce`] so a
//! hot key is revalidated at most once per interval no matter how many
//! sessions request it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

#[derive(Default)]
pub(crate) struct PendingRefills {
    pending: Mutex<HashMap<String, Arc<RefillState>>>,
}

impl PendingRefills {
    /// Joins the flight for `key`. The first caller becomes the leader and is
    /// expected to run the refill; everyone else becomes a follower and
    /// should `wait()` then re-read the store.
    pub(crate) fn begin(&self, key: &str) -> RefillGuard<'_> {
        let mut map = self.pending.lock().expect("pending refill map poisoned");
        match map.get(key) {
            Some(state) => {
                state.refs.fetch_add(1, Ordering::Relaxed);
                RefillGuard {
                    flights: self,
                    key: key.to_string(),
                    state: Arc::clone(state),
                    leader: false,
                    notify_on_drop: false,
                }
            }
            None => {
                let state = Arc::new(RefillState::new());
                map.insert(key.to_string(), Arc::clone(&state));
                RefillGuard {
                    flights: self,
                    key: key.to_string(),
                    state,
                    leader: true,
                    notify_on_drop: true,
                }
            }
        }
    }

    fn release(&self, key: &str, state: &Arc<RefillState>) {
        let mut map = self.pending.lock().expect("pending refill map poisoned");
        if state.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(existing) = map.get(key) {
                if Arc::ptr_eq(existing, state) {
                    map.remove(key);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.lock().expect("pending refill map poisoned").len()
    }
}

struct RefillState {
    notify: Notify,
    /// Set before `notify`; lets a follower that polls after the fact
    /// observe the completed flight instead of parking on a wakeup that
    /// already happened.
    completed: AtomicBool,
    refs: AtomicUsize,
}

impl RefillState {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            completed: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
        }
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

pub(crate) struct RefillGuard<'a> {
    flights: &'a PendingRefills,
    key: String,
    state: Arc<RefillState>,
    leader: bool,
    notify_on_drop: bool,
}

impl RefillGuard<'_> {
    pub(crate) fn is_leader(&self) -> bool {
        self.leader
    }

    /// Follower side: parks until the leader finishes (or drops, e.g. on a
    /// panic in the refill path, so followers are never stranded). Returns
    /// immediately when the leader already finished.
    pub(crate) async fn wait(&self) {
        let mut notified = std::pin::pin!(self.state.notify.notified());
        // Register before checking the flag; a completion landing between
        // the check and the await would otherwise be missed.
        notified.as_mut().enable();
        if self.state.completed.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Leader side: releases every follower once the store has been written.
    pub(crate) fn finish(&mut self) {
        self.state.complete();
        self.notify_on_drop = false;
    }
}

impl Drop for RefillGuard<'_> {
    fn drop(&mut self) {
        if self.notify_on_drop {
            self.state.complete();
        }
        self.flights.release(&self.key, &self.state);
    }
}

/// Tracks the last validation time per lookup key. `try_acquire` returns true
/// at most once per interval per key.
pub(crate) struct ValidatorDebounce {
    interval: Duration,
    last_run: Mutex<HashMap<String, Instant>>,
}

impl ValidatorDebounce {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn try_acquire(&self, key: &str) -> bool {
        let mut map = self.last_run.lock().expect("debounce map poisoned");
        let now = Instant::now();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }
}
