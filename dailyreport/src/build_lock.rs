use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::ReportKey;

struct Slot<T> {
    rx: watch::Receiver<Option<T>>,
    started: Instant,
}

type Slots<T> = HashMap<ReportKey, Slot<T>>;

/// Process-wide single-flight markers, one per report key being built.
///
/// The first claimant of a key gets a [`BuildGuard`]; later claimants get a
/// [`BuildWaiter`] that resolves with whatever the guard publishes. Dropping
/// the guard frees the key on every exit path, panics and cancellation
/// included.
pub struct BuildLocks<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T> Default for BuildLocks<T> {
    fn default() -> Self {
        Self { slots: Arc::new(Mutex::new(HashMap::new())) }
    }
}

pub enum BuildClaim<T> {
    Acquired(BuildGuard<T>),
    InFlight(BuildWaiter<T>),
}

fn lock<T>(slots: &Mutex<Slots<T>>) -> MutexGuard<'_, Slots<T>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Clone> BuildLocks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, key: &ReportKey) -> BuildClaim<T> {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(key) {
            debug!(key = %key, "build already in flight");
            return BuildClaim::InFlight(BuildWaiter { rx: slot.rx.clone(), started: slot.started });
        }

        let (tx, rx) = watch::channel(None);
        let started = Instant::now();
        slots.insert(key.clone(), Slot { rx, started });
        BuildClaim::Acquired(BuildGuard {
            key: key.clone(),
            tx,
            started,
            slots: Arc::clone(&self.slots),
        })
    }

    /// Keys with a build currently running
    pub fn in_flight(&self) -> usize {
        lock(&self.slots).len()
    }
}

/// Exclusive right to build one key
pub struct BuildGuard<T> {
    key: ReportKey,
    tx: watch::Sender<Option<T>>,
    started: Instant,
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T> BuildGuard<T> {
    pub fn key(&self) -> &ReportKey {
        &self.key
    }

    /// When the key was claimed
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Hand the outcome to every waiter, then release the key.
    pub fn publish(self, outcome: T) {
        self.tx.send_replace(Some(outcome));
    }
}

impl<T> Drop for BuildGuard<T> {
    fn drop(&mut self) {
        lock(&self.slots).remove(&self.key);
        debug!(key = %self.key, "build lock released");
    }
}

pub struct BuildWaiter<T> {
    rx: watch::Receiver<Option<T>>,
    started: Instant,
}

impl<T: Clone> BuildWaiter<T> {
    /// When the build being awaited claimed its key, shared by every waiter
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Outcome of the running build, or `None` if it went away without one.
    pub async fn wait(mut self) -> Option<T> {
        match self.rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
    }
}
