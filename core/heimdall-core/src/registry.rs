//! In-memory registry of currently running, heimdall-aware shell commands.
//!
//! Shell hooks report `start` and `end`; in between, other processes may
//! list the live entries or block until a particular one finishes. Entries
//! are only ever removed by an explicit `end` — there is no expiry.
//!
//! Each entry carries a one-shot broadcast latch (`Mutex<bool>` + `Condvar`)
//! standing in for the closed-channel idiom: `end` fires it exactly once and
//! every concurrent waiter is released. The registry-wide lock is never held
//! while a waiter blocks.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;

/// How often a blocked waiter re-checks its cancellation probe.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// One in-flight shell command.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningCommand {
    pub id: String,
    pub command: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The command finished (or was never/no longer live, which counts).
    Completed,
    Cancelled,
}

/// Single-fire, multi-waiter completion signal.
#[derive(Debug, Default)]
struct DoneLatch {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl DoneLatch {
    fn fire(&self) {
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        *fired = true;
        self.cv.notify_all();
    }

    fn wait(&self, cancelled: &mut dyn FnMut() -> bool) -> WaitOutcome {
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *fired {
                return WaitOutcome::Completed;
            }
            if cancelled() {
                return WaitOutcome::Cancelled;
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(fired, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner);
            fired = guard;
        }
    }
}

struct LiveEntry {
    command: RunningCommand,
    done: Arc<DoneLatch>,
}

#[derive(Default)]
pub struct CommandRegistry {
    live: Mutex<HashMap<String, LiveEntry>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a running command and returns its id.
    ///
    /// An empty/absent `supplied_id` gets a freshly minted one. A supplied id
    /// that is already live is treated as a client retry: the existing entry
    /// wins and its id is returned (ids are never reused while live).
    pub fn start(
        &self,
        command: &str,
        supplied_id: Option<&str>,
        start_time: Option<DateTime<Utc>>,
    ) -> String {
        let id = match supplied_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => mint_id(),
        };
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        match live.entry(id.clone()) {
            MapEntry::Occupied(_) => {
                tracing::debug!(id = %id, "Duplicate start for live id; keeping existing entry");
            }
            MapEntry::Vacant(slot) => {
                slot.insert(LiveEntry {
                    command: RunningCommand {
                        id: id.clone(),
                        command: command.to_string(),
                        start_time: start_time.unwrap_or_else(Utc::now),
                    },
                    done: Arc::new(DoneLatch::default()),
                });
            }
        }
        id
    }

    /// Marks a command as finished, releasing every blocked waiter.
    ///
    /// Returns the removed entry so the caller can feed the notification
    /// policy. Unknown or already-ended ids are a no-op (`None`), not an
    /// error — shell hooks misfire.
    pub fn end(&self, id: &str) -> Option<RunningCommand> {
        let entry = {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            live.remove(id)
        };
        entry.map(|entry| {
            entry.done.fire();
            entry.command
        })
    }

    /// Point-in-time snapshot of live entries, unordered.
    pub fn list(&self) -> Vec<RunningCommand> {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.values().map(|entry| entry.command.clone()).collect()
    }

    /// Blocks until `end(id)` is observed or `cancelled` reports true.
    ///
    /// Waiting on an id that is not live returns immediately with
    /// `Completed`: "already finished" is success, not an error.
    pub fn wait_for(&self, id: &str, cancelled: &mut dyn FnMut() -> bool) -> WaitOutcome {
        let done = {
            let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            match live.get(id) {
                Some(entry) => Arc::clone(&entry.done),
                None => return WaitOutcome::Completed,
            }
        };
        done.wait(cancelled)
    }
}

/// Mints an id unique across uncoordinated clients: epoch millis plus random
/// bits, not a counter.
fn mint_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let salt = rand::thread_rng().next_u64();
    format!("{:x}-{:08x}", millis, salt as u32)
}
