//! Time-bounded cache of command executions.
//!
//! Each distinct program + argument vector gets one slot. The first request
//! for a key executes synchronously and spawns the key's single background
//! refresher, which re-runs the command whenever the slot's TTL elapses (or
//! sooner, when a caller asks for fresher data than the cache holds) and
//! wakes every blocked caller. Slots live for the daemon's lifetime: no
//! eviction and no invalidation, by design.
//!
//! Locking: the slots map is a coarse lock held only for insert/lookup;
//! slot contents have their own lock so unrelated keys never serialize.
//! The creator's first run happens while holding the slot lock, which is
//! what guarantees racing first callers execute the process exactly once.
//! The refresher executes with no locks held and stores under the slot lock.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::executor::{CommandExecutor, ExecutionRecord};

/// How often a blocked caller re-checks its cancellation probe.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Structural identity of a cached invocation. Program and arguments are
/// compared as a vector, not as a printed shell string, so quoting quirks
/// cannot collide two different invocations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The process could not be started; never cached as a result.
    #[error("Failed to launch {program}: {details}")]
    Launch { program: String, details: String },

    #[error("Wait for a cache refresh was cancelled")]
    Cancelled,
}

#[derive(Debug)]
struct SlotState {
    /// Most recent run, regardless of exit code.
    last_result: Option<ExecutionRecord>,
    /// Most recent run that exited zero.
    last_success: Option<ExecutionRecord>,
    /// Launch failure from the most recent refresh attempt, if any.
    last_launch_error: Option<String>,
    last_run_at: Option<Instant>,
    /// Minimum freshness window ever requested for this key, floored.
    ttl: Duration,
    /// Bumped after every refresher run; blocked callers wait on it.
    generation: u64,
    /// Generation that produced `last_success`.
    success_generation: u64,
    refresh_requested: bool,
    /// First-run launch failure; the slot is dead and removed from the map.
    defunct: bool,
}

struct CacheSlot {
    state: Mutex<SlotState>,
    /// Caller -> refresher: a refresh was requested.
    refresh_wake: Condvar,
    /// Refresher -> callers: generation advanced.
    result_ready: Condvar,
}

impl CacheSlot {
    fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(SlotState {
                last_result: None,
                last_success: None,
                last_launch_error: None,
                last_run_at: None,
                ttl,
                generation: 0,
                success_generation: 0,
                refresh_requested: false,
                defunct: false,
            }),
            refresh_wake: Condvar::new(),
            result_ready: Condvar::new(),
        }
    }
}

impl SlotState {
    fn store_run(&mut self, record: ExecutionRecord) {
        self.last_run_at = Some(Instant::now());
        self.generation = self.generation.wrapping_add(1);
        if record.return_code == 0 {
            self.last_success = Some(record.clone());
            self.success_generation = self.generation;
        }
        self.last_result = Some(record);
        self.last_launch_error = None;
        // A request that arrived mid-run is satisfied by this result.
        self.refresh_requested = false;
    }

    fn store_launch_error(&mut self, details: String) {
        self.last_run_at = Some(Instant::now());
        self.last_launch_error = Some(details);
        self.generation = self.generation.wrapping_add(1);
        self.refresh_requested = false;
    }
}

pub struct CommandCache {
    executor: Arc<dyn CommandExecutor>,
    ttl_floor: Duration,
    slots: Mutex<HashMap<CacheKey, Arc<CacheSlot>>>,
}

impl CommandCache {
    pub fn new(executor: Arc<dyn CommandExecutor>, ttl_floor: Duration) -> Self {
        Self {
            executor,
            ttl_floor,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Serves a result for `key` no older than `within`.
    ///
    /// `any` accepts the most recent run regardless of exit code; otherwise
    /// only a run that exited zero qualifies, and the caller blocks until one
    /// exists (or `cancelled` reports true). The first call for a key always
    /// executes synchronously.
    pub fn get(
        &self,
        key: &CacheKey,
        within: Duration,
        any: bool,
        cancelled: &mut dyn FnMut() -> bool,
    ) -> Result<ExecutionRecord, CacheError> {
        let requested_ttl = within.max(self.ttl_floor);
        let (slot, creator) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.entry(key.clone()) {
                MapEntry::Occupied(entry) => (Arc::clone(entry.get()), false),
                MapEntry::Vacant(entry) => {
                    let slot = Arc::new(CacheSlot::new(requested_ttl));
                    entry.insert(Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
        if creator {
            // No usable data can exist yet; racing callers for the same key
            // queue on the slot lock and observe whatever this run stores.
            match self.executor.run(&key.program, &key.args) {
                Ok(record) => {
                    state.store_run(record);
                    drop(state);
                    slot.result_ready.notify_all();
                    self.spawn_refresher(key, &slot);
                    state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
                }
                Err(err) => {
                    let details = err.to_string();
                    state.defunct = true;
                    state.last_launch_error = Some(details.clone());
                    drop(state);
                    slot.result_ready.notify_all();
                    self.forget(key, &slot);
                    return Err(CacheError::Launch {
                        program: key.program.clone(),
                        details,
                    });
                }
            }
        }

        // The effective TTL is the minimum ever requested, never lengthened.
        // The refresher may be mid-sleep on the old, longer cadence.
        if requested_ttl < state.ttl {
            state.ttl = requested_ttl;
            slot.refresh_wake.notify_one();
        }

        loop {
            if state.defunct {
                return Err(CacheError::Launch {
                    program: key.program.clone(),
                    details: state.last_launch_error.clone().unwrap_or_default(),
                });
            }

            let candidate = if any {
                state.last_result.as_ref()
            } else {
                state.last_success.as_ref()
            };
            if let Some(record) = candidate {
                if record.completed_at.elapsed() <= within {
                    return Ok(record.clone());
                }
            }

            // Nothing fresh enough: ask the refresher for a run and block
            // until the generation advances. At generation zero the first
            // run is already in flight; just wait for it.
            if state.generation > 0 {
                state.refresh_requested = true;
                slot.refresh_wake.notify_one();
            }
            let seen = state.generation;
            while state.generation == seen && !state.defunct {
                if cancelled() {
                    return Err(CacheError::Cancelled);
                }
                let (guard, _timeout) = slot
                    .result_ready
                    .wait_timeout(state, WAIT_SLICE)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
            }

            if !state.defunct {
                if any {
                    if let Some(details) = state.last_launch_error.clone() {
                        return Err(CacheError::Launch {
                            program: key.program.clone(),
                            details,
                        });
                    }
                    if let Some(record) = &state.last_result {
                        // The newly produced result, whatever its exit code.
                        return Ok(record.clone());
                    }
                } else if state.success_generation > seen {
                    if let Some(record) = &state.last_success {
                        // A success produced by the run just waited out is
                        // as fresh as it gets, even for a zero window.
                        return Ok(record.clone());
                    }
                }
            }
            // Success-only callers loop until a fresh success shows up.
        }
    }

    fn spawn_refresher(&self, key: &CacheKey, slot: &Arc<CacheSlot>) {
        let executor = Arc::clone(&self.executor);
        let key = key.clone();
        let slot = Arc::clone(slot);
        let floor = self.ttl_floor;
        let spawned = thread::Builder::new()
            .name(format!("cache-refresh:{}", key.program))
            .spawn(move || refresh_loop(executor, key, slot, floor));
        if let Err(err) = spawned {
            tracing::error!(error = %err, "Failed to spawn cache refresher");
        }
    }

    /// Drops a slot that never produced data, so the next request retries
    /// from scratch. Only removes it if the map still points at this slot.
    fn forget(&self, key: &CacheKey, slot: &Arc<CacheSlot>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slots.get(key) {
            if Arc::ptr_eq(current, slot) {
                slots.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn ttl_of(&self, key: &CacheKey) -> Option<Duration> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).map(|slot| {
            slot.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .ttl
        })
    }
}

/// One long-lived loop per cache key: sleep until the TTL elapses or a
/// caller requests a refresh, re-run the command, store, wake everyone.
/// The floor rate-limits back-to-back runs even under constant requests.
fn refresh_loop(
    executor: Arc<dyn CommandExecutor>,
    key: CacheKey,
    slot: Arc<CacheSlot>,
    floor: Duration,
) {
    loop {
        {
            let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                let since_last = state
                    .last_run_at
                    .map(|at| at.elapsed())
                    .unwrap_or(floor);
                if since_last < floor {
                    let (guard, _timeout) = slot
                        .refresh_wake
                        .wait_timeout(state, floor - since_last)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    continue;
                }
                if state.refresh_requested || since_last >= state.ttl {
                    state.refresh_requested = false;
                    break;
                }
                let timeout = state.ttl - since_last;
                let (guard, _timeout) = slot
                    .refresh_wake
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
            }
        }

        // Execute with no locks held so fresh-enough readers are never
        // blocked behind a slow command.
        let outcome = executor.run(&key.program, &key.args);

        let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(record) => state.store_run(record),
            Err(err) => {
                tracing::warn!(program = %key.program, error = %err, "Cache refresh failed to launch");
                state.store_launch_error(err.to_string());
            }
        }
        drop(state);
        slot.result_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Floor small enough that refresh-driven tests finish quickly.
    const TEST_FLOOR: Duration = Duration::from_millis(10);

    enum Scripted {
        Run(&'static str, i32),
        LaunchFail,
    }

    struct FakeExecutor {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Scripted>>,
        default: (&'static str, i32),
    }

    impl FakeExecutor {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into()),
                default: ("fresh", 0),
            })
        }

        fn with_default(stdout: &'static str, code: i32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                default: (stdout, code),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CommandExecutor for FakeExecutor {
        fn run(&self, program: &str, _args: &[String]) -> Result<ExecutionRecord, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let (stdout, return_code) = match next {
                Some(Scripted::Run(stdout, code)) => (stdout, code),
                Some(Scripted::LaunchFail) => {
                    return Err(CoreError::Launch {
                        program: program.to_string(),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                    })
                }
                None => self.default,
            };
            Ok(ExecutionRecord {
                stdout: stdout.to_string(),
                stderr: String::new(),
                return_code,
                completed_at: Instant::now(),
            })
        }
    }

    fn key(program: &str) -> CacheKey {
        CacheKey {
            program: program.to_string(),
            args: vec![],
        }
    }

    fn never_cancelled() -> impl FnMut() -> bool {
        || false
    }

    #[test]
    fn second_call_within_window_does_not_re_execute() {
        let executor = FakeExecutor::new(vec![Scripted::Run("hi\n", 0)]);
        let cache = CommandCache::new(executor.clone(), TEST_FLOOR);
        let key = key("echo");

        let first = cache
            .get(&key, Duration::from_secs(60), false, &mut never_cancelled())
            .expect("first call");
        let second = cache
            .get(&key, Duration::from_secs(60), false, &mut never_cancelled())
            .expect("second call");

        assert_eq!(first.stdout, "hi\n");
        assert_eq!(second.stdout, "hi\n");
        assert_eq!(executor.calls(), 1);
    }

    #[test]
    fn racing_first_callers_execute_exactly_once() {
        let executor = FakeExecutor::new(vec![Scripted::Run("once", 0)]);
        let cache = Arc::new(CommandCache::new(executor.clone(), TEST_FLOOR));
        let key = key("slow-tool");

        let mut callers = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            callers.push(thread::spawn(move || {
                cache
                    .get(&key, Duration::from_secs(60), true, &mut || false)
                    .expect("racing call")
            }));
        }
        for caller in callers {
            assert_eq!(caller.join().expect("caller panicked").stdout, "once");
        }
        assert_eq!(executor.calls(), 1);
    }

    #[test]
    fn stale_entry_blocks_for_a_fresh_run() {
        let executor = FakeExecutor::new(vec![Scripted::Run("old", 0), Scripted::Run("new", 0)]);
        let cache = CommandCache::new(executor.clone(), TEST_FLOOR);
        let key = key("date");

        let first = cache
            .get(&key, Duration::from_secs(60), true, &mut never_cancelled())
            .expect("populate");
        assert_eq!(first.stdout, "old");

        // A zero window can never be satisfied by the stored run, so this
        // call must ride the next refresh.
        let second = cache
            .get(&key, Duration::ZERO, true, &mut never_cancelled())
            .expect("refresh");
        assert_eq!(second.stdout, "new");
        assert!(executor.calls() >= 2);
    }

    #[test]
    fn success_only_caller_waits_out_failed_runs() {
        let executor = FakeExecutor::new(vec![Scripted::Run("bad", 1), Scripted::Run("good", 0)]);
        let cache = CommandCache::new(executor.clone(), TEST_FLOOR);
        let key = key("flaky");

        let first = cache
            .get(&key, Duration::from_secs(60), true, &mut never_cancelled())
            .expect("populate");
        assert_eq!(first.return_code, 1);

        let success = cache
            .get(&key, Duration::from_secs(60), false, &mut never_cancelled())
            .expect("should wait for a successful run");
        assert_eq!(success.return_code, 0);
        assert!(executor.calls() >= 2);
    }

    #[test]
    fn success_only_wait_is_cancellable() {
        let executor = FakeExecutor::with_default("nope", 1);
        let cache = Arc::new(CommandCache::new(executor, TEST_FLOOR));
        let key = key("always-failing");

        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let cache = Arc::clone(&cache);
            let cancel = Arc::clone(&cancel);
            let key = key.clone();
            thread::spawn(move || {
                cache.get(&key, Duration::from_secs(60), false, &mut || {
                    cancel.load(Ordering::SeqCst)
                })
            })
        };

        thread::sleep(Duration::from_millis(100));
        cancel.store(true, Ordering::SeqCst);
        let result = waiter.join().expect("waiter panicked");
        assert!(matches!(result, Err(CacheError::Cancelled)));
    }

    #[test]
    fn zero_window_success_caller_is_served_by_the_next_run() {
        let executor = FakeExecutor::with_default("now", 0);
        let cache = Arc::new(CommandCache::new(executor.clone(), TEST_FLOOR));
        let key = key("date");

        // A zero window rejects every stored run, so the caller must ride
        // the next refresh and take the success it produces.
        let caller = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            thread::spawn(move || cache.get(&key, Duration::ZERO, false, &mut || false))
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while !caller.is_finished() {
            assert!(Instant::now() < deadline, "caller was never served");
            thread::sleep(Duration::from_millis(10));
        }
        let record = caller.join().expect("caller panicked").expect("success");
        assert_eq!(record.return_code, 0);
        assert!(executor.calls() >= 2);
    }

    #[test]
    fn tightened_ttl_reschedules_a_sleeping_refresher() {
        let executor = FakeExecutor::with_default("x", 0);
        let cache = CommandCache::new(executor.clone(), TEST_FLOOR);
        let key = key("kubectl");

        cache
            .get(&key, Duration::from_secs(60), true, &mut never_cancelled())
            .expect("populate");
        assert_eq!(executor.calls(), 1);

        // Served fresh, but the tightened window must still reach the
        // refresher mid-sleep rather than after the sixty-second cycle.
        cache
            .get(&key, Duration::from_millis(100), true, &mut never_cancelled())
            .expect("fresh hit");

        let deadline = Instant::now() + Duration::from_secs(2);
        while executor.calls() < 2 {
            assert!(Instant::now() < deadline, "refresher kept the old cadence");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn launch_failure_is_an_error_and_is_not_cached() {
        let executor = FakeExecutor::new(vec![Scripted::LaunchFail, Scripted::Run("ok", 0)]);
        let cache = CommandCache::new(executor.clone(), TEST_FLOOR);
        let key = key("missing-binary");

        let first = cache.get(&key, Duration::from_secs(60), true, &mut never_cancelled());
        assert!(matches!(first, Err(CacheError::Launch { .. })));

        // The failed attempt left nothing behind; the retry executes anew.
        let second = cache
            .get(&key, Duration::from_secs(60), true, &mut never_cancelled())
            .expect("retry after launch failure");
        assert_eq!(second.stdout, "ok");
        assert_eq!(executor.calls(), 2);
    }

    #[test]
    fn ttl_is_the_minimum_ever_requested_with_a_floor() {
        let executor = FakeExecutor::with_default("x", 0);
        let cache = CommandCache::new(executor, Duration::from_secs(4));
        let key = key("kubectl");

        cache
            .get(&key, Duration::from_secs(60), true, &mut never_cancelled())
            .expect("populate");
        assert_eq!(cache.ttl_of(&key), Some(Duration::from_secs(60)));

        cache
            .get(&key, Duration::from_secs(5), true, &mut never_cancelled())
            .expect("tighten");
        assert_eq!(cache.ttl_of(&key), Some(Duration::from_secs(5)));

        // A longer request never widens it back out.
        cache
            .get(&key, Duration::from_secs(30), true, &mut never_cancelled())
            .expect("no widening");
        assert_eq!(cache.ttl_of(&key), Some(Duration::from_secs(5)));

        // And a shorter one is clamped at the floor.
        cache
            .get(&key, Duration::from_secs(1), true, &mut never_cancelled())
            .expect("clamp");
        assert_eq!(cache.ttl_of(&key), Some(Duration::from_secs(4)));
    }
}
