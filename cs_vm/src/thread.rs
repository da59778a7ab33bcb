//! Thread bookkeeping and object monitors (spec.md §5, grounded on
//! `original_source/src/thread.cpp`'s thread table and
//! `original_source/src/synchronize.cpp`'s monitor implementation).
//! Each VM thread gets a small integer id used everywhere a thread
//! identity is needed (class-init ownership, monitor ownership,
//! GC safe-point tracking) instead of `std::thread::ThreadId`, which
//! can't be constructed by hand for tests or the main thread before
//! it's spawned.

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

use cs_model::ObjRef;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::error::{Result, VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Runnable,
    /// Parked at a GC safe point, waiting for the collector to finish
    /// its stop-the-world pause (spec.md §9's cooperative protocol).
    AtSafePoint,
    BlockedOnMonitor,
    Terminated,
}

pub struct ThreadManager {
    next_id: AtomicU64,
    statuses: Mutex<FxHashMap<u64, ThreadStatus>>,
    monitors: Mutex<FxHashMap<ObjRef, MonitorState>>,
    monitor_condvar: Condvar,
}

struct MonitorState {
    owner: u64,
    depth: u32,
}

impl ThreadManager {
    pub fn new() -> Self {
        ThreadManager {
            next_id: AtomicU64::new(1),
            statuses: Mutex::new(FxHashMap::default()),
            monitors: Mutex::new(FxHashMap::default()),
            monitor_condvar: Condvar::new(),
        }
    }

    pub fn register_thread(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.statuses.lock().insert(id, ThreadStatus::Runnable);
        id
    }

    pub fn set_status(&self, thread_id: u64, status: ThreadStatus) {
        self.statuses.lock().insert(thread_id, status);
    }

    pub fn terminate(&self, thread_id: u64) {
        self.set_status(thread_id, ThreadStatus::Terminated);
    }

    pub fn live_thread_count(&self) -> usize {
        self.statuses
            .lock()
            .values()
            .filter(|s| !matches!(s, ThreadStatus::Terminated))
            .count()
    }

    /// Ids of every thread that hasn't terminated — the GC's root-set
    /// driver needs this to know which published-roots entries to
    /// wait on (spec.md §9).
    pub fn live_ids(&self) -> Vec<u64> {
        self.statuses
            .lock()
            .iter()
            .filter(|(_, s)| !matches!(s, ThreadStatus::Terminated))
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn all_at_safe_point(&self) -> bool {
        self.statuses
            .lock()
            .values()
            .all(|s| matches!(s, ThreadStatus::AtSafePoint | ThreadStatus::Terminated))
    }

    /// Acquires `object`'s monitor for `thread_id`, blocking if held
    /// by another thread, and re-entering (bumping `depth`) if
    /// already held by this one — `monitorenter`'s exact semantics
    /// (spec.md §4's synchronization rules).
    pub fn monitor_enter(&self, object: ObjRef, thread_id: u64) {
        let mut monitors = self.monitors.lock();
        loop {
            match monitors.entry(object) {
                Entry::Vacant(slot) => {
                    slot.insert(MonitorState { owner: thread_id, depth: 1 });
                    return;
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().owner == thread_id {
                        slot.get_mut().depth += 1;
                        return;
                    }
                    self.monitor_condvar.wait(&mut monitors);
                }
            }
        }
    }

    /// Releases one level of `object`'s monitor held by `thread_id`.
    /// Errors if `thread_id` does not currently hold it — the
    /// `IllegalMonitorStateException` case (spec.md §4.2).
    pub fn monitor_exit(&self, object: ObjRef, thread_id: u64) -> Result<()> {
        let mut monitors = self.monitors.lock();
        match monitors.entry(object) {
            Entry::Occupied(mut slot) if slot.get().owner == thread_id => {
                slot.get_mut().depth -= 1;
                if slot.get().depth == 0 {
                    slot.remove();
                    self.monitor_condvar.notify_all();
                }
                Ok(())
            }
            _ => Err(VmError::fatal(format!(
                "thread {thread_id} is not the owner of monitor for {object:?}"
            ))),
        }
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_is_reentrant_for_the_same_thread() {
        let manager = ThreadManager::new();
        let obj = ObjRef::new(1, 0);
        manager.monitor_enter(obj, 42);
        manager.monitor_enter(obj, 42);
        manager.monitor_exit(obj, 42).unwrap();
        manager.monitor_exit(obj, 42).unwrap();
        assert!(manager.monitor_exit(obj, 42).is_err());
    }

    #[test]
    fn exit_by_non_owner_is_rejected() {
        let manager = ThreadManager::new();
        let obj = ObjRef::new(2, 0);
        manager.monitor_enter(obj, 1);
        assert!(manager.monitor_exit(obj, 2).is_err());
    }
}
