//! The dedicated finaliser worker (spec.md §4.6), grounded on
//! `original_source/src/garbage_collect.cpp`'s `FinalizeRunner`: a
//! work queue fed by the sweep phase, drained one object at a time by
//! a daemon thread that re-enters the interpreter to run each
//! object's `finalize()V` before marking it finalized.
//!
//! The finaliser thread is itself a managed thread for safe-point
//! purposes (spec.md §5): it participates in the stop-for-collect
//! protocol exactly like any interpreted thread, polling between
//! dequeues rather than while blocked holding VM state.

use std::collections::VecDeque;

use cs_model::ObjRef;
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

/// A single pending finalisation request.
struct PendingFinalize {
    object: ObjRef,
}

/// The finaliser's work queue plus its wakeup condition. Kept
/// separate from [`crate::thread::ThreadManager`] since the queue's
/// producer (the GC sweep) and consumer (the finaliser thread) share
/// no other state.
pub struct Finalizer {
    queue: Mutex<VecDeque<PendingFinalize>>,
    condvar: Condvar,
}

impl Finalizer {
    pub fn new() -> Self {
        Finalizer {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
        }
    }

    /// Called from the GC sweep phase for every unreachable object
    /// that still owes a `finalize` call.
    pub fn enqueue(&self, object: ObjRef) {
        self.queue.lock().push_back(PendingFinalize { object });
        self.condvar.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Pops the next pending object, or blocks until one arrives or
    /// `should_stop` reports the VM is exiting. Returns `None` only
    /// when told to stop with nothing queued.
    pub fn dequeue_or_wait(&self, should_stop: impl Fn() -> bool) -> Option<ObjRef> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(pending) = queue.pop_front() {
                return Some(pending.object);
            }
            if should_stop() {
                return None;
            }
            self.condvar.wait_for(&mut queue, std::time::Duration::from_millis(100));
        }
    }

    /// Wakes a thread blocked in [`Self::dequeue_or_wait`] so it can
    /// observe a GC pause or VM shutdown promptly.
    pub fn notify(&self) {
        self.condvar.notify_all();
    }
}

impl Default for Finalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the finaliser thread's body: dequeue, invoke `finalize`
/// through the ordinary interpreter entry point, mark finalized,
/// repeat until told to stop. `invoke_finalize` is supplied by
/// `vm.rs` since it needs the full `Vm` (class loader, heap,
/// interpreter) that this module doesn't depend on directly.
pub fn run_finalizer_loop(
    finalizer: &Finalizer,
    heap: &crate::heap::Heap,
    should_stop: impl Fn() -> bool,
    mut invoke_finalize: impl FnMut(ObjRef),
) {
    loop {
        let Some(object) = finalizer.dequeue_or_wait(&should_stop) else {
            return;
        };
        trace!(?object.index, "running finalize()");
        invoke_finalize(object);
        heap.mark_finalized(object);
        if should_stop() && finalizer.is_empty() {
            return;
        }
    }
}

#[allow(dead_code)]
fn log_dropped_finalizer_error(object: ObjRef, err: impl std::fmt::Display) {
    // spec.md §7: "Finaliser exceptions are logged and discarded."
    warn!(?object.index, %err, "finalize() raised an exception; discarding");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_dequeue_returns_the_object() {
        let finalizer = Finalizer::new();
        let handle = ObjRef::new(3, 0);
        finalizer.enqueue(handle);
        let got = finalizer.dequeue_or_wait(|| true);
        assert_eq!(got, Some(handle));
    }

    #[test]
    fn dequeue_on_empty_queue_with_stop_returns_none() {
        let finalizer = Finalizer::new();
        assert_eq!(finalizer.dequeue_or_wait(|| true), None);
    }
}
