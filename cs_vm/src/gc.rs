//! Stop-the-world mark-sweep collector, grounded on
//! `original_source/src/garbage_collect.cpp`: a background thread
//! sleeps for a poll interval, and once allocated memory crosses a
//! threshold, requests a stop-the-world pause, collects roots (class
//! statics plus every live thread's frame references), marks
//! transitively, and sweeps.
//!
//! The source VM can reach into any `VMThread`'s live `Frame` chain
//! directly because frames are heap-allocated C++ objects owned by
//! the thread. Here, interpreter frames live on the native Rust call
//! stack of whichever OS thread is running them, so a GC thread can't
//! simply walk them. Instead each interpreter thread *publishes* a
//! snapshot of its current roots at cooperative safe points (method
//! entry and backward branches — the same points spec.md §9 names
//! for "checks a cooperative flag") and blocks there until the
//! collector clears the stop-the-world flag. This is the "safe-point
//! protocol" design note, realized without unsafe cross-thread
//! pointer access.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use cs_model::{ObjRef, Slot};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::class::{Class, ClassRef};
use crate::config::VmConfig;
use crate::heap::{Heap, Object};
use crate::string_pool::StringPool;

pub struct Gc {
    memory_threshold: usize,
    pub poll_interval: Duration,
    stop_wait_timeout: Duration,
    enable_log: bool,

    stop_the_world: AtomicBool,
    pause_barrier: Mutex<()>,
    pause_condvar: Condvar,
    published_roots: Mutex<FxHashMap<u64, Vec<ObjRef>>>,
    acknowledged: Mutex<HashSet<u64>>,

    sum_collected: AtomicUsize,
}

impl Gc {
    pub fn new(config: &VmConfig) -> Self {
        Gc {
            memory_threshold: config.gc_memory_threshold,
            poll_interval: config.gc_poll_interval,
            stop_wait_timeout: config.gc_stop_wait_timeout,
            enable_log: config.enable_gc_log,
            stop_the_world: AtomicBool::new(false),
            pause_barrier: Mutex::new(()),
            pause_condvar: Condvar::new(),
            published_roots: Mutex::new(FxHashMap::default()),
            acknowledged: Mutex::new(HashSet::new()),
            sum_collected: AtomicUsize::new(0),
        }
    }

    pub fn should_collect(&self, heap: &Heap) -> bool {
        heap.allocated_since_gc() * std::mem::size_of::<Slot>() > self.memory_threshold
    }

    /// Called by the interpreter at a safe point (method entry,
    /// backward branch) with a freshly computed snapshot of the
    /// calling thread's live references. If a collection is in
    /// progress, blocks until `start_the_world` releases it.
    pub fn poll_safe_point(&self, thread_id: u64, roots: impl FnOnce() -> Vec<ObjRef>) {
        if !self.stop_the_world.load(Ordering::Acquire) {
            return;
        }
        self.published_roots.lock().insert(thread_id, roots());
        self.acknowledged.lock().insert(thread_id);
        let mut guard = self.pause_barrier.lock();
        while self.stop_the_world.load(Ordering::Acquire) {
            self.pause_condvar.wait_for(&mut guard, self.stop_wait_timeout);
        }
    }

    /// Runs one collection cycle: requests a pause, waits for every
    /// live thread to publish roots, marks and sweeps, then resumes
    /// the world. `live_thread_ids` identifies who must check in
    /// before the sweep can proceed safely. `mirror_roots` is every
    /// loaded class's mirror object (spec.md §4.6 root (a)); unlike
    /// static fields and thread-published roots these never change
    /// shape mid-run, so the caller collects them once per cycle.
    /// Objects the sweep finds unreachable but still owed a
    /// `finalize` call are handed to `finalizer` instead of being
    /// destroyed.
    pub fn run(
        &self,
        heap: &Heap,
        string_pool: &StringPool,
        classes: &[ClassRef],
        mirror_roots: &[ObjRef],
        live_thread_ids: &[u64],
        finalizer: &crate::finalizer::Finalizer,
    ) {
        self.acknowledged.lock().clear();
        self.stop_the_world.store(true, Ordering::Release);

        let deadline = std::time::Instant::now() + self.stop_wait_timeout;
        while std::time::Instant::now() < deadline {
            if self.acknowledged.lock().len() >= live_thread_ids.len() {
                break;
            }
            std::thread::yield_now();
        }

        let mut roots = Vec::new();
        roots.extend_from_slice(mirror_roots);
        collect_class_static_roots(classes, &mut roots);
        for published in self.published_roots.lock().values() {
            roots.extend_from_slice(published);
        }

        let mut reachable = HashSet::new();
        for root in &roots {
            trace_mark(heap, *root, &mut reachable);
        }

        let before = heap.live_count();
        let result = heap.sweep(&reachable, |object| has_finalizer(object.class()));
        string_pool.retain_live(|handle| reachable.contains(&handle.index));
        for candidate in &result.finalize_candidates {
            finalizer.enqueue(*candidate);
        }

        self.sum_collected.fetch_add(result.reclaimed, Ordering::Relaxed);
        if self.enable_log {
            info!(
                before,
                after = before - result.reclaimed,
                reclaimed = result.reclaimed,
                finalize_pending = result.finalize_candidates.len(),
                "gc cycle complete"
            );
        } else {
            debug!(reclaimed = result.reclaimed, "gc cycle complete");
        }

        self.stop_the_world.store(false, Ordering::Release);
        self.pause_condvar.notify_all();
    }
}

fn collect_class_static_roots(classes: &[ClassRef], roots: &mut Vec<ObjRef>) {
    for class in classes {
        if let Class::Instance(instance) = class.as_ref() {
            for slot in instance.static_slots.read().iter() {
                if let Slot::Reference(Some(handle)) = slot {
                    roots.push(*handle);
                }
            }
        }
    }
}

fn trace_mark(heap: &Heap, handle: ObjRef, reachable: &mut HashSet<u32>) {
    if !reachable.insert(handle.index) {
        return;
    }
    let children: Vec<ObjRef> = heap
        .with_object(handle, |object| match object {
            Object::Instance { fields, .. } => slot_refs(fields),
            Object::ObjectArray { elements, .. } => slot_refs(elements),
            Object::TypeArray { .. } | Object::Str { .. } | Object::Mirror { .. } => Vec::new(),
        })
        .unwrap_or_default();
    for child in children {
        trace_mark(heap, child, reachable);
    }
}

fn slot_refs(slots: &[Slot]) -> Vec<ObjRef> {
    slots
        .iter()
        .filter_map(|s| match s {
            Slot::Reference(Some(handle)) => Some(*handle),
            _ => None,
        })
        .collect()
}

/// Whether `class` (or a superclass) declares a `finalize()V` that
/// isn't the trivial inherited one — spec.md §4.6's sweep-survivor
/// check. A class is only finalizable if *it* (not just
/// `java/lang/Object`) overrides the method.
fn has_finalizer(class: &ClassRef) -> bool {
    let Class::Instance(instance) = class.as_ref() else {
        return false;
    };
    if let Some(m) = instance.find_method("finalize", "()V") {
        return m.owner != "java/lang/Object";
    }
    match instance.super_class.read().clone() {
        Some(super_class) => has_finalizer(&super_class),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use std::sync::Arc;

    fn dummy_class() -> ClassRef {
        Arc::new(Class::Primitive {
            name: "Thing".to_string(),
            slot_kind: cs_model::SlotKind::Reference,
        })
    }

    #[test]
    fn sweep_reclaims_objects_unreachable_from_roots() {
        let heap = Heap::new();
        let string_pool = StringPool::new();
        let config = VmConfig::new("Main".to_string(), vec![], vec!["stub".to_string()]);
        let gc = Gc::new(&config);

        let leaf = heap.allocate(Object::Str {
            class: dummy_class(),
            value: "leaf".to_string(),
        });
        let root_obj = heap.allocate(Object::ObjectArray {
            class: dummy_class(),
            elements: vec![Slot::Reference(Some(leaf))],
        });
        let orphan = heap.allocate(Object::Str {
            class: dummy_class(),
            value: "orphan".to_string(),
        });

        let mut reachable = HashSet::new();
        trace_mark(&heap, root_obj, &mut reachable);
        assert!(reachable.contains(&root_obj.index));
        assert!(reachable.contains(&leaf.index));
        assert!(!reachable.contains(&orphan.index));

        let result = heap.sweep(&reachable, |_| false);
        assert_eq!(result.reclaimed, 1);
        assert!(result.finalize_candidates.is_empty());
        let _ = gc;
        let _ = string_pool;
    }
}
