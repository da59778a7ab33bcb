//! The object heap: a generational arena of [`Object`]s addressed by
//! [`ObjRef`] handles, replacing the source VM's raw `Oop*` pointers
//! (`original_source/src/garbage_collect.cpp`'s `Oop` table) with
//! stable, GC-relocatable indices (spec.md §9's "stable addresses
//! (arena + index)" design note).

use cs_model::{ObjRef, Slot};
use parking_lot::Mutex;

use crate::class::ClassRef;
use crate::error::{Result, VmError};

/// The payload an [`ObjRef`] ultimately points to.
pub enum Object {
    /// A plain instance: one [`Slot`] per declared instance field,
    /// flattened across the whole superclass chain.
    Instance { class: ClassRef, fields: Vec<Slot> },
    /// A reference-typed array (`Object[]`, `String[][]`, ...).
    ObjectArray { class: ClassRef, elements: Vec<Slot> },
    /// A primitive-typed array (`int[]`, `byte[]`, ...), kept as
    /// [`Slot`]s rather than a packed byte buffer for uniformity with
    /// the interpreter's stack — a future optimization could pack
    /// `byte[]`/`char[]` tighter, but nothing in spec.md requires it.
    TypeArray { class: ClassRef, elements: Vec<Slot> },
    /// A heap-allocated `java/lang/String`-equivalent, kept distinct
    /// from a generic instance so the string pool can intern by
    /// content without walking declared fields.
    Str { class: ClassRef, value: String },
    /// A reified class/method/field descriptor (spec.md §3's
    /// "mirror object"). `class` is the mirror's own runtime class
    /// (`java/lang/Class`); `described` is a lookup key back to the
    /// artefact it reflects, not an owning edge — the class loader,
    /// not the mirror, owns `described` (spec.md §9's non-owning
    /// handle design note).
    Mirror { class: ClassRef, described: ClassRef },
}

impl Object {
    pub fn class(&self) -> &ClassRef {
        match self {
            Object::Instance { class, .. }
            | Object::ObjectArray { class, .. }
            | Object::TypeArray { class, .. }
            | Object::Str { class, .. }
            | Object::Mirror { class, .. } => class,
        }
    }

    pub fn array_length(&self) -> Option<usize> {
        match self {
            Object::ObjectArray { elements, .. } | Object::TypeArray { elements, .. } => Some(elements.len()),
            _ => None,
        }
    }

    pub fn described_class(&self) -> Option<&ClassRef> {
        match self {
            Object::Mirror { described, .. } => Some(described),
            _ => None,
        }
    }
}

struct Slot2 {
    generation: u32,
    /// `None` means the slot is free (either never used, or
    /// reclaimed by the last GC sweep).
    object: Option<Object>,
    /// Set once the finaliser thread has run (or queued) this
    /// object's `finalize` method, so a sweep never enqueues the
    /// same unreachable object twice (spec.md §4.6's "finalized bit
    /// clear" survivor check).
    finalized: bool,
}

/// The object table. A simple free-list arena: allocation reuses the
/// lowest-index free slot before growing, and the GC's sweep phase
/// (`gc.rs`) frees dead slots back into that list, bumping their
/// generation so any dangling [`ObjRef`] from before the sweep is
/// detected as stale rather than silently aliasing a new object.
pub struct Heap {
    inner: Mutex<HeapInner>,
}

struct HeapInner {
    slots: Vec<Slot2>,
    free_list: Vec<u32>,
    allocated_since_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            inner: Mutex::new(HeapInner {
                slots: Vec::new(),
                free_list: Vec::new(),
                allocated_since_gc: 0,
            }),
        }
    }

    pub fn allocate(&self, object: Object) -> ObjRef {
        let mut inner = self.inner.lock();
        inner.allocated_since_gc += 1;
        if let Some(index) = inner.free_list.pop() {
            let generation = inner.slots[index as usize].generation;
            inner.slots[index as usize].object = Some(object);
            inner.slots[index as usize].finalized = false;
            return ObjRef::new(index, generation);
        }
        let index = inner.slots.len() as u32;
        inner.slots.push(Slot2 {
            generation: 0,
            object: Some(object),
            finalized: false,
        });
        ObjRef::new(index, 0)
    }

    pub fn is_finalized(&self, handle: ObjRef) -> bool {
        let inner = self.inner.lock();
        inner
            .slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .map(|s| s.finalized)
            .unwrap_or(true)
    }

    pub fn mark_finalized(&self, handle: ObjRef) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation {
                slot.finalized = true;
            }
        }
    }

    pub fn with_object<T>(&self, handle: ObjRef, f: impl FnOnce(&Object) -> T) -> Result<T> {
        let inner = self.inner.lock();
        let slot = self.slot_for(&inner, handle)?;
        Ok(f(slot))
    }

    pub fn with_object_mut<T>(&self, handle: ObjRef, f: impl FnOnce(&mut Object) -> T) -> Result<T> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.object.as_mut())
            .ok_or_else(|| VmError::fatal(format!("dangling object reference {handle:?}")))?;
        Ok(f(slot))
    }

    fn slot_for<'a>(&self, inner: &'a HeapInner, handle: ObjRef) -> Result<&'a Object> {
        inner
            .slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.object.as_ref())
            .ok_or_else(|| VmError::fatal(format!("dangling object reference {handle:?}")))
    }

    /// Bytes currently in live use, approximated as one [`Slot`] per
    /// field/element — what `gc.rs` compares against
    /// `VmConfig::gc_memory_threshold` to decide whether to run a
    /// collection cycle.
    pub fn allocated_since_gc(&self) -> usize {
        self.inner.lock().allocated_since_gc
    }

    pub fn reset_allocation_counter(&self) {
        self.inner.lock().allocated_since_gc = 0;
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.object.is_some()).count()
    }

    /// Marks every live object's handle for the sweep phase to
    /// iterate; callers outside `gc.rs` should not normally need
    /// this, but `cs_class_printer`'s heap dump (if ever wired) would
    /// use it too.
    pub fn for_each_live(&self, mut f: impl FnMut(ObjRef, &Object)) {
        let inner = self.inner.lock();
        for (index, slot) in inner.slots.iter().enumerate() {
            if let Some(object) = &slot.object {
                f(ObjRef::new(index as u32, slot.generation), object);
            }
        }
    }

    /// Frees every slot not present in `reachable` (sorted indices),
    /// incrementing generations so stale handles are caught.
    /// `needs_finalize` is asked about each otherwise-dead object; an
    /// unreachable object it accepts *survives this cycle* instead of
    /// being destroyed — it's handed back as a finalize candidate for
    /// the caller to enqueue on the finaliser thread (spec.md §4.6:
    /// "a survivor this cycle ... enqueued to the finaliser thread").
    pub fn sweep(&self, reachable: &std::collections::HashSet<u32>, needs_finalize: impl Fn(&Object) -> bool) -> SweepResult {
        let mut inner = self.inner.lock();
        let mut reclaimed = 0;
        let mut finalize_candidates = Vec::new();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            let Some(object) = slot.object.as_ref() else { continue };
            if reachable.contains(&(index as u32)) {
                continue;
            }
            if !slot.finalized && needs_finalize(object) {
                finalize_candidates.push(ObjRef::new(index as u32, slot.generation));
                continue;
            }
            slot.object = None;
            slot.generation = slot.generation.wrapping_add(1);
            reclaimed += 1;
        }
        inner.free_list = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.object.is_none())
            .map(|(i, _)| i as u32)
            .collect();
        inner.allocated_since_gc = 0;
        SweepResult {
            reclaimed,
            finalize_candidates,
        }
    }
}

/// Outcome of one [`Heap::sweep`] pass.
pub struct SweepResult {
    pub reclaimed: usize,
    pub finalize_candidates: Vec<ObjRef>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use std::sync::Arc;

    fn dummy_class() -> ClassRef {
        Arc::new(Class::Primitive {
            name: "int".to_string(),
            slot_kind: cs_model::SlotKind::Int,
        })
    }

    #[test]
    fn allocate_and_read_back() {
        let heap = Heap::new();
        let handle = heap.allocate(Object::Str {
            class: dummy_class(),
            value: "hi".to_string(),
        });
        let value = heap
            .with_object(handle, |o| match o {
                Object::Str { value, .. } => value.clone(),
                _ => panic!("wrong variant"),
            })
            .unwrap();
        assert_eq!(value, "hi");
    }

    #[test]
    fn stale_handle_after_sweep_is_rejected() {
        let heap = Heap::new();
        let handle = heap.allocate(Object::Str {
            class: dummy_class(),
            value: "x".to_string(),
        });
        let result = heap.sweep(&std::collections::HashSet::new(), |_| false);
        assert_eq!(result.reclaimed, 1);
        assert!(heap.with_object(handle, |_| ()).is_err());
    }
}
