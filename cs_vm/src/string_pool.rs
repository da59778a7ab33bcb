//! String interning (spec.md §3's "string pool" component): `ldc` of
//! a `String` constant and `String.intern()` both funnel through
//! here so that two interned strings with equal content are the same
//! heap object, matching `==` identity semantics for literals.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use cs_model::ObjRef;

use crate::class::ClassRef;
use crate::heap::{Heap, Object};

#[derive(Default)]
pub struct StringPool {
    interned: Mutex<FxHashMap<String, ObjRef>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the interned handle for `value`, allocating a new heap
    /// string the first time this content is seen.
    pub fn intern(&self, heap: &Heap, string_class: &ClassRef, value: &str) -> ObjRef {
        let mut interned = self.interned.lock();
        if let Some(&handle) = interned.get(value) {
            return handle;
        }
        let handle = heap.allocate(Object::Str {
            class: string_class.clone(),
            value: value.to_string(),
        });
        interned.insert(value.to_string(), handle);
        handle
    }

    /// Removes entries whose handle was reclaimed by a GC sweep, so
    /// the pool doesn't keep growing with dangling references to
    /// strings nothing else can reach anymore. Run from the same
    /// stop-the-world pause that sweeps the heap.
    pub fn retain_live(&self, is_live: impl Fn(ObjRef) -> bool) {
        self.interned.lock().retain(|_, handle| is_live(*handle));
    }

    pub fn len(&self) -> usize {
        self.interned.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use std::sync::Arc;

    fn dummy_class() -> ClassRef {
        Arc::new(Class::Primitive {
            name: "java/lang/String".to_string(),
            slot_kind: cs_model::SlotKind::Reference,
        })
    }

    #[test]
    fn equal_content_interns_to_the_same_handle() {
        let heap = Heap::new();
        let pool = StringPool::new();
        let class = dummy_class();
        let a = pool.intern(&heap, &class, "hello");
        let b = pool.intern(&heap, &class, "hello");
        assert_eq!(a, b);
        let c = pool.intern(&heap, &class, "world");
        assert_ne!(a, c);
    }
}
