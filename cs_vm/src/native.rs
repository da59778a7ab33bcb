//! Native-method registry (spec.md §5): bridges declared-`native`
//! Java methods to Rust closures, keyed by `(owner, name, descriptor)`
//! exactly as `original_source/src/native/native.cpp`'s registration
//! table does before handing dispatch to it. Only the small set of
//! bootstrap natives needed to get a class loaded and running are
//! registered by default (`registerNatives`, `initIDs`, and the
//! handful of `System`/`Object` natives every program's startup path
//! touches); anything else is left for embedders to register.

use cs_model::Slot;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::vm::Vm;

pub type NativeFn = fn(&Vm, u64, &[Slot]) -> Result<Option<Slot>>;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct NativeKey {
    owner: &'static str,
    name: &'static str,
    descriptor: &'static str,
}

#[derive(Default)]
pub struct NativeRegistry {
    table: FxHashMap<NativeKey, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        let mut registry = NativeRegistry::default();
        registry.register_bootstrap_natives();
        registry
    }

    pub fn register(&mut self, owner: &'static str, name: &'static str, descriptor: &'static str, f: NativeFn) {
        self.table.insert(NativeKey { owner, name, descriptor }, f);
    }

    pub fn lookup(&self, owner: &str, name: &str, descriptor: &str) -> Option<NativeFn> {
        // Lookup happens by transient borrowed strings, so rebuild the
        // lookup key manually rather than constructing a `NativeKey`
        // with borrowed `&'static str`s we don't have.
        self.table
            .iter()
            .find(|(k, _)| k.owner == owner && k.name == name && k.descriptor == descriptor)
            .map(|(_, f)| *f)
    }

    fn register_bootstrap_natives(&mut self) {
        self.register("java/lang/Object", "registerNatives", "()V", no_op);
        self.register("java/lang/System", "registerNatives", "()V", no_op);
        self.register("java/lang/Object", "hashCode", "()I", object_hash_code);
        self.register(
            "java/lang/System",
            "currentTimeMillis",
            "()J",
            current_time_millis,
        );
        self.register("java/lang/System", "nanoTime", "()J", nano_time);
    }
}

fn no_op(_vm: &Vm, _thread_id: u64, _args: &[Slot]) -> Result<Option<Slot>> {
    Ok(None)
}

fn object_hash_code(_vm: &Vm, _thread_id: u64, args: &[Slot]) -> Result<Option<Slot>> {
    let this = args.first().and_then(|s| s.as_reference()).flatten();
    let hash = this.map(|r| r.index as i32).unwrap_or(0);
    Ok(Some(Slot::Int(hash)))
}

fn current_time_millis(vm: &Vm, _thread_id: u64, _args: &[Slot]) -> Result<Option<Slot>> {
    let millis = vm.wall_clock_millis();
    Ok(Some(Slot::Long(millis)))
}

fn nano_time(vm: &Vm, _thread_id: u64, _args: &[Slot]) -> Result<Option<Slot>> {
    let nanos = vm.monotonic_nanos();
    Ok(Some(Slot::Long(nanos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_natives_are_registered() {
        let registry = NativeRegistry::new();
        assert!(registry.lookup("java/lang/Object", "registerNatives", "()V").is_some());
        assert!(registry.lookup("java/lang/Object", "nonexistent", "()V").is_none());
    }
}
