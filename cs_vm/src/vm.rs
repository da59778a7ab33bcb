//! The VM façade (spec.md §2 component 10): owns the class loader,
//! heap, string pool, thread manager, collector, finaliser, and
//! native registry, and is the single place the interpreter and JIT
//! reach into shared state from. Grounded on
//! `original_source/src/vm.cpp`'s `VM` singleton — same owned
//! subsystems, same "start the main thread, run the platform's
//! system-init method, then a user entry point, then join" sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use cs_model::{FieldAccessFlags, ObjRef, Slot, SlotKind};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::class::{Class, ClassRef};
use crate::classpath::{ClassPath, DirClassPath};
use crate::config::VmConfig;
use crate::error::{Result, VmError};
use crate::finalizer::Finalizer;
use crate::frame::Frame;
use crate::gc::Gc;
use crate::heap::{Heap, Object};
use crate::interpreter::{self, FrameOutcome};
use crate::loader::ClassLoader;
use crate::native::NativeRegistry;
use crate::string_pool::StringPool;
use crate::thread::ThreadManager;

pub struct Vm {
    loader: ClassLoader,
    heap: Heap,
    string_pool: StringPool,
    threads: ThreadManager,
    gc: Gc,
    finalizer: Finalizer,
    natives: RwLock<NativeRegistry>,
    config: VmConfig,
    mirrors: RwLock<FxHashMap<String, ObjRef>>,
    start_instant: Instant,
    shutting_down: AtomicBool,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let class_path: Box<dyn ClassPath> = Box::new(DirClassPath::new(config.class_path.clone()));
        Self::new_with_class_path(config, class_path)
    }

    pub fn new_with_class_path(config: VmConfig, class_path: Box<dyn ClassPath>) -> Self {
        let gc = Gc::new(&config);
        Vm {
            loader: ClassLoader::new(class_path),
            heap: Heap::new(),
            string_pool: StringPool::new(),
            threads: ThreadManager::new(),
            gc,
            finalizer: Finalizer::new(),
            natives: RwLock::new(NativeRegistry::new()),
            config,
            mirrors: RwLock::new(FxHashMap::default()),
            start_instant: Instant::now(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn loader(&self) -> &ClassLoader {
        &self.loader
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    pub fn string_pool(&self) -> &StringPool {
        &self.string_pool
    }

    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn natives(&self) -> &RwLock<NativeRegistry> {
        &self.natives
    }

    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    /// Returns the cached mirror object for `class`, allocating one
    /// the first time it's asked for (spec.md §3: "a class's mirror
    /// ... is allocated exactly once and is a GC root while the class
    /// is loaded"). The mirror's own runtime class is
    /// `java/lang/Class`; if that bootstrap class can't be resolved
    /// (e.g. a minimal classpath in tests), `class` itself stands in
    /// so the mirror object is still usable as a monitor target and
    /// `instanceof`/equality key.
    pub fn class_mirror(&self, class: &ClassRef) -> ObjRef {
        let name = class.name().to_string();
        let mut mirrors = self.mirrors.write();
        if let Some(&handle) = mirrors.get(&name) {
            return handle;
        }
        let mirror_class = self.loader.resolve_class("java/lang/Class").unwrap_or_else(|_| class.clone());
        let handle = self.heap.allocate(Object::Mirror {
            class: mirror_class,
            described: class.clone(),
        });
        mirrors.insert(name, handle);
        handle
    }

    pub fn object_class(&self, handle: ObjRef) -> Result<ClassRef> {
        self.heap.with_object(handle, |o| o.class().clone())
    }

    /// Resolves a constant-pool `Class` index (an exception table
    /// entry's catch type, or a `checkcast`/`instanceof` operand)
    /// against `owner`'s own constant pool.
    pub fn resolve_catch_type(&self, owner: &ClassRef, cp_index: u16) -> Result<ClassRef> {
        let Class::Instance(ic) = owner.as_ref() else {
            return Err(VmError::fatal("catch type lookup outside an instance class"));
        };
        let name = ic.constant_pool.class_name(cp_index)?.to_string();
        self.loader.resolve_class(&name)
    }

    /// spec.md §4.1: "search the owner and its superclass chain for
    /// instance members". Returns the declaring class, the field's
    /// *absolute* offset into the flattened per-object fields vector
    /// (superclass slots first), and its slot kind.
    pub fn resolve_instance_field(&self, class: &ClassRef, name: &str) -> Option<(ClassRef, usize, SlotKind)> {
        let mut cur = Some(class.clone());
        while let Some(c) = cur {
            let Class::Instance(ic) = c.as_ref() else { break };
            if let Some(f) = ic.fields.iter().find(|f| f.name == name && !f.access_flags.contains(FieldAccessFlags::STATIC)) {
                let base = *ic.instance_slot_base.read();
                return Some((c.clone(), base + f.slot_index, f.slot_kind));
            }
            cur = ic.super_class.read().clone();
        }
        None
    }

    /// Statics live on the declaring class itself, never flattened
    /// across the hierarchy, so the offset is the field's own
    /// `slot_index` with no base to add.
    pub fn resolve_static_field(&self, class: &ClassRef, name: &str) -> Option<(ClassRef, usize, SlotKind)> {
        let mut cur = Some(class.clone());
        while let Some(c) = cur {
            let Class::Instance(ic) = c.as_ref() else { break };
            if let Some(f) = ic.fields.iter().find(|f| f.name == name && f.access_flags.contains(FieldAccessFlags::STATIC)) {
                return Some((c.clone(), f.slot_index, f.slot_kind));
            }
            cur = ic.super_class.read().clone();
        }
        None
    }

    /// spec.md §4.1: "the owner and interfaces for interface
    /// methods" — first the instance/superclass chain (covers
    /// virtual, special, and static dispatch), then a depth-first
    /// walk of implemented interfaces.
    pub fn resolve_method(&self, class: &ClassRef, name: &str, descriptor: &str) -> Option<(ClassRef, usize)> {
        let mut cur = Some(class.clone());
        while let Some(c) = cur {
            let Class::Instance(ic) = c.as_ref() else { break };
            if let Some(idx) = ic.methods.iter().position(|m| m.name == name && m.descriptor.to_string() == descriptor) {
                return Some((c.clone(), idx));
            }
            cur = ic.super_class.read().clone();
        }
        self.resolve_interface_method(class, name, descriptor)
    }

    fn resolve_interface_method(&self, class: &ClassRef, name: &str, descriptor: &str) -> Option<(ClassRef, usize)> {
        let Class::Instance(ic) = class.as_ref() else { return None };
        for iface in ic.interfaces.read().iter() {
            if let Class::Instance(iic) = iface.as_ref() {
                if let Some(idx) = iic.methods.iter().position(|m| m.name == name && m.descriptor.to_string() == descriptor) {
                    return Some((iface.clone(), idx));
                }
            }
            if let Some(found) = self.resolve_interface_method(iface, name, descriptor) {
                return Some(found);
            }
        }
        if let Some(super_class) = ic.super_class.read().clone() {
            return self.resolve_interface_method(&super_class, name, descriptor);
        }
        None
    }

    /// Drives `<clinit>` through the loader's state machine (spec.md
    /// §4.1/§4.3); `run_clinit` is the loader's callback into this
    /// VM's own interpreter entry point.
    pub fn ensure_initialised(&self, class: &ClassRef, thread_id: u64) -> Result<()> {
        self.loader.ensure_initialised(class, thread_id, &|c| self.run_clinit(c, thread_id))
    }

    fn run_clinit(&self, class: &ClassRef, thread_id: u64) -> Result<()> {
        let Class::Instance(ic) = class.as_ref() else { return Ok(()) };
        let Some(index) = ic.methods.iter().position(|m| m.name == "<clinit>") else {
            return Ok(());
        };
        match self.invoke_method(thread_id, class, index, Vec::new())? {
            FrameOutcome::Returned(_) => Ok(()),
            FrameOutcome::Threw(obj) => Err(VmError::fatal(format!(
                "<clinit> for {} threw (object #{})",
                ic.name, obj.index
            ))),
        }
    }

    /// Invokes `class.methods[method_index]` with `args` already
    /// laid out exactly as the frame's local table wants them (`this`
    /// first for instance methods, then parameters in declared order,
    /// wide values occupying two consecutive entries) — the shape
    /// [`interpreter::pop_args`][pop_args]-style call sites already
    /// produce.
    ///
    /// [pop_args]: crate::interpreter
    pub fn invoke_method(&self, thread_id: u64, class: &ClassRef, method_index: usize, args: Vec<Slot>) -> Result<FrameOutcome> {
        let Class::Instance(ic) = class.as_ref() else {
            return Err(VmError::fatal("cannot invoke a method on a non-instance class"));
        };
        let method = &ic.methods[method_index];

        if method.is_native() {
            return self.invoke_native(class, method, thread_id, &args);
        }
        if method.is_abstract() {
            return Err(VmError::fatal(format!("{}.{} is abstract and has no body", ic.name, method.name)));
        }

        let lock_object = if method.is_synchronized() {
            Some(self.monitor_target(class, method, &args)?)
        } else {
            None
        };
        if let Some(obj) = lock_object {
            self.threads.monitor_enter(obj, thread_id);
        }

        let previous_count = method.invocation_count.fetch_add(1, Ordering::Relaxed);
        if previous_count + 1 == self.config.jit_threshold {
            crate::jit::maybe_compile(self, class, method_index);
        }

        let mut frame = Frame::new(class.clone(), method_index, method);
        for (i, slot) in args.iter().enumerate() {
            frame.set_local(i, *slot)?;
        }

        let outcome = {
            let compiled = method.compiled.read();
            if let Some(compiled) = compiled.as_ref() {
                crate::jit::run_compiled(compiled, self, thread_id, &mut frame)
            } else {
                drop(compiled);
                interpreter::run_frame(self, thread_id, &mut frame)
            }
        };

        if let Some(obj) = lock_object {
            self.threads.monitor_exit(obj, thread_id)?;
        }

        outcome
    }

    fn monitor_target(&self, class: &ClassRef, method: &crate::class::Method, args: &[Slot]) -> Result<ObjRef> {
        if method.is_static() {
            Ok(self.class_mirror(class))
        } else {
            args.first()
                .and_then(|s| s.as_reference())
                .flatten()
                .ok_or_else(|| VmError::fatal("synchronized instance method invoked without a receiver"))
        }
    }

    fn invoke_native(&self, class: &ClassRef, method: &crate::class::Method, thread_id: u64, args: &[Slot]) -> Result<FrameOutcome> {
        let Class::Instance(ic) = class.as_ref() else {
            return Err(VmError::fatal("native method outside an instance class"));
        };
        let descriptor = method.descriptor.to_string();
        match self.natives.read().lookup(&ic.name, &method.name, &descriptor) {
            Some(native_fn) => native_fn(self, thread_id, args).map(FrameOutcome::Returned),
            None => Err(VmError::fatal(format!(
                "no native registered for {}.{}{descriptor}",
                ic.name, method.name
            ))),
        }
    }

    /// spec.md §4.2's null/arithmetic/etc. exception-raising opcodes
    /// all funnel through here: allocate a no-arg instance of
    /// `class_name` and hand it back as a [`interpreter::Step::Thrown`]
    /// for the caller to return directly.
    pub fn throw(&self, _frame: &Frame, class_name: &str) -> Result<interpreter::Step> {
        let class = self.loader.resolve_class(class_name)?;
        self.ensure_initialised(&class, 0)?;
        let handle = self.allocate_instance(&class)?;
        Ok(interpreter::Step::Thrown(handle))
    }

    /// spec.md §3: "instance slots laid out above the superclass's
    /// slots". Builds the flattened per-object fields vector by
    /// walking the class chain root-first and writing each class's
    /// own (non-static) fields at `instance_slot_base + slot_index`.
    pub fn allocate_instance(&self, class: &ClassRef) -> Result<ObjRef> {
        let Class::Instance(leaf) = class.as_ref() else {
            return Err(VmError::fatal(format!("{} is not instantiable", class.name())));
        };
        let total = *leaf.instance_slot_base.read() + leaf.instance_slot_count;
        let mut fields = vec![Slot::Padding; total];

        let mut chain = Vec::new();
        let mut cur = Some(class.clone());
        while let Some(c) = cur {
            let Class::Instance(ic) = c.as_ref() else { break };
            let next = ic.super_class.read().clone();
            chain.push(c);
            cur = next;
        }

        for c in chain.iter().rev() {
            let Class::Instance(ic) = c.as_ref() else { continue };
            let base = *ic.instance_slot_base.read();
            for f in &ic.fields {
                if f.access_flags.contains(FieldAccessFlags::STATIC) {
                    continue;
                }
                for (i, slot) in default_slots_for_kind(f.slot_kind).into_iter().enumerate() {
                    fields[base + f.slot_index + i] = slot;
                }
            }
        }

        Ok(self.heap.allocate(Object::Instance { class: class.clone(), fields }))
    }

    /// spec.md §4.2's `multianewarray`: allocates the outer array of
    /// `sizes[0]` elements, recursing into each element for the
    /// remaining dimensions; dimensions beyond `sizes.len()` are left
    /// `null`, matching the class format's "partial" multi-array
    /// semantics (a compiler may allocate fewer dimensions than the
    /// array type declares).
    pub fn allocate_multi_array(&self, array_name: &str, sizes: &[i32]) -> Result<ObjRef> {
        let class = self.loader.resolve_class(array_name)?;
        self.allocate_multi_array_rec(&class, sizes)
    }

    fn allocate_multi_array_rec(&self, class: &ClassRef, sizes: &[i32]) -> Result<ObjRef> {
        let len = sizes[0] as usize;
        match class.as_ref() {
            Class::ObjectArray(arr) => {
                let elements = if sizes.len() > 1 {
                    let mut elements = Vec::with_capacity(len);
                    for _ in 0..len {
                        let sub = self.allocate_multi_array_rec(&arr.component, &sizes[1..])?;
                        elements.push(Slot::Reference(Some(sub)));
                    }
                    elements
                } else {
                    vec![Slot::NULL; len]
                };
                Ok(self.heap.allocate(Object::ObjectArray { class: class.clone(), elements }))
            }
            Class::TypeArray(arr) => {
                let default = primitive_default_slot(&arr.component);
                let elements = vec![default; len];
                Ok(self.heap.allocate(Object::TypeArray { class: class.clone(), elements }))
            }
            _ => Err(VmError::fatal(format!("{} is not an array class", class.name()))),
        }
    }

    pub fn wall_clock_millis(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
    }

    pub fn monotonic_nanos(&self) -> i64 {
        self.start_instant.elapsed().as_nanos() as i64
    }

    /// Component 10's top-level sequence (spec.md §2): spin up the GC
    /// and finaliser daemons, then run the entry class's `main` on
    /// the calling (main) thread.
    pub fn run(self: Arc<Self>) -> Result<()> {
        spawn_gc_thread(&self);
        spawn_finalizer_thread(&self);
        self.run_main_thread()
    }

    fn run_main_thread(&self) -> Result<()> {
        let main_thread = self.threads.register_thread();
        let entry = self.loader.resolve_class(&self.config.entry_class)?;
        self.ensure_initialised(&entry, main_thread)?;

        let Class::Instance(ic) = entry.as_ref() else {
            return Err(VmError::fatal("entry class is not an instance class"));
        };
        let Some(method_index) = ic.methods.iter().position(|m| {
            m.name == "main" && m.descriptor.to_string() == "([Ljava/lang/String;)V" && m.is_static()
        }) else {
            return Err(VmError::fatal(format!("{} has no static void main(String[])", ic.name)));
        };

        let args_array = self.build_program_args_array()?;
        let result = self.invoke_method(main_thread, &entry, method_index, vec![Slot::Reference(Some(args_array))]);

        self.threads.terminate(main_thread);
        self.shutting_down.store(true, Ordering::Release);
        self.finalizer.notify();

        match result? {
            FrameOutcome::Returned(_) => Ok(()),
            FrameOutcome::Threw(obj) => {
                self.print_uncaught(obj);
                Err(VmError::fatal("uncaught exception escaped main"))
            }
        }
    }

    fn build_program_args_array(&self) -> Result<ObjRef> {
        let string_class = self.loader.resolve_class("java/lang/String")?;
        let array_class = self.loader.resolve_class("[Ljava/lang/String;")?;
        let elements = self
            .config
            .program_args
            .iter()
            .map(|s| Slot::Reference(Some(self.string_pool.intern(&self.heap, &string_class, s))))
            .collect();
        Ok(self.heap.allocate(Object::ObjectArray { class: array_class, elements }))
    }

    /// spec.md §4.2's uncaught-exception fallback: "run the object's
    /// `printStackTrace` method and return". A full `Throwable`/
    /// `PrintStream` standard library is out of scope (spec.md §1),
    /// so this approximates it with the exception's class name.
    fn print_uncaught(&self, obj: ObjRef) {
        let class_name = self.object_class(obj).map(|c| c.name().to_string()).unwrap_or_else(|_| "<unknown>".to_string());
        eprintln!("Exception in thread \"main\" {class_name}");
    }
}

fn spawn_gc_thread(vm: &Arc<Vm>) {
    let vm = Arc::clone(vm);
    std::thread::spawn(move || loop {
        std::thread::sleep(vm.gc.poll_interval);
        if vm.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if vm.gc.should_collect(&vm.heap) {
            let classes = vm.loader.loaded_classes();
            let mirror_roots: Vec<ObjRef> = classes.iter().map(|c| vm.class_mirror(c)).collect();
            let live_ids = vm.threads.live_ids();
            debug!(live_threads = live_ids.len(), "gc threshold crossed, collecting");
            vm.gc.run(&vm.heap, &vm.string_pool, &classes, &mirror_roots, &live_ids, &vm.finalizer);
        }
    });
}

fn spawn_finalizer_thread(vm: &Arc<Vm>) {
    let vm = Arc::clone(vm);
    std::thread::spawn(move || {
        let thread_id = vm.threads.register_thread();
        crate::finalizer::run_finalizer_loop(
            &vm.finalizer,
            &vm.heap,
            || vm.shutting_down.load(Ordering::Acquire),
            |obj| {
                let Ok(class) = vm.object_class(obj) else { return };
                if let Some((found_class, idx)) = vm.resolve_method(&class, "finalize", "()V") {
                    let _ = vm.invoke_method(thread_id, &found_class, idx, vec![Slot::Reference(Some(obj))]);
                }
            },
        );
        vm.threads.terminate(thread_id);
    });
}

fn default_slots_for_kind(kind: SlotKind) -> Vec<Slot> {
    match kind {
        SlotKind::Int => vec![Slot::Int(0)],
        SlotKind::Float => vec![Slot::Float(0.0)],
        SlotKind::Long => vec![Slot::Long(0), Slot::Padding],
        SlotKind::Double => vec![Slot::Double(0.0), Slot::Padding],
        SlotKind::Reference => vec![Slot::NULL],
        SlotKind::None => vec![Slot::Padding],
    }
}

fn primitive_default_slot(component: &ClassRef) -> Slot {
    match component.as_ref() {
        Class::Primitive { slot_kind, .. } => match slot_kind {
            SlotKind::Float => Slot::Float(0.0),
            SlotKind::Double => Slot::Double(0.0),
            SlotKind::Long => Slot::Long(0),
            _ => Slot::Int(0),
        },
        _ => Slot::NULL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classpath::MemoryClassPath;

    fn utf8(s: &str) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend((s.len() as u16).to_be_bytes());
        out.extend(s.as_bytes());
        out
    }

    fn root_class_bytes(name: &str) -> Vec<u8> {
        let mut cp = Vec::new();
        cp.extend(utf8(name));
        cp.extend([7, 0, 1]);
        let mut data = Vec::new();
        data.extend(0xCAFEBABEu32.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data.extend(52u16.to_be_bytes());
        data.extend(3u16.to_be_bytes());
        data.extend(cp);
        data.extend(0x0021u16.to_be_bytes());
        data.extend(2u16.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data
    }

    #[test]
    fn class_mirror_is_allocated_once() {
        let config = VmConfig::new("Main".to_string(), vec![], vec!["ignored".to_string()]);
        let mut cp = MemoryClassPath::new();
        cp.insert("java/lang/Object", root_class_bytes("java/lang/Object"));
        let vm = Vm::new_with_class_path(config, Box::new(cp));
        let class = vm.loader().resolve_class("java/lang/Object").unwrap();
        let a = vm.class_mirror(&class);
        let b = vm.class_mirror(&class);
        assert_eq!(a, b);
    }

    #[test]
    fn allocate_instance_sizes_fields_above_the_superclass() {
        let config = VmConfig::new("Main".to_string(), vec![], vec!["ignored".to_string()]);
        let mut cp = MemoryClassPath::new();
        cp.insert("java/lang/Object", root_class_bytes("java/lang/Object"));
        let vm = Vm::new_with_class_path(config, Box::new(cp));
        let object_class = vm.loader().resolve_class("java/lang/Object").unwrap();
        let handle = vm.allocate_instance(&object_class).unwrap();
        let field_count = vm.heap().with_object(handle, |o| match o {
            Object::Instance { fields, .. } => fields.len(),
            _ => panic!("expected an instance"),
        }).unwrap();
        assert_eq!(field_count, 0);
    }
}
