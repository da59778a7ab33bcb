//! Runtime class representation (spec.md §3): the linked, in-memory
//! shape a [`ClassFile`](cs_parser::ClassFile) becomes once the
//! loader has resolved its super/interfaces and laid out its fields.
//! Kept deliberately close to `cs_parser`'s parsed shape — this is
//! still "the class", just with symbolic indices traded for resolved
//! handles and slot offsets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cs_model::{
    ClassAccessFlags, FieldAccessFlags, FieldType, MethodAccessFlags, MethodDescriptor,
    MethodReturn, Slot, SlotKind,
};
use cs_parser::{Attribute, BootstrapMethodEntry, ClassFile, ConstantPool, ExceptionTableEntry, LineNumberEntry};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{Result, VmError};

/// A reference-counted handle to a loaded class. Classes are never
/// mutated structurally after linking (only their static-field slots
/// and init state change), so sharing via `Arc` needs no further
/// synchronization for the parts that are read-only after linking.
pub type ClassRef = Arc<Class>;

/// spec.md §3's class-initialization state machine: `LOADED` ->
/// `INITIALISING` -> `INITIALISED`, with a `Failed` sink for a
/// clinit that threw (spec.md §4.3: a second attempt to initialize a
/// previously failed class raises `NoClassDefFoundError` rather than
/// re-running `<clinit>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Loaded,
    Initialising,
    Initialised,
    Failed,
}

pub struct InitLock {
    pub state: Mutex<InitState>,
    pub condvar: Condvar,
    /// Thread id currently running `<clinit>`, so re-entrant
    /// initialization from the same thread (a static initializer
    /// that references its own class) doesn't deadlock against
    /// itself.
    pub owner_thread: Mutex<Option<u64>>,
}

impl InitLock {
    pub fn new() -> Self {
        InitLock {
            state: Mutex::new(InitState::Loaded),
            condvar: Condvar::new(),
            owner_thread: Mutex::new(None),
        }
    }
}

impl Default for InitLock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub descriptor: FieldType,
    pub access_flags: FieldAccessFlags,
    pub slot_kind: SlotKind,
    /// Index into the owning class's static-slot table, or the
    /// instance layout's per-object slot table — which one depends
    /// on `access_flags.contains(FieldAccessFlags::STATIC)`.
    pub slot_index: usize,
    pub constant_value: Option<Slot>,
}

#[derive(Debug)]
pub struct Method {
    pub owner: String,
    pub name: String,
    pub descriptor: MethodDescriptor,
    pub access_flags: MethodAccessFlags,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub line_numbers: Vec<LineNumberEntry>,
    /// Invocation counter the interpreter bumps on every call;
    /// crossing `VmConfig::jit_threshold` makes the method eligible
    /// for compilation to the JIT's typed IR.
    pub invocation_count: AtomicU32,
    pub compiled: RwLock<Option<crate::jit::CompiledMethod>>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::ABSTRACT)
    }

    pub fn is_synchronized(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::SYNCHRONIZED)
    }

    /// Total local-variable slot width this method's frame needs:
    /// `max_locals` already accounts for wide (long/double) slots
    /// doubling up, per the class-file format's own bookkeeping.
    pub fn frame_local_slots(&self) -> usize {
        self.max_locals as usize
    }

    pub fn return_kind(&self) -> SlotKind {
        match &self.descriptor.return_type {
            MethodReturn::Void => SlotKind::None,
            MethodReturn::Value(ty) => ty.slot_kind(),
        }
    }

    pub fn line_for_pc(&self, pc: u32) -> Option<u16> {
        self.line_numbers
            .iter()
            .filter(|e| e.start_pc as u32 <= pc)
            .max_by_key(|e| e.start_pc)
            .map(|e| e.line_number)
    }
}

/// The runtime shape of a loaded class. Mirrors spec.md §3's four
/// kinds of "class": an ordinary instance class, an array class (of
/// references or of a primitive), and the small set of built-in
/// primitive placeholders (`int.class`, `void.class`, ...) that exist
/// only so reflection-like lookups and array component types have
/// something to point at.
pub enum Class {
    Primitive {
        name: String,
        slot_kind: SlotKind,
    },
    Instance(InstanceClass),
    ObjectArray(ArrayClass),
    TypeArray(ArrayClass),
}

pub struct InstanceClass {
    pub name: String,
    pub access_flags: ClassAccessFlags,
    pub super_class: RwLock<Option<ClassRef>>,
    pub super_name: Option<String>,
    pub interfaces: RwLock<Vec<ClassRef>>,
    pub interface_names: Vec<String>,
    pub constant_pool: ConstantPool,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    /// Slot width of this class's own (non-static) fields, not
    /// counting anything inherited.
    pub instance_slot_count: usize,
    /// Where this class's own instance fields start in a flattened
    /// per-object fields vector — the superclass's
    /// [`total_instance_slots`](InstanceClass::total_instance_slots),
    /// set by the loader once linking resolves `super_class` (spec.md
    /// §3: "instance slots laid out above the superclass's slots").
    /// Zero until then, which is correct for `java/lang/Object`.
    pub instance_slot_base: RwLock<usize>,
    pub static_slots: RwLock<Vec<Slot>>,
    pub source_file: Option<String>,
    pub init: InitLock,
    /// This class's own `BootstrapMethods` attribute entries, indexed
    /// by `invokedynamic`'s `bootstrap_method_attr_index`.
    pub bootstrap_methods: Vec<BootstrapMethodEntry>,
    /// `invokedynamic` call-site cache, keyed by the instruction's own
    /// constant-pool index — resolved once on first execution and
    /// reused by every later execution of that same call site.
    pub invokedynamic_cache: RwLock<FxHashMap<u16, ResolvedCallSite>>,
}

/// The outcome of resolving one `invokedynamic` call site: which
/// method the bootstrap linkage settled on, cached so later
/// executions of the same site skip bootstrap resolution entirely.
#[derive(Clone)]
pub struct ResolvedCallSite {
    pub target_class: ClassRef,
    pub method_index: usize,
}

/// An array class: `ObjectArray` for reference component types,
/// `TypeArray` for primitive component types (spec.md §3's split,
/// mirroring the class-file format's distinct `anewarray`/`newarray`
/// opcodes).
pub struct ArrayClass {
    pub name: String,
    pub component: ClassRef,
    pub dimensions: u8,
}

impl Class {
    pub fn name(&self) -> &str {
        match self {
            Class::Primitive { name, .. } => name,
            Class::Instance(c) => &c.name,
            Class::ObjectArray(c) | Class::TypeArray(c) => &c.name,
        }
    }

    pub fn as_instance(&self) -> Result<&InstanceClass> {
        match self {
            Class::Instance(c) => Ok(c),
            _ => Err(VmError::fatal(format!("{} is not an instance class", self.name()))),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Class::ObjectArray(_) | Class::TypeArray(_))
    }

    /// Whether `self` is the same class as, or a subclass/implementor
    /// of, `other` — the `instanceof`/`checkcast`/catch-type-match
    /// ancestry walk (spec.md §4.2).
    pub fn is_assignable_to(&self, other: &Class) -> bool {
        if std::ptr::eq(self, other) || self.name() == other.name() {
            return true;
        }
        match self {
            Class::Instance(c) => {
                if c.interface_names.iter().any(|i| i == other.name()) {
                    return true;
                }
                if let Some(super_class) = c.super_class.read().as_ref() {
                    return super_class.is_assignable_to(other);
                }
                false
            }
            _ => false,
        }
    }
}

impl InstanceClass {
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor.to_string() == descriptor)
    }

    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// This class's own instance slots plus everything it inherits —
    /// the width a subclass must add its own `instance_slot_base` on
    /// top of, and the size an object of this exact class allocates.
    pub fn total_instance_slots(&self) -> usize {
        *self.instance_slot_base.read() + self.instance_slot_count
    }
}

/// Builds a [`ClassFile`] (parsed, symbolic) into a not-yet-linked
/// [`InstanceClass`] — name/descriptor resolution for super and
/// interfaces, field layout, and method table construction. Link-time
/// super/interface *handle* resolution (populating `super_class`,
/// `interfaces`) is the loader's job, since it needs the class table.
pub fn build_instance_class(class_file: ClassFile) -> Result<InstanceClass> {
    let name = class_file.this_class_name()?.to_string();
    let super_name = class_file.super_class_name()?.map(str::to_string);
    let interface_names = class_file
        .interfaces
        .iter()
        .map(|&idx| class_file.constant_pool.class_name(idx).map(str::to_string))
        .collect::<cs_parser::Result<Vec<_>>>()?;

    let mut static_slot_count = 0usize;
    let mut instance_slot_count = 0usize;
    let mut fields = Vec::with_capacity(class_file.fields.len());
    for f in &class_file.fields {
        let name = class_file.constant_pool.utf8(f.name_index)?.to_string();
        let descriptor_str = class_file.constant_pool.utf8(f.descriptor_index)?;
        let descriptor = FieldType::parse(descriptor_str).map_err(|e| VmError::fatal(e.to_string()))?;
        let access_flags = FieldAccessFlags::from_bits_truncate(f.access_flags);
        let slot_kind = descriptor.slot_kind();
        let is_static = access_flags.contains(FieldAccessFlags::STATIC);
        let slot_index = if is_static {
            let idx = static_slot_count;
            static_slot_count += slot_kind.width();
            idx
        } else {
            let idx = instance_slot_count;
            instance_slot_count += slot_kind.width();
            idx
        };
        let constant_value = f.attributes.iter().find_map(|a| match a {
            Attribute::ConstantValue { index } => constant_value_slot(&class_file.constant_pool, *index).ok(),
            _ => None,
        });
        fields.push(Field {
            name,
            descriptor,
            access_flags,
            slot_kind,
            slot_index,
            constant_value,
        });
    }

    let mut methods = Vec::with_capacity(class_file.methods.len());
    for m in &class_file.methods {
        let owner = name.clone();
        let name = class_file.constant_pool.utf8(m.name_index)?.to_string();
        let descriptor_str = class_file.constant_pool.utf8(m.descriptor_index)?;
        let descriptor = MethodDescriptor::parse(descriptor_str).map_err(|e| VmError::fatal(e.to_string()))?;
        let access_flags = MethodAccessFlags::from_bits_truncate(m.access_flags);

        let (max_stack, max_locals, code, exception_table, line_numbers) =
            match m.code_attribute() {
                Some(Attribute::Code {
                    max_stack,
                    max_locals,
                    code,
                    exception_table,
                    attributes,
                    ..
                }) => {
                    let line_numbers = attributes
                        .iter()
                        .find_map(|a| match a {
                            Attribute::LineNumberTable(entries) => Some(entries.clone()),
                            _ => None,
                        })
                        .unwrap_or_default();
                    (*max_stack, *max_locals, code.clone(), exception_table.clone(), line_numbers)
                }
                _ => (0, 0, Vec::new(), Vec::new(), Vec::new()),
            };

        methods.push(Method {
            owner,
            name,
            descriptor,
            access_flags,
            max_stack,
            max_locals,
            code,
            exception_table,
            line_numbers,
            invocation_count: AtomicU32::new(0),
            compiled: RwLock::new(None),
        });
    }
    let bootstrap_methods = class_file
        .attributes
        .iter()
        .find_map(|a| match a {
            Attribute::BootstrapMethods(entries) => Some(entries.clone()),
            _ => None,
        })
        .unwrap_or_default();

    Ok(InstanceClass {
        name,
        access_flags: ClassAccessFlags::from_bits_truncate(class_file.access_flags),
        super_class: RwLock::new(None),
        super_name,
        interfaces: RwLock::new(Vec::new()),
        interface_names,
        constant_pool: class_file.constant_pool,
        fields,
        methods,
        instance_slot_count,
        instance_slot_base: RwLock::new(0),
        static_slots: RwLock::new(vec![Slot::Padding; static_slot_count]),
        source_file: class_file.source_file().map(str::to_string),
        init: InitLock::new(),
        bootstrap_methods,
        invokedynamic_cache: RwLock::new(FxHashMap::default()),
    })
}

fn constant_value_slot(pool: &ConstantPool, index: u16) -> cs_parser::Result<Slot> {
    use cs_parser::CpInfo;
    Ok(match pool.get(index)? {
        CpInfo::Integer(v) => Slot::Int(*v),
        CpInfo::Long(v) => Slot::Long(*v),
        CpInfo::Float(v) => Slot::Float(*v),
        CpInfo::Double(v) => Slot::Double(*v),
        CpInfo::String { .. } => Slot::NULL, // interned at first use, not at link time
        _ => Slot::NULL,
    })
}
