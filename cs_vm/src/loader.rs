//! The class loader (spec.md §3/§4.1): resolves a logical class name
//! to a linked [`ClassRef`], caching by name, constructing array
//! classes on demand, and driving the `<clinit>` state machine with
//! per-class locking so two threads racing to initialize the same
//! class block on each other rather than double-running the
//! initializer (spec.md §4.3).

use std::sync::Arc;
use std::time::Duration;

use cs_model::SlotKind;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::class::{build_instance_class, ArrayClass, Class, ClassRef, InitState, InstanceClass};
use crate::classpath::ClassPath;
use crate::error::{Result, VmError};

/// Owns the name -> class table and the class-path collaborator used
/// to fetch bytes for names not yet resolved.
pub struct ClassLoader {
    class_path: Box<dyn ClassPath>,
    classes: RwLock<FxHashMap<String, ClassRef>>,
}

const PRIMITIVE_NAMES: &[(&str, SlotKind)] = &[
    ("int", SlotKind::Int),
    ("long", SlotKind::Long),
    ("float", SlotKind::Float),
    ("double", SlotKind::Double),
    ("boolean", SlotKind::Int),
    ("byte", SlotKind::Int),
    ("char", SlotKind::Int),
    ("short", SlotKind::Int),
    ("void", SlotKind::None),
];

impl ClassLoader {
    pub fn new(class_path: Box<dyn ClassPath>) -> Self {
        let mut classes = FxHashMap::default();
        for (name, slot_kind) in PRIMITIVE_NAMES {
            classes.insert(
                name.to_string(),
                Arc::new(Class::Primitive {
                    name: name.to_string(),
                    slot_kind: *slot_kind,
                }),
            );
        }
        ClassLoader {
            class_path,
            classes: RwLock::new(classes),
        }
    }

    /// Resolves `name` to a loaded, linked class, loading and linking
    /// it (and its supertypes) if this is the first reference. Does
    /// *not* run `<clinit>` — that is triggered lazily by the
    /// interpreter at the points spec.md §4.3 names (first active
    /// use: `new`, a static field access, or a static method call).
    pub fn resolve_class(&self, name: &str) -> Result<ClassRef> {
        if let Some(existing) = self.classes.read().get(name) {
            return Ok(Arc::clone(existing));
        }

        let class = if let Some(component_name) = name.strip_prefix('[') {
            self.build_array_class(name, component_name)?
        } else {
            self.load_and_link(name)?
        };

        let mut classes = self.classes.write();
        // Another thread may have won the race; keep its entry so
        // pointer identity (`Arc::ptr_eq`) stays meaningful.
        Ok(Arc::clone(classes.entry(name.to_string()).or_insert(class)))
    }

    fn build_array_class(&self, full_name: &str, component_name: &str) -> Result<ClassRef> {
        let component = if let Some(inner) = component_name.strip_prefix('[') {
            self.resolve_class(&format!("[{inner}"))?
        } else if let Some(object_name) = component_name.strip_prefix('L').and_then(|s| s.strip_suffix(';')) {
            self.resolve_class(object_name)?
        } else {
            self.resolve_class(primitive_name_for_descriptor(component_name)?)?
        };

        let is_primitive_component = matches!(component.as_ref(), Class::Primitive { .. });
        let array = ArrayClass {
            name: full_name.to_string(),
            component,
            dimensions: full_name.bytes().take_while(|&b| b == b'[').count() as u8,
        };
        Ok(Arc::new(if is_primitive_component {
            Class::TypeArray(array)
        } else {
            Class::ObjectArray(array)
        }))
    }

    fn load_and_link(&self, name: &str) -> Result<ClassRef> {
        debug!(class = name, "loading class");
        let bytes = self
            .class_path
            .get_stream(name)
            .ok_or_else(|| VmError::ClassNotFound(name.to_string()))?;
        let class_file = cs_parser::parse_class_file(&bytes)?;
        let instance = build_instance_class(class_file)?;

        if let Some(super_name) = instance.super_name.clone() {
            let super_class = self.resolve_class(&super_name)?;
            if let Class::Instance(super_instance) = super_class.as_ref() {
                *instance.instance_slot_base.write() = super_instance.total_instance_slots();
            }
            *instance.super_class.write() = Some(super_class);
        }
        let mut interfaces = Vec::with_capacity(instance.interface_names.len());
        for iface_name in &instance.interface_names {
            interfaces.push(self.resolve_class(iface_name)?);
        }
        *instance.interfaces.write() = interfaces;

        Ok(Arc::new(Class::Instance(instance)))
    }

    /// Runs `<clinit>` for `class` if it hasn't already run, blocking
    /// if another thread is currently running it, and recursing into
    /// superclasses first (spec.md §4.3: "superclasses initialise
    /// before subclasses"). `run_clinit` is the interpreter's callback
    /// to actually execute a class's `<clinit>` method body — the
    /// loader only owns the state machine, not the interpreter — and
    /// is reused unchanged for every superclass in the chain.
    pub fn ensure_initialised(
        &self,
        class: &ClassRef,
        thread_id: u64,
        run_clinit: &impl Fn(&ClassRef) -> Result<()>,
    ) -> Result<()> {
        let Class::Instance(instance) = class.as_ref() else {
            return Ok(()); // primitives and arrays have no <clinit>
        };

        loop {
            let mut state = instance.init.state.lock();
            match *state {
                InitState::Initialised => return Ok(()),
                InitState::Failed => {
                    return Err(VmError::NoClassDefFound(instance.name.clone()));
                }
                InitState::Initialising => {
                    if *instance.init.owner_thread.lock() == Some(thread_id) {
                        return Ok(()); // re-entrant: our own <clinit> referenced us
                    }
                    instance.init.condvar.wait_for(&mut state, Duration::from_millis(50));
                    continue;
                }
                InitState::Loaded => {
                    *state = InitState::Initialising;
                    *instance.init.owner_thread.lock() = Some(thread_id);
                    break;
                }
            }
        }

        if let Some(super_class) = instance.super_class.read().clone() {
            self.ensure_initialised(&super_class, thread_id, run_clinit)?;
        }

        trace!(class = instance.name, "running <clinit>");
        let result = run_clinit(class);

        let mut state = instance.init.state.lock();
        *state = if result.is_ok() {
            InitState::Initialised
        } else {
            InitState::Failed
        };
        *instance.init.owner_thread.lock() = None;
        instance.init.condvar.notify_all();
        drop(state);
        result
    }

    pub fn loaded_classes(&self) -> Vec<ClassRef> {
        self.classes.read().values().cloned().collect()
    }
}

fn primitive_name_for_descriptor(c: &str) -> Result<&'static str> {
    Ok(match c {
        "I" => "int",
        "J" => "long",
        "F" => "float",
        "D" => "double",
        "Z" => "boolean",
        "B" => "byte",
        "C" => "char",
        "S" => "short",
        _ => return Err(VmError::fatal(format!("invalid array component descriptor {c}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classpath::MemoryClassPath;

    #[test]
    fn resolves_primitive_classes_without_class_path() {
        let loader = ClassLoader::new(Box::new(MemoryClassPath::new()));
        let int_class = loader.resolve_class("int").unwrap();
        assert_eq!(int_class.name(), "int");
    }

    #[test]
    fn missing_class_is_reported() {
        let loader = ClassLoader::new(Box::new(MemoryClassPath::new()));
        assert!(matches!(loader.resolve_class("NoSuchClass"), Err(VmError::ClassNotFound(_))));
    }
}
