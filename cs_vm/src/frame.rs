//! The interpreter's activation record: operand stack and local
//! variable table, both backed by parallel `Slot` arrays, plus the
//! exception-table search used for `athrow` unwinding.
//!
//! Grounded on `original_source/src/frame.cpp`: the source VM tracks
//! operand-stack depth and local slots as flat arrays indexed by a
//! cursor, with unwinding implemented as a linear scan of the active
//! method's exception table rather than native stack unwinding. We
//! keep that shape — a `Vec<Slot>` stack plus a `Vec<Slot>` locals
//! table — since it is exactly what the GC's root-scanning (spec.md
//! §9) wants: every live reference sits in a typed slot, never
//! behind an opaque native frame.

use cs_model::Slot;

use crate::class::{ClassRef, Method};
use crate::error::{Result, VmError};

pub struct Frame {
    pub class: ClassRef,
    pub method_index: usize,
    pub locals: Vec<Slot>,
    pub stack: Vec<Slot>,
    pub pc: u32,
    pub monitor_depth: u32,
}

impl Frame {
    pub fn new(class: ClassRef, method_index: usize, method: &Method) -> Self {
        Frame {
            class,
            method_index,
            locals: vec![Slot::Padding; method.frame_local_slots()],
            stack: Vec::with_capacity(method.max_stack as usize),
            pc: 0,
            monitor_depth: 0,
        }
    }

    /// The method this frame is executing. `class` is always an
    /// `Instance` class with `method_index` into its method table —
    /// frames are never created for primitive or array classes,
    /// which have no bytecode to run.
    pub fn method<'a>(&'a self) -> &'a Method {
        match self.class.as_ref() {
            crate::class::Class::Instance(c) => &c.methods[self.method_index],
            _ => unreachable!("a frame's class is always an instance class"),
        }
    }

    pub fn push(&mut self, slot: Slot) {
        self.stack.push(slot);
    }

    pub fn pop(&mut self) -> Result<Slot> {
        self.stack.pop().ok_or_else(|| VmError::fatal("operand stack underflow"))
    }

    pub fn peek(&self) -> Result<Slot> {
        self.stack.last().copied().ok_or_else(|| VmError::fatal("operand stack empty"))
    }

    pub fn local(&self, index: usize) -> Result<Slot> {
        self.locals
            .get(index)
            .copied()
            .ok_or_else(|| VmError::fatal(format!("local variable index {index} out of bounds")))
    }

    pub fn set_local(&mut self, index: usize, slot: Slot) -> Result<()> {
        *self
            .locals
            .get_mut(index)
            .ok_or_else(|| VmError::fatal(format!("local variable index {index} out of bounds")))? = slot;
        Ok(())
    }

    /// Finds the handler `pc` for an exception of class `thrown` that
    /// covers the current `pc`, per spec.md §4.2's search order: the
    /// first exception-table entry (in file order) whose range
    /// contains `pc` and whose catch type is `None` or a superclass
    /// of `thrown` wins. `resolve_catch_type` looks a constant-pool
    /// `Class` index up in the loader's class table — the frame
    /// itself only knows the raw constant pool index.
    pub fn find_handler(
        &self,
        thrown: &ClassRef,
        resolve_catch_type: impl Fn(u16) -> Result<ClassRef>,
    ) -> Option<u32> {
        let method = self.method();
        method.exception_table.iter().find_map(|entry| {
            let in_range = (entry.start_pc as u32) <= self.pc && self.pc < entry.end_pc as u32;
            if !in_range {
                return None;
            }
            match entry.catch_type {
                None => Some(entry.handler_pc as u32),
                Some(cp_index) => resolve_catch_type(cp_index)
                    .ok()
                    .filter(|catch_class| thrown.is_assignable_to(catch_class))
                    .map(|_| entry.handler_pc as u32),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{Class, Field, InitLock, InstanceClass};
    use cs_model::ClassAccessFlags;
    use cs_parser::ConstantPool;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn sample_method() -> Method {
        Method {
            owner: "Main".to_string(),
            name: "run".to_string(),
            descriptor: cs_model::MethodDescriptor::parse("()V").unwrap(),
            access_flags: cs_model::MethodAccessFlags::STATIC,
            max_stack: 4,
            max_locals: 2,
            code: vec![],
            exception_table: vec![],
            line_numbers: vec![],
            invocation_count: AtomicU32::new(0),
            compiled: RwLock::new(None),
        }
    }

    fn class_with_method(method: Method) -> ClassRef {
        Arc::new(Class::Instance(InstanceClass {
            name: "Main".to_string(),
            access_flags: ClassAccessFlags::empty(),
            super_class: RwLock::new(None),
            super_name: None,
            interfaces: RwLock::new(Vec::new()),
            interface_names: Vec::new(),
            constant_pool: ConstantPool::default(),
            fields: Vec::<Field>::new(),
            methods: vec![method],
            instance_slot_count: 0,
            instance_slot_base: RwLock::new(0),
            static_slots: RwLock::new(Vec::new()),
            source_file: None,
            init: InitLock::new(),
            bootstrap_methods: Vec::new(),
            invokedynamic_cache: RwLock::new(Default::default()),
        }))
    }

    #[test]
    fn locals_and_stack_round_trip() {
        let class = class_with_method(sample_method());
        let mut frame = Frame::new(class.clone(), 0, frame_method(&class));
        frame.set_local(0, Slot::Int(7)).unwrap();
        assert_eq!(frame.local(0).unwrap(), Slot::Int(7));
        frame.push(Slot::Int(1));
        assert_eq!(frame.pop().unwrap(), Slot::Int(1));
        assert!(frame.pop().is_err());
    }

    #[test]
    fn find_handler_matches_catch_all_range() {
        use cs_parser::ExceptionTableEntry;
        let mut method = sample_method();
        method.exception_table.push(ExceptionTableEntry {
            start_pc: 0,
            end_pc: 10,
            handler_pc: 20,
            catch_type: None,
        });
        let class = class_with_method(method);
        let mut frame = Frame::new(class.clone(), 0, frame_method(&class));
        frame.pc = 5;
        let handler = frame.find_handler(&class, |_| unreachable!("catch-all never resolves a type"));
        assert_eq!(handler, Some(20));
    }

    fn frame_method(class: &ClassRef) -> &Method {
        match class.as_ref() {
            Class::Instance(c) => &c.methods[0],
            _ => unreachable!(),
        }
    }
}
