//! The frame-based interpreter: a dispatch loop over one byte at a
//! time indexing [`opcodes`], grounded directly on
//! `original_source/src/execute.cpp`'s giant `switch` (same opcode
//! groupings, same exception-unwind shape, same typed arithmetic).
//!
//! [`step_one`] executes exactly one instruction and is the single
//! place most opcode semantics live. The JIT (`crate::jit`) never
//! reimplements these semantics: its compiled IR stages operands onto
//! the same [`Frame`] and calls the matching `pub(crate)` function
//! here directly (`arithmetic`, `getfield`, `invoke`, `athrow`, ...),
//! so compiled and interpreted methods can never observe different
//! behaviour for the same bytecode.

pub mod opcodes;

use std::cell::{Cell, RefCell};

use cs_model::{ObjRef, Slot};
use tracing::trace;

use crate::class::{Class, ClassRef};
use crate::error::{Result, VmError};
use crate::frame::Frame;
use crate::heap::Object;
use crate::vm::Vm;
use opcodes::*;

/// What a frame did when control last left it.
#[derive(Debug)]
pub enum FrameOutcome {
    Returned(Option<Slot>),
    /// The exception escaped this frame's own exception table; the
    /// caller must either handle it or propagate it further.
    Threw(ObjRef),
}

/// What one instruction did. [`Step::Continue`] means "keep
/// dispatching in this frame"; the other two mean the frame is done
/// one way or another.
#[derive(Debug)]
pub enum Step {
    Continue,
    Return(Option<Slot>),
    Thrown(ObjRef),
}

thread_local! {
    /// A shadow call stack of the live [`Frame`]s on *this* OS
    /// thread, used only for GC root enumeration. Each entry is
    /// pushed immediately before a frame starts executing and popped
    /// when it returns — the pointed-to `Frame` outlives the entry
    /// because it's owned by a local variable further down the same
    /// native call stack for exactly that span, mirroring how
    /// `original_source/src/garbage_collect.cpp` walks a thread's
    /// live `Frame*` chain directly.
    static FRAME_STACK: RefCell<Vec<*const Frame>> = const { RefCell::new(Vec::new()) };
    /// The in-flight thrown value while the interpreter is between
    /// frames unwinding toward a handler — also a GC root per
    /// spec.md §4.6, since it would otherwise be reachable only from
    /// a local Rust variable invisible to root collection.
    static PENDING_THROWN: Cell<Option<ObjRef>> = const { Cell::new(None) };
}

pub(crate) struct FrameStackGuard;

impl Drop for FrameStackGuard {
    fn drop(&mut self) {
        FRAME_STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

pub(crate) fn push_frame_for_roots(frame: &Frame) -> FrameStackGuard {
    FRAME_STACK.with(|s| s.borrow_mut().push(frame as *const Frame));
    FrameStackGuard
}

/// Collects every reference-typed local/stack slot across this
/// thread's live frames, plus any in-flight thrown value — spec.md
/// §4.6 root (c).
pub fn collect_thread_roots() -> Vec<ObjRef> {
    let mut roots = FRAME_STACK.with(|s| {
        let stack = s.borrow();
        let mut roots = Vec::new();
        for &ptr in stack.iter() {
            // Safety: see FRAME_STACK's doc comment.
            let frame = unsafe { &*ptr };
            roots.extend(slot_refs(&frame.locals));
            roots.extend(slot_refs(&frame.stack));
        }
        roots
    });
    if let Some(thrown) = PENDING_THROWN.with(|c| c.get()) {
        roots.push(thrown);
    }
    roots
}

fn slot_refs(slots: &[Slot]) -> impl Iterator<Item = ObjRef> + '_ {
    slots.iter().filter_map(|s| match s {
        Slot::Reference(Some(r)) => Some(*r),
        _ => None,
    })
}

/// Drives `frame` to completion: interprets one opcode at a time via
/// [`step_one`] until it returns or an exception escapes its own
/// exception table.
pub fn run_frame(vm: &Vm, thread_id: u64, frame: &mut Frame) -> Result<FrameOutcome> {
    let _guard = push_frame_for_roots(frame);
    loop {
        vm.gc().poll_safe_point(thread_id, collect_thread_roots);
        match step_one(vm, thread_id, frame)? {
            Step::Continue => {}
            Step::Return(v) => return Ok(FrameOutcome::Returned(v)),
            Step::Thrown(obj) => {
                if try_handle_exception(vm, frame, obj)? {
                    continue;
                }
                return Ok(FrameOutcome::Threw(obj));
            }
        }
    }
}

/// Tries to route `obj` to a handler in `frame`'s own exception
/// table (spec.md §4.2's unwind rule). On a match, clears the operand
/// stack, pushes the thrown object, and jumps `frame.pc` to the
/// handler, returning `true`. On no match, returns `false` so the
/// caller can propagate `obj` to the previous frame.
pub fn try_handle_exception(vm: &Vm, frame: &mut Frame, obj: ObjRef) -> Result<bool> {
    PENDING_THROWN.with(|c| c.set(Some(obj)));
    let thrown_class = vm.object_class(obj)?;
    let owner = frame.class.clone();
    let handler = frame.find_handler(&thrown_class, |cp_index| vm.resolve_catch_type(&owner, cp_index));
    PENDING_THROWN.with(|c| c.set(None));
    match handler {
        Some(handler_pc) => {
            frame.stack.clear();
            frame.push(Slot::Reference(Some(obj)));
            frame.pc = handler_pc;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub(crate) fn code_at(frame: &Frame) -> &[u8] {
    &frame.method().code
}

pub(crate) fn u1(code: &[u8], pc: usize) -> Result<u8> {
    code.get(pc).copied().ok_or_else(|| VmError::fatal("pc ran past end of method code"))
}

pub(crate) fn i1(code: &[u8], pc: usize) -> Result<i8> {
    Ok(u1(code, pc)? as i8)
}

pub(crate) fn u2(code: &[u8], pc: usize) -> Result<u16> {
    Ok(u16::from_be_bytes([u1(code, pc)?, u1(code, pc + 1)?]))
}

pub(crate) fn i2(code: &[u8], pc: usize) -> Result<i16> {
    Ok(u2(code, pc)? as i16)
}

pub(crate) fn u4(code: &[u8], pc: usize) -> Result<u32> {
    Ok(u32::from_be_bytes([u1(code, pc)?, u1(code, pc + 1)?, u1(code, pc + 2)?, u1(code, pc + 3)?]))
}

pub(crate) fn i4(code: &[u8], pc: usize) -> Result<i32> {
    Ok(u4(code, pc)? as i32)
}

/// Executes exactly one instruction at `frame.pc`, advancing `pc` (or
/// jumping it, for branches) as a side effect.
pub fn step_one(vm: &Vm, thread_id: u64, frame: &mut Frame) -> Result<Step> {
    let pc = frame.pc as usize;
    if pc >= code_at(frame).len() {
        return Err(VmError::fatal("pc ran off the end of method code"));
    }
    let opcode = u1(code_at(frame), pc)?;

    macro_rules! advance {
        ($len:expr) => {
            frame.pc = pc as u32 + $len
        };
    }

    match opcode {
        NOP => advance!(1),
        ACONST_NULL => {
            frame.push(Slot::NULL);
            advance!(1);
        }
        ICONST_M1..=ICONST_5 => {
            frame.push(Slot::Int(opcode as i32 - ICONST_0 as i32));
            advance!(1);
        }
        LCONST_0 | LCONST_1 => {
            frame.push(Slot::Long((opcode - LCONST_0) as i64));
            frame.push(Slot::Padding);
            advance!(1);
        }
        FCONST_0..=FCONST_2 => {
            frame.push(Slot::Float((opcode - FCONST_0) as f32));
            advance!(1);
        }
        DCONST_0 | DCONST_1 => {
            frame.push(Slot::Double((opcode - DCONST_0) as f64));
            frame.push(Slot::Padding);
            advance!(1);
        }
        BIPUSH => {
            let v = i1(code_at(frame), pc + 1)?;
            frame.push(Slot::Int(v as i32));
            advance!(2);
        }
        SIPUSH => {
            let v = i2(code_at(frame), pc + 1)?;
            frame.push(Slot::Int(v as i32));
            advance!(3);
        }
        LDC => {
            let index = u1(code_at(frame), pc + 1)? as u16;
            push_constant(vm, frame, index)?;
            advance!(2);
        }
        LDC_W | LDC2_W => {
            let index = u2(code_at(frame), pc + 1)?;
            push_constant(vm, frame, index)?;
            advance!(3);
        }
        ILOAD | FLOAD | ALOAD => {
            let index = u1(code_at(frame), pc + 1)? as usize;
            frame.push(frame.local(index)?);
            advance!(2);
        }
        LLOAD | DLOAD => {
            let index = u1(code_at(frame), pc + 1)? as usize;
            frame.push(frame.local(index)?);
            frame.push(Slot::Padding);
            advance!(2);
        }
        ILOAD_0..=ILOAD_3 => {
            frame.push(frame.local((opcode - ILOAD_0) as usize)?);
            advance!(1);
        }
        FLOAD_0..=FLOAD_3 => {
            frame.push(frame.local((opcode - FLOAD_0) as usize)?);
            advance!(1);
        }
        ALOAD_0..=ALOAD_3 => {
            frame.push(frame.local((opcode - ALOAD_0) as usize)?);
            advance!(1);
        }
        LLOAD_0..=LLOAD_3 => {
            frame.push(frame.local((opcode - LLOAD_0) as usize)?);
            frame.push(Slot::Padding);
            advance!(1);
        }
        DLOAD_0..=DLOAD_3 => {
            frame.push(frame.local((opcode - DLOAD_0) as usize)?);
            frame.push(Slot::Padding);
            advance!(1);
        }
        ISTORE | FSTORE | ASTORE => {
            let index = u1(code_at(frame), pc + 1)? as usize;
            let v = frame.pop()?;
            frame.set_local(index, v)?;
            advance!(2);
        }
        LSTORE | DSTORE => {
            let index = u1(code_at(frame), pc + 1)? as usize;
            frame.pop()?;
            let v = frame.pop()?;
            frame.set_local(index, v)?;
            frame.set_local(index + 1, Slot::Padding)?;
            advance!(2);
        }
        ISTORE_0..=ISTORE_3 => {
            let v = frame.pop()?;
            frame.set_local((opcode - ISTORE_0) as usize, v)?;
            advance!(1);
        }
        FSTORE_0..=FSTORE_3 => {
            let v = frame.pop()?;
            frame.set_local((opcode - FSTORE_0) as usize, v)?;
            advance!(1);
        }
        ASTORE_0..=ASTORE_3 => {
            let v = frame.pop()?;
            frame.set_local((opcode - ASTORE_0) as usize, v)?;
            advance!(1);
        }
        LSTORE_0..=LSTORE_3 => {
            frame.pop()?;
            let v = frame.pop()?;
            let index = (opcode - LSTORE_0) as usize;
            frame.set_local(index, v)?;
            frame.set_local(index + 1, Slot::Padding)?;
            advance!(1);
        }
        DSTORE_0..=DSTORE_3 => {
            frame.pop()?;
            let v = frame.pop()?;
            let index = (opcode - DSTORE_0) as usize;
            frame.set_local(index, v)?;
            frame.set_local(index + 1, Slot::Padding)?;
            advance!(1);
        }
        IALOAD | LALOAD | FALOAD | DALOAD | AALOAD | BALOAD | CALOAD | SALOAD => {
            let step = array_load(vm, frame, opcode)?;
            if matches!(step, Step::Continue) {
                advance!(1);
            }
            return Ok(step);
        }
        IASTORE | LASTORE | FASTORE | DASTORE | AASTORE | BASTORE | CASTORE | SASTORE => {
            let step = array_store(vm, frame, opcode)?;
            if matches!(step, Step::Continue) {
                advance!(1);
            }
            return Ok(step);
        }
        POP => {
            frame.pop()?;
            advance!(1);
        }
        POP2 => {
            frame.pop()?;
            frame.pop()?;
            advance!(1);
        }
        DUP => {
            let v = frame.peek()?;
            frame.push(v);
            advance!(1);
        }
        DUP_X1 => {
            let top = frame.pop()?;
            let below = frame.pop()?;
            frame.push(top);
            frame.push(below);
            frame.push(top);
            advance!(1);
        }
        DUP_X2 => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            let v3 = frame.pop()?;
            frame.push(v1);
            frame.push(v3);
            frame.push(v2);
            frame.push(v1);
            advance!(1);
        }
        DUP2 => {
            let v2 = frame.pop()?;
            let v1 = frame.pop()?;
            frame.push(v1);
            frame.push(v2);
            frame.push(v1);
            frame.push(v2);
            advance!(1);
        }
        DUP2_X1 => {
            let v2 = frame.pop()?;
            let v1 = frame.pop()?;
            let v0 = frame.pop()?;
            frame.push(v1);
            frame.push(v2);
            frame.push(v0);
            frame.push(v1);
            frame.push(v2);
            advance!(1);
        }
        DUP2_X2 => {
            let v2 = frame.pop()?;
            let v1 = frame.pop()?;
            let v0 = frame.pop()?;
            let vm1 = frame.pop()?;
            frame.push(v1);
            frame.push(v2);
            frame.push(vm1);
            frame.push(v0);
            frame.push(v1);
            frame.push(v2);
            advance!(1);
        }
        SWAP => {
            let top = frame.pop()?;
            let below = frame.pop()?;
            frame.push(top);
            frame.push(below);
            advance!(1);
        }
        IADD | ISUB | IMUL | LADD | LSUB | LMUL | FADD | FSUB | FMUL
        | FDIV | FREM | DADD | DSUB | DMUL | DDIV | DREM | INEG | LNEG | FNEG | DNEG | ISHL
        | LSHL | ISHR | LSHR | IUSHR | LUSHR | IAND | LAND | IOR | LOR | IXOR | LXOR | I2L | I2F
        | I2D | L2I | L2F | L2D | F2I | F2L | F2D | D2I | D2L | D2F | I2B | I2C | I2S | LCMP
        | FCMPL | FCMPG | DCMPL | DCMPG => {
            arithmetic(frame, opcode)?;
            advance!(1);
        }
        // Integer division/remainder need the VM to raise a catchable
        // `ArithmeticException` on division by zero rather than abort
        // the interpreter, so they're routed separately from the rest
        // of `arithmetic`'s infallible-once-operands-are-valid ops.
        IDIV | IREM | LDIV | LREM => {
            advance!(1);
            return checked_arithmetic(vm, frame, opcode);
        }
        IINC => {
            let index = u1(code_at(frame), pc + 1)? as usize;
            let delta = i1(code_at(frame), pc + 2)? as i32;
            let v = frame.local(index)?.as_int().ok_or_else(|| VmError::fatal("iinc target is not an int"))?;
            frame.set_local(index, Slot::Int(v.wrapping_add(delta)))?;
            advance!(3);
        }
        IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE => return branch_unary_compare(frame, opcode, pc),
        IF_ICMPEQ..=IF_ICMPLE => return branch_int_compare(frame, opcode, pc),
        IF_ACMPEQ | IF_ACMPNE => return branch_ref_compare(frame, opcode, pc),
        IFNULL | IFNONNULL => return branch_null_check(frame, opcode, pc),
        GOTO => {
            let offset = i2(code_at(frame), pc + 1)? as i32;
            frame.pc = (pc as i64 + offset as i64) as u32;
        }
        GOTO_W => {
            let offset = i4(code_at(frame), pc + 1)?;
            frame.pc = (pc as i64 + offset as i64) as u32;
        }
        JSR => {
            let offset = i2(code_at(frame), pc + 1)? as i32;
            frame.push(Slot::Int((pc + 3) as i32));
            frame.pc = (pc as i64 + offset as i64) as u32;
        }
        JSR_W => {
            let offset = i4(code_at(frame), pc + 1)?;
            frame.push(Slot::Int((pc + 5) as i32));
            frame.pc = (pc as i64 + offset as i64) as u32;
        }
        RET => {
            let index = u1(code_at(frame), pc + 1)? as usize;
            let target = frame.local(index)?.as_int().ok_or_else(|| VmError::fatal("ret local is not a return address"))?;
            frame.pc = target as u32;
        }
        TABLESWITCH => return tableswitch(frame, pc),
        LOOKUPSWITCH => return lookupswitch(frame, pc),
        IRETURN | FRETURN | ARETURN => {
            let v = frame.pop()?;
            return Ok(Step::Return(Some(v)));
        }
        LRETURN | DRETURN => {
            frame.pop()?;
            let v = frame.pop()?;
            return Ok(Step::Return(Some(v)));
        }
        RETURN => return Ok(Step::Return(None)),
        GETSTATIC => return getstatic(vm, frame, pc),
        PUTSTATIC => return putstatic(vm, frame, pc),
        GETFIELD => return getfield(vm, frame, pc),
        PUTFIELD => return putfield(vm, frame, pc),
        INVOKEVIRTUAL => return invoke(vm, thread_id, frame, pc, InvokeKind::Virtual),
        INVOKESPECIAL => return invoke(vm, thread_id, frame, pc, InvokeKind::Special),
        INVOKESTATIC => return invoke(vm, thread_id, frame, pc, InvokeKind::Static),
        INVOKEINTERFACE => return invoke_interface(vm, thread_id, frame, pc),
        INVOKEDYNAMIC => return invokedynamic(vm, thread_id, frame, pc),
        NEW => return new_instance(vm, frame, pc),
        NEWARRAY => return newarray(vm, frame, pc),
        ANEWARRAY => return anewarray(vm, frame, pc),
        MULTIANEWARRAY => return multianewarray(vm, frame, pc),
        ARRAYLENGTH => return arraylength(vm, frame, pc),
        ATHROW => return athrow(vm, frame),
        CHECKCAST => return checkcast(vm, frame, pc),
        INSTANCEOF => return instanceof(vm, frame, pc),
        MONITORENTER => {
            let v = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
            match v {
                Some(obj) => {
                    vm.threads().monitor_enter(obj, thread_id);
                    frame.monitor_depth += 1;
                    advance!(1);
                }
                None => return vm.throw(frame, "java/lang/NullPointerException"),
            }
        }
        MONITOREXIT => {
            let v = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
            match v {
                Some(obj) => {
                    vm.threads().monitor_exit(obj, thread_id)?;
                    frame.monitor_depth = frame.monitor_depth.saturating_sub(1);
                    advance!(1);
                }
                None => return vm.throw(frame, "java/lang/NullPointerException"),
            }
        }
        WIDE => return wide(frame, pc),
        _ => return Err(VmError::fatal(format!("opcode 0x{opcode:02x} is not implemented"))),
    }
    Ok(Step::Continue)
}

pub(crate) fn push_constant(vm: &Vm, frame: &mut Frame, index: u16) -> Result<()> {
    use cs_parser::CpInfo;
    let Class::Instance(owner) = frame.class.as_ref() else {
        return Err(VmError::fatal("ldc outside an instance class"));
    };
    let slot = match owner.constant_pool.get(index)? {
        CpInfo::Integer(v) => Slot::Int(*v),
        CpInfo::Float(v) => Slot::Float(*v),
        CpInfo::Long(v) => {
            frame.push(Slot::Long(*v));
            frame.push(Slot::Padding);
            return Ok(());
        }
        CpInfo::Double(v) => {
            frame.push(Slot::Double(*v));
            frame.push(Slot::Padding);
            return Ok(());
        }
        CpInfo::String { string_index } => {
            let text = owner.constant_pool.utf8(*string_index)?.to_string();
            let string_class = vm.loader().resolve_class("java/lang/String")?;
            Slot::Reference(Some(vm.string_pool().intern(vm.heap(), &string_class, &text)))
        }
        CpInfo::Class { name_index } => {
            let class_name = owner.constant_pool.utf8(*name_index)?.to_string();
            let class = vm.loader().resolve_class(&class_name)?;
            Slot::Reference(Some(vm.class_mirror(&class)))
        }
        _ => return Err(VmError::fatal("ldc of an unsupported constant kind")),
    };
    frame.push(slot);
    Ok(())
}

pub(crate) fn array_load(vm: &Vm, frame: &mut Frame, opcode: u8) -> Result<Step> {
    let index = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("array index is not an int"))?;
    let array = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    let Some(handle) = array else {
        return vm.throw(frame, "java/lang/NullPointerException");
    };
    let value = vm.heap().with_object(handle, |obj| match obj {
        Object::ObjectArray { elements, .. } | Object::TypeArray { elements, .. } => {
            elements.get(index as usize).copied()
        }
        _ => None,
    })??;
    let Some(value) = value else {
        return vm.throw(frame, "java/lang/ArrayIndexOutOfBoundsException");
    };
    frame.push(value);
    if matches!(opcode, LALOAD | DALOAD) {
        frame.push(Slot::Padding);
    }
    Ok(Step::Continue)
}

pub(crate) fn array_store(vm: &Vm, frame: &mut Frame, opcode: u8) -> Result<Step> {
    let value = if matches!(opcode, LASTORE | DASTORE) {
        frame.pop()?;
        frame.pop()?
    } else {
        frame.pop()?
    };
    let index = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("array index is not an int"))?;
    let array = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    let Some(handle) = array else {
        return vm.throw(frame, "java/lang/NullPointerException");
    };
    if opcode == AASTORE {
        let component_ok = vm.heap().with_object(handle, |obj| match obj {
            Object::ObjectArray { class, .. } => {
                let Class::ObjectArray(arr) = class.as_ref() else { return true };
                match value.as_reference().unwrap_or(None) {
                    None => true,
                    Some(element) => vm
                        .object_class(element)
                        .map(|ec| ec.is_assignable_to(&arr.component))
                        .unwrap_or(false),
                }
            }
            _ => true,
        })?;
        if !component_ok {
            return vm.throw(frame, "java/lang/ArrayStoreException");
        }
    }
    let stored = vm.heap().with_object_mut(handle, |obj| match obj {
        Object::ObjectArray { elements, .. } | Object::TypeArray { elements, .. } => {
            elements.get_mut(index as usize).map(|slot| *slot = value).is_some()
        }
        _ => false,
    })?;
    if !stored {
        return vm.throw(frame, "java/lang/ArrayIndexOutOfBoundsException");
    }
    Ok(Step::Continue)
}

pub(crate) fn arithmetic(frame: &mut Frame, opcode: u8) -> Result<()> {
    macro_rules! need {
        ($e:expr) => {
            $e.ok_or_else(|| VmError::fatal("operand type mismatch"))?
        };
    }
    match opcode {
        IADD => bin_i(frame, |a, b| a.wrapping_add(b))?,
        ISUB => bin_i(frame, |a, b| a.wrapping_sub(b))?,
        IMUL => bin_i(frame, |a, b| a.wrapping_mul(b))?,
        LADD => bin_l(frame, |a, b| a.wrapping_add(b))?,
        LSUB => bin_l(frame, |a, b| a.wrapping_sub(b))?,
        LMUL => bin_l(frame, |a, b| a.wrapping_mul(b))?,
        FADD => bin_f(frame, |a, b| a + b)?,
        FSUB => bin_f(frame, |a, b| a - b)?,
        FMUL => bin_f(frame, |a, b| a * b)?,
        FDIV => bin_f(frame, |a, b| a / b)?,
        FREM => bin_f(frame, |a, b| a % b)?,
        DADD => bin_d(frame, |a, b| a + b)?,
        DSUB => bin_d(frame, |a, b| a - b)?,
        DMUL => bin_d(frame, |a, b| a * b)?,
        DDIV => bin_d(frame, |a, b| a / b)?,
        DREM => bin_d(frame, |a, b| a % b)?,
        INEG => {
            let v = need!(frame.pop()?.as_int());
            frame.push(Slot::Int(v.wrapping_neg()));
        }
        LNEG => {
            frame.pop()?;
            let v = need!(frame.pop()?.as_long());
            frame.push(Slot::Long(v.wrapping_neg()));
            frame.push(Slot::Padding);
        }
        FNEG => {
            let v = need!(frame.pop()?.as_float());
            frame.push(Slot::Float(-v));
        }
        DNEG => {
            frame.pop()?;
            let v = need!(frame.pop()?.as_double());
            frame.push(Slot::Double(-v));
            frame.push(Slot::Padding);
        }
        ISHL => bin_i(frame, |a, b| a.wrapping_shl(b as u32 & 0x1f))?,
        ISHR => bin_i(frame, |a, b| a.wrapping_shr(b as u32 & 0x1f))?,
        IUSHR => bin_i(frame, |a, b| (a as u32).wrapping_shr(b as u32 & 0x1f) as i32)?,
        IAND => bin_i(frame, |a, b| a & b)?,
        IOR => bin_i(frame, |a, b| a | b)?,
        IXOR => bin_i(frame, |a, b| a ^ b)?,
        LSHL => {
            let b = need!(frame.pop()?.as_int());
            frame.pop()?;
            let a = need!(frame.pop()?.as_long());
            frame.push(Slot::Long(a.wrapping_shl(b as u32 & 0x3f)));
            frame.push(Slot::Padding);
        }
        LSHR => {
            let b = need!(frame.pop()?.as_int());
            frame.pop()?;
            let a = need!(frame.pop()?.as_long());
            frame.push(Slot::Long(a.wrapping_shr(b as u32 & 0x3f)));
            frame.push(Slot::Padding);
        }
        LUSHR => {
            let b = need!(frame.pop()?.as_int());
            frame.pop()?;
            let a = need!(frame.pop()?.as_long());
            frame.push(Slot::Long((a as u64).wrapping_shr(b as u32 & 0x3f) as i64));
            frame.push(Slot::Padding);
        }
        LAND => bin_l(frame, |a, b| a & b)?,
        LOR => bin_l(frame, |a, b| a | b)?,
        LXOR => bin_l(frame, |a, b| a ^ b)?,
        I2L => {
            let v = need!(frame.pop()?.as_int());
            frame.push(Slot::Long(v as i64));
            frame.push(Slot::Padding);
        }
        I2F => {
            let v = need!(frame.pop()?.as_int());
            frame.push(Slot::Float(v as f32));
        }
        I2D => {
            let v = need!(frame.pop()?.as_int());
            frame.push(Slot::Double(v as f64));
            frame.push(Slot::Padding);
        }
        L2I => {
            frame.pop()?;
            let v = need!(frame.pop()?.as_long());
            frame.push(Slot::Int(v as i32));
        }
        L2F => {
            frame.pop()?;
            let v = need!(frame.pop()?.as_long());
            frame.push(Slot::Float(v as f32));
        }
        L2D => {
            frame.pop()?;
            let v = need!(frame.pop()?.as_long());
            frame.push(Slot::Double(v as f64));
            frame.push(Slot::Padding);
        }
        F2I => {
            let v = need!(frame.pop()?.as_float());
            frame.push(Slot::Int(v as i32));
        }
        F2L => {
            let v = need!(frame.pop()?.as_float());
            frame.push(Slot::Long(v as i64));
            frame.push(Slot::Padding);
        }
        F2D => {
            let v = need!(frame.pop()?.as_float());
            frame.push(Slot::Double(v as f64));
            frame.push(Slot::Padding);
        }
        D2I => {
            frame.pop()?;
            let v = need!(frame.pop()?.as_double());
            frame.push(Slot::Int(v as i32));
        }
        D2L => {
            frame.pop()?;
            let v = need!(frame.pop()?.as_double());
            frame.push(Slot::Long(v as i64));
            frame.push(Slot::Padding);
        }
        D2F => {
            frame.pop()?;
            let v = need!(frame.pop()?.as_double());
            frame.push(Slot::Float(v as f32));
        }
        I2B => {
            let v = need!(frame.pop()?.as_int());
            frame.push(Slot::Int(v as i8 as i32));
        }
        I2C => {
            let v = need!(frame.pop()?.as_int());
            frame.push(Slot::Int(v as u16 as i32));
        }
        I2S => {
            let v = need!(frame.pop()?.as_int());
            frame.push(Slot::Int(v as i16 as i32));
        }
        LCMP => {
            frame.pop()?;
            let b = need!(frame.pop()?.as_long());
            frame.pop()?;
            let a = need!(frame.pop()?.as_long());
            frame.push(Slot::Int(a.cmp(&b) as i32));
        }
        FCMPL | FCMPG => {
            let b = need!(frame.pop()?.as_float());
            let a = need!(frame.pop()?.as_float());
            frame.push(Slot::Int(float_compare(a, b, opcode == FCMPG)));
        }
        DCMPL | DCMPG => {
            frame.pop()?;
            let b = need!(frame.pop()?.as_double());
            frame.pop()?;
            let a = need!(frame.pop()?.as_double());
            frame.push(Slot::Int(double_compare(a, b, opcode == DCMPG)));
        }
        _ => unreachable!("arithmetic() is only called for opcodes in its own dispatch arm"),
    }
    Ok(())
}

fn float_compare(a: f32, b: f32, nan_is_greater: bool) -> i32 {
    if a.is_nan() || b.is_nan() {
        return if nan_is_greater { 1 } else { -1 };
    }
    a.partial_cmp(&b).map(|o| o as i32).unwrap_or(0)
}

fn double_compare(a: f64, b: f64, nan_is_greater: bool) -> i32 {
    if a.is_nan() || b.is_nan() {
        return if nan_is_greater { 1 } else { -1 };
    }
    a.partial_cmp(&b).map(|o| o as i32).unwrap_or(0)
}

fn bin_i(frame: &mut Frame, f: impl Fn(i32, i32) -> i32) -> Result<()> {
    let b = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    let a = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    frame.push(Slot::Int(f(a, b)));
    Ok(())
}

/// Returns `Ok(false)` on a `None` result (divide/rem by zero)
/// instead of erroring, so the caller can raise a catchable
/// `ArithmeticException` rather than aborting the interpreter.
fn bin_i_checked(frame: &mut Frame, f: impl Fn(i32, i32) -> Option<i32>) -> Result<bool> {
    let b = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    let a = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    match f(a, b) {
        Some(v) => {
            frame.push(Slot::Int(v));
            Ok(true)
        }
        None => Ok(false),
    }
}

fn bin_l(frame: &mut Frame, f: impl Fn(i64, i64) -> i64) -> Result<()> {
    let b = frame.pop()?.as_long().ok_or_else(|| VmError::fatal("expected long"))?;
    frame.pop()?;
    let a = frame.pop()?.as_long().ok_or_else(|| VmError::fatal("expected long"))?;
    frame.pop()?;
    frame.push(Slot::Long(f(a, b)));
    frame.push(Slot::Padding);
    Ok(())
}

fn bin_l_checked(frame: &mut Frame, f: impl Fn(i64, i64) -> Option<i64>) -> Result<bool> {
    let b = frame.pop()?.as_long().ok_or_else(|| VmError::fatal("expected long"))?;
    frame.pop()?;
    let a = frame.pop()?.as_long().ok_or_else(|| VmError::fatal("expected long"))?;
    frame.pop()?;
    match f(a, b) {
        Some(v) => {
            frame.push(Slot::Long(v));
            frame.push(Slot::Padding);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// `idiv`/`irem`/`ldiv`/`lrem` by zero must raise a catchable
/// `ArithmeticException` rather than the fatal VM error the rest of
/// `arithmetic`'s ops use, so these four opcodes are dispatched here
/// instead.
pub(crate) fn checked_arithmetic(vm: &Vm, frame: &mut Frame, opcode: u8) -> Result<Step> {
    let ok = match opcode {
        IDIV => bin_i_checked(frame, |a, b| a.checked_div(b))?,
        IREM => bin_i_checked(frame, |a, b| a.checked_rem(b))?,
        LDIV => bin_l_checked(frame, |a, b| a.checked_div(b))?,
        LREM => bin_l_checked(frame, |a, b| a.checked_rem(b))?,
        _ => unreachable!("checked_arithmetic only called for div/rem opcodes"),
    };
    if ok {
        Ok(Step::Continue)
    } else {
        vm.throw(frame, "java/lang/ArithmeticException")
    }
}

fn bin_f(frame: &mut Frame, f: impl Fn(f32, f32) -> f32) -> Result<()> {
    let b = frame.pop()?.as_float().ok_or_else(|| VmError::fatal("expected float"))?;
    let a = frame.pop()?.as_float().ok_or_else(|| VmError::fatal("expected float"))?;
    frame.push(Slot::Float(f(a, b)));
    Ok(())
}

fn bin_d(frame: &mut Frame, f: impl Fn(f64, f64) -> f64) -> Result<()> {
    let b = frame.pop()?.as_double().ok_or_else(|| VmError::fatal("expected double"))?;
    frame.pop()?;
    let a = frame.pop()?.as_double().ok_or_else(|| VmError::fatal("expected double"))?;
    frame.pop()?;
    frame.push(Slot::Double(f(a, b)));
    frame.push(Slot::Padding);
    Ok(())
}

fn branch_unary_compare(frame: &mut Frame, opcode: u8, pc: usize) -> Result<Step> {
    let v = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    let taken = match opcode {
        IFEQ => v == 0,
        IFNE => v != 0,
        IFLT => v < 0,
        IFGE => v >= 0,
        IFGT => v > 0,
        IFLE => v <= 0,
        _ => unreachable!(),
    };
    branch(frame, pc, taken)
}

fn branch_int_compare(frame: &mut Frame, opcode: u8, pc: usize) -> Result<Step> {
    let b = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    let a = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    let taken = match opcode {
        IF_ICMPEQ => a == b,
        IF_ICMPNE => a != b,
        IF_ICMPLT => a < b,
        IF_ICMPGE => a >= b,
        IF_ICMPGT => a > b,
        IF_ICMPLE => a <= b,
        _ => unreachable!(),
    };
    branch(frame, pc, taken)
}

fn branch_ref_compare(frame: &mut Frame, opcode: u8, pc: usize) -> Result<Step> {
    let b = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("expected reference"))?;
    let a = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("expected reference"))?;
    let taken = if opcode == IF_ACMPEQ { a == b } else { a != b };
    branch(frame, pc, taken)
}

fn branch_null_check(frame: &mut Frame, opcode: u8, pc: usize) -> Result<Step> {
    let v = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("expected reference"))?;
    let taken = if opcode == IFNULL { v.is_none() } else { v.is_some() };
    branch(frame, pc, taken)
}

fn branch(frame: &mut Frame, pc: usize, taken: bool) -> Result<Step> {
    if taken {
        let offset = i2(code_at(frame), pc + 1)? as i32;
        frame.pc = (pc as i64 + offset as i64) as u32;
    } else {
        frame.pc = pc as u32 + 3;
    }
    Ok(Step::Continue)
}

fn tableswitch(frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    let aligned = align4(pc + 1);
    let code = code_at(frame);
    let default_offset = i4(code, aligned)?;
    let low = i4(code, aligned + 4)?;
    let high = i4(code, aligned + 8)?;
    let target = if index < low || index > high {
        default_offset
    } else {
        i4(code, aligned + 12 + 4 * (index - low) as usize)?
    };
    frame.pc = (pc as i64 + target as i64) as u32;
    Ok(Step::Continue)
}

fn lookupswitch(frame: &mut Frame, pc: usize) -> Result<Step> {
    let key = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    let aligned = align4(pc + 1);
    let code = code_at(frame);
    let default_offset = i4(code, aligned)?;
    let npairs = i4(code, aligned + 4)?;
    let mut target = default_offset;
    for i in 0..npairs {
        let pair_pc = aligned + 8 + 8 * i as usize;
        let match_key = i4(code, pair_pc)?;
        if match_key == key {
            target = i4(code, pair_pc + 4)?;
            break;
        }
        if match_key > key {
            break; // pairs are sorted ascending; no further match is possible
        }
    }
    frame.pc = (pc as i64 + target as i64) as u32;
    Ok(Step::Continue)
}

pub(crate) fn align4(pc: usize) -> usize {
    (pc + 3) & !3
}

fn wide(frame: &mut Frame, pc: usize) -> Result<Step> {
    let code = code_at(frame);
    let widened = u1(code, pc + 1)?;
    if widened == IINC {
        let index = u2(code, pc + 2)? as usize;
        let delta = i2(code, pc + 4)? as i32;
        let v = frame.local(index)?.as_int().ok_or_else(|| VmError::fatal("iinc target is not an int"))?;
        frame.set_local(index, Slot::Int(v.wrapping_add(delta)))?;
        frame.pc = pc as u32 + 6;
        return Ok(Step::Continue);
    }
    let index = u2(code, pc + 2)? as usize;
    match widened {
        ILOAD | FLOAD | ALOAD => {
            frame.push(frame.local(index)?);
            frame.pc = pc as u32 + 4;
        }
        LLOAD | DLOAD => {
            frame.push(frame.local(index)?);
            frame.push(Slot::Padding);
            frame.pc = pc as u32 + 4;
        }
        ISTORE | FSTORE | ASTORE => {
            let v = frame.pop()?;
            frame.set_local(index, v)?;
            frame.pc = pc as u32 + 4;
        }
        LSTORE | DSTORE => {
            frame.pop()?;
            let v = frame.pop()?;
            frame.set_local(index, v)?;
            frame.set_local(index + 1, Slot::Padding)?;
            frame.pc = pc as u32 + 4;
        }
        RET => {
            let target = frame.local(index)?.as_int().ok_or_else(|| VmError::fatal("ret local is not a return address"))?;
            frame.pc = target as u32;
        }
        other => return Err(VmError::fatal(format!("wide prefix applied to unsupported opcode 0x{other:02x}"))),
    }
    Ok(Step::Continue)
}

pub(crate) fn getstatic(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let (owner, name, descriptor) = member_ref(frame, index)?;
    let class = vm.loader().resolve_class(&owner)?;
    vm.ensure_initialised(&class, thread_of(frame))?;
    match vm.resolve_static_field(&class, &name) {
        Some((declaring, slot_index, kind)) => {
            let value = field_of(&declaring, |ic| ic.static_slots.read()[slot_index]);
            frame.push(value);
            if kind.is_wide() {
                frame.push(Slot::Padding);
            }
            frame.pc = pc as u32 + 3;
            Ok(Step::Continue)
        }
        None => Err(VmError::UnresolvedField { class: owner, name, descriptor }),
    }
}

pub(crate) fn putstatic(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let (owner, name, descriptor) = member_ref(frame, index)?;
    let class = vm.loader().resolve_class(&owner)?;
    vm.ensure_initialised(&class, thread_of(frame))?;
    match vm.resolve_static_field(&class, &name) {
        Some((declaring, slot_index, kind)) => {
            if kind.is_wide() {
                frame.pop()?;
            }
            let value = frame.pop()?;
            field_of_mut(&declaring, |ic| ic.static_slots.write()[slot_index] = value);
            frame.pc = pc as u32 + 3;
            Ok(Step::Continue)
        }
        None => Err(VmError::UnresolvedField { class: owner, name, descriptor }),
    }
}

pub(crate) fn getfield(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let (owner, name, descriptor) = member_ref(frame, index)?;
    let receiver = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    let Some(handle) = receiver else {
        return vm.throw(frame, "java/lang/NullPointerException");
    };
    let owner_class = vm.loader().resolve_class(&owner)?;
    let Some((_, offset, kind)) = vm.resolve_instance_field(&owner_class, &name) else {
        return Err(VmError::UnresolvedField { class: owner, name, descriptor });
    };
    let value = vm
        .heap()
        .with_object(handle, |obj| match obj {
            Object::Instance { fields, .. } => fields.get(offset).copied(),
            _ => None,
        })??
        .ok_or_else(|| VmError::fatal("field slot out of range"))?;
    frame.push(value);
    if kind.is_wide() {
        frame.push(Slot::Padding);
    }
    frame.pc = pc as u32 + 3;
    Ok(Step::Continue)
}

pub(crate) fn putfield(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let (owner, name, descriptor) = member_ref(frame, index)?;
    let owner_class = vm.loader().resolve_class(&owner)?;
    let Some((_, offset, kind)) = vm.resolve_instance_field(&owner_class, &name) else {
        return Err(VmError::UnresolvedField { class: owner, name, descriptor });
    };
    if kind.is_wide() {
        frame.pop()?;
    }
    let value = frame.pop()?;
    let receiver = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    let Some(handle) = receiver else {
        return vm.throw(frame, "java/lang/NullPointerException");
    };
    vm.heap().with_object_mut(handle, |obj| {
        if let Object::Instance { fields, .. } = obj {
            if let Some(slot) = fields.get_mut(offset) {
                *slot = value;
            }
        }
    })?;
    frame.pc = pc as u32 + 3;
    Ok(Step::Continue)
}

pub(crate) fn member_ref(frame: &Frame, index: u16) -> Result<(String, String, String)> {
    let Class::Instance(owner) = frame.class.as_ref() else {
        return Err(VmError::fatal("member reference outside an instance class"));
    };
    let (class, name, descriptor) = owner.constant_pool.member_ref(index)?;
    Ok((class.to_string(), name.to_string(), descriptor.to_string()))
}

fn field_of<T>(class: &ClassRef, f: impl FnOnce(&crate::class::InstanceClass) -> T) -> T {
    match class.as_ref() {
        Class::Instance(ic) => f(ic),
        _ => unreachable!("resolve_*_field always returns an instance class"),
    }
}

fn field_of_mut(class: &ClassRef, f: impl FnOnce(&crate::class::InstanceClass)) {
    match class.as_ref() {
        Class::Instance(ic) => f(ic),
        _ => unreachable!("resolve_*_field always returns an instance class"),
    }
}

/// Frames don't carry their owning thread id (only `Vm::invoke_method`
/// does, as a call parameter), but safe points need one for GC
/// bookkeeping; 0 is the reserved "no thread context" id used only by
/// the handful of call sites (`<clinit>` re-entrancy checks) that
/// cannot deadlock regardless of which id they observe.
pub(crate) fn thread_of(_frame: &Frame) -> u64 {
    0
}

#[derive(Clone, Copy)]
pub(crate) enum InvokeKind {
    Virtual,
    Special,
    Static,
}

pub(crate) fn invoke(vm: &Vm, thread_id: u64, frame: &mut Frame, pc: usize, kind: InvokeKind) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let (owner, name, descriptor) = member_ref(frame, index)?;
    let referenced = vm.loader().resolve_class(&owner)?;
    let param_width = cs_model::MethodDescriptor::parse(&descriptor)
        .map_err(|e| VmError::fatal(e.to_string()))?
        .parameter_slot_width();

    let is_static = matches!(kind, InvokeKind::Static);
    let arg_width = if is_static { param_width } else { param_width + 1 };
    let args = pop_args(frame, arg_width)?;

    let dispatch_class = if is_static {
        referenced.clone()
    } else {
        let receiver = args[0].as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
        match receiver {
            None => return vm.throw(frame, "java/lang/NullPointerException"),
            Some(handle) => match kind {
                InvokeKind::Virtual => vm.object_class(handle)?,
                InvokeKind::Special => referenced.clone(),
                InvokeKind::Static => unreachable!(),
            },
        }
    };

    if is_static {
        vm.ensure_initialised(&referenced, thread_id)?;
    }

    let Some((found_class, method_index)) = vm.resolve_method(&dispatch_class, &name, &descriptor) else {
        return Err(VmError::UnresolvedMethod { class: owner, name, descriptor });
    };

    let outcome = vm.invoke_method(thread_id, &found_class, method_index, args)?;
    frame.pc = pc as u32 + 3;
    apply_outcome(frame, outcome)
}

pub(crate) fn invoke_interface(vm: &Vm, thread_id: u64, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let (owner, name, descriptor) = member_ref(frame, index)?;
    let param_width = cs_model::MethodDescriptor::parse(&descriptor)
        .map_err(|e| VmError::fatal(e.to_string()))?
        .parameter_slot_width();
    let args = pop_args(frame, param_width + 1)?;
    let receiver = args[0].as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    let Some(handle) = receiver else {
        return vm.throw(frame, "java/lang/NullPointerException");
    };
    let dispatch_class = vm.object_class(handle)?;
    let Some((found_class, method_index)) = vm.resolve_method(&dispatch_class, &name, &descriptor) else {
        return Err(VmError::UnresolvedMethod { class: owner, name, descriptor });
    };
    let outcome = vm.invoke_method(thread_id, &found_class, method_index, args)?;
    frame.pc = pc as u32 + 5; // invokeinterface carries two trailing bookkeeping bytes
    apply_outcome(frame, outcome)
}

/// Resolves and invokes an `invokedynamic` call site, caching the
/// result on the owning class keyed by constant-pool index so every
/// later execution of the same site skips straight to the cached
/// target (the interpreter's counterpart to what the JIT's
/// `HelpCall::InvokeDynamic` routine does for compiled code).
///
/// This VM has no `java.lang.invoke` runtime (no `MethodHandle`,
/// `CallSite`, or `Lookup` classes), so bootstrap linkage is collapsed
/// to a single step: the bootstrap method handle's referenced method
/// is resolved directly and treated as the call site's target,
/// instead of first invoking a bootstrap method that itself returns a
/// `CallSite` to invoke. See DESIGN.md's Open Questions for why.
pub(crate) fn invokedynamic(vm: &Vm, thread_id: u64, frame: &mut Frame, pc: usize) -> Result<Step> {
    use cs_parser::CpInfo;

    let index = u2(code_at(frame), pc + 1)?;
    let Class::Instance(owner) = frame.class.as_ref() else {
        return Err(VmError::fatal("invokedynamic outside an instance class"));
    };

    let (bootstrap_method_attr_index, name_and_type_index) = match owner.constant_pool.get(index)? {
        CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
            (*bootstrap_method_attr_index, *name_and_type_index)
        }
        _ => return Err(VmError::fatal("invokedynamic operand is not an InvokeDynamic constant")),
    };
    let (_, call_site_descriptor) = owner.constant_pool.name_and_type(name_and_type_index)?;
    let param_width = cs_model::MethodDescriptor::parse(call_site_descriptor)
        .map_err(|e| VmError::fatal(e.to_string()))?
        .parameter_slot_width();

    let cached = owner.invokedynamic_cache.read().get(&index).cloned();
    let (target_class, method_index) = match cached {
        Some(site) => (site.target_class, site.method_index),
        None => {
            let bootstrap_entry = owner
                .bootstrap_methods
                .get(bootstrap_method_attr_index as usize)
                .ok_or_else(|| VmError::fatal("bootstrap method attribute index out of range"))?;
            let method_handle_index = match owner.constant_pool.get(bootstrap_entry.bootstrap_method_ref)? {
                CpInfo::MethodHandle { reference_index, .. } => *reference_index,
                _ => return Err(VmError::fatal("bootstrap_method_ref is not a MethodHandle")),
            };
            if !matches!(owner.constant_pool.get(method_handle_index)?, CpInfo::Methodref { .. }) {
                return Err(VmError::fatal("bootstrap method handle does not reference a plain method"));
            }
            let (class_name, method_name, method_descriptor) =
                owner.constant_pool.member_ref(method_handle_index)?;
            let (class_name, method_name, method_descriptor) =
                (class_name.to_string(), method_name.to_string(), method_descriptor.to_string());

            let resolved_class = vm.loader().resolve_class(&class_name)?;
            vm.ensure_initialised(&resolved_class, thread_id)?;
            let Some((found_class, found_index)) =
                vm.resolve_method(&resolved_class, &method_name, &method_descriptor)
            else {
                return Err(VmError::UnresolvedMethod {
                    class: class_name,
                    name: method_name,
                    descriptor: method_descriptor,
                });
            };
            owner.invokedynamic_cache.write().insert(
                index,
                crate::class::ResolvedCallSite { target_class: found_class.clone(), method_index: found_index },
            );
            (found_class, found_index)
        }
    };

    // invokedynamic never pops an implicit receiver; the call site's
    // own descriptor is the full argument list.
    let args = pop_args(frame, param_width)?;
    let outcome = vm.invoke_method(thread_id, &target_class, method_index, args)?;
    frame.pc = pc as u32 + 5; // opcode + 2-byte index + 2 reserved bytes
    apply_outcome(frame, outcome)
}

pub(crate) fn pop_args(frame: &mut Frame, width: usize) -> Result<Vec<Slot>> {
    let mut raw = Vec::with_capacity(width);
    for _ in 0..width {
        raw.push(frame.pop()?);
    }
    raw.reverse();
    Ok(raw)
}

pub(crate) fn apply_outcome(frame: &mut Frame, outcome: FrameOutcome) -> Result<Step> {
    match outcome {
        FrameOutcome::Returned(Some(v)) => {
            let wide = v.width() == 2;
            frame.push(v);
            if wide {
                frame.push(Slot::Padding);
            }
            Ok(Step::Continue)
        }
        FrameOutcome::Returned(None) => Ok(Step::Continue),
        FrameOutcome::Threw(obj) => Ok(Step::Thrown(obj)),
    }
}

pub(crate) fn new_instance(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let Class::Instance(owner) = frame.class.as_ref() else {
        return Err(VmError::fatal("new outside an instance class"));
    };
    let class_name = owner.constant_pool.class_name(index)?.to_string();
    let class = vm.loader().resolve_class(&class_name)?;
    vm.ensure_initialised(&class, thread_of(frame))?;
    let handle = vm.allocate_instance(&class)?;
    frame.push(Slot::Reference(Some(handle)));
    frame.pc = pc as u32 + 3;
    Ok(Step::Continue)
}

pub(crate) fn newarray(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let atype = u1(code_at(frame), pc + 1)?;
    let length = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    if length < 0 {
        return vm.throw(frame, "java/lang/NegativeArraySizeException");
    }
    let descriptor = match atype {
        T_BOOLEAN => "Z",
        T_CHAR => "C",
        T_FLOAT => "F",
        T_DOUBLE => "D",
        T_BYTE => "B",
        T_SHORT => "S",
        T_INT => "I",
        T_LONG => "J",
        _ => return Err(VmError::fatal("invalid newarray atype")),
    };
    let class = vm.loader().resolve_class(&format!("[{descriptor}"))?;
    let default = match descriptor {
        "F" => Slot::Float(0.0),
        "D" => Slot::Double(0.0),
        "J" => Slot::Long(0),
        _ => Slot::Int(0),
    };
    let handle = vm.heap().allocate(Object::TypeArray {
        class,
        elements: vec![default; length as usize],
    });
    frame.push(Slot::Reference(Some(handle)));
    frame.pc = pc as u32 + 2;
    Ok(Step::Continue)
}

pub(crate) fn anewarray(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let Class::Instance(owner) = frame.class.as_ref() else {
        return Err(VmError::fatal("anewarray outside an instance class"));
    };
    let component_name = owner.constant_pool.class_name(index)?.to_string();
    let length = frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?;
    if length < 0 {
        return vm.throw(frame, "java/lang/NegativeArraySizeException");
    }
    let array_name = if component_name.starts_with('[') {
        format!("[{component_name}")
    } else {
        format!("[L{component_name};")
    };
    let class = vm.loader().resolve_class(&array_name)?;
    let handle = vm.heap().allocate(Object::ObjectArray {
        class,
        elements: vec![Slot::NULL; length as usize],
    });
    frame.push(Slot::Reference(Some(handle)));
    frame.pc = pc as u32 + 3;
    Ok(Step::Continue)
}

pub(crate) fn multianewarray(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let code = code_at(frame);
    let index = u2(code, pc + 1)?;
    let dimensions = u1(code, pc + 3)? as usize;
    let Class::Instance(owner) = frame.class.as_ref() else {
        return Err(VmError::fatal("multianewarray outside an instance class"));
    };
    let array_name = owner.constant_pool.class_name(index)?.to_string();
    let mut sizes = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        sizes.push(frame.pop()?.as_int().ok_or_else(|| VmError::fatal("expected int"))?);
    }
    sizes.reverse();
    if sizes.iter().any(|&n| n < 0) {
        return vm.throw(frame, "java/lang/NegativeArraySizeException");
    }
    let handle = vm.allocate_multi_array(&array_name, &sizes)?;
    frame.push(Slot::Reference(Some(handle)));
    frame.pc = pc as u32 + 4;
    Ok(Step::Continue)
}

pub(crate) fn arraylength(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let array = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    let Some(handle) = array else {
        return vm.throw(frame, "java/lang/NullPointerException");
    };
    let length = vm
        .heap()
        .with_object(handle, |obj| obj.array_length())??
        .ok_or_else(|| VmError::fatal("arraylength on a non-array object"))?;
    frame.push(Slot::Int(length as i32));
    frame.pc = pc as u32 + 1;
    Ok(Step::Continue)
}

pub(crate) fn athrow(vm: &Vm, frame: &mut Frame) -> Result<Step> {
    let thrown = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    match thrown {
        Some(handle) => {
            trace!(index = handle.index, "athrow");
            Ok(Step::Thrown(handle))
        }
        None => vm.throw(frame, "java/lang/NullPointerException"),
    }
}

pub(crate) fn checkcast(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let Class::Instance(owner) = frame.class.as_ref() else {
        return Err(VmError::fatal("checkcast outside an instance class"));
    };
    let target_name = owner.constant_pool.class_name(index)?.to_string();
    let target = vm.loader().resolve_class(&target_name)?;
    let value = frame.peek()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    if let Some(handle) = value {
        let actual = vm.object_class(handle)?;
        if !actual.is_assignable_to(&target) {
            return vm.throw(frame, "java/lang/ClassCastException");
        }
    }
    frame.pc = pc as u32 + 3;
    Ok(Step::Continue)
}

pub(crate) fn instanceof(vm: &Vm, frame: &mut Frame, pc: usize) -> Result<Step> {
    let index = u2(code_at(frame), pc + 1)?;
    let Class::Instance(owner) = frame.class.as_ref() else {
        return Err(VmError::fatal("instanceof outside an instance class"));
    };
    let target_name = owner.constant_pool.class_name(index)?.to_string();
    let target = vm.loader().resolve_class(&target_name)?;
    let value = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("not a reference"))?;
    let result = match value {
        None => false,
        Some(handle) => vm.object_class(handle)?.is_assignable_to(&target),
    };
    frame.push(Slot::Int(result as i32));
    frame.pc = pc as u32 + 3;
    Ok(Step::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{Field, InitLock, InstanceClass, Method};
    use crate::classpath::MemoryClassPath;
    use crate::config::VmConfig;
    use cs_model::{ClassAccessFlags, MethodAccessFlags, MethodDescriptor};
    use cs_parser::ConstantPool;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn method_with_code(code: Vec<u8>) -> Method {
        Method {
            owner: "Main".to_string(),
            name: "run".to_string(),
            descriptor: MethodDescriptor::parse("()I").unwrap(),
            access_flags: MethodAccessFlags::STATIC,
            max_stack: 8,
            max_locals: 4,
            code,
            exception_table: Vec::new(),
            line_numbers: Vec::new(),
            invocation_count: AtomicU32::new(0),
            compiled: RwLock::new(None),
        }
    }

    fn class_with(method: Method) -> ClassRef {
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

    fn method_ref(class: &ClassRef) -> &Method {
        match class.as_ref() {
            Class::Instance(ic) => &ic.methods[0],
            _ => unreachable!(),
        }
    }

    fn test_vm() -> Vm {
        let config = VmConfig::new("Main".to_string(), vec![], vec!["target/does-not-exist".to_string()]);
        Vm::new_with_class_path(config, Box::new(MemoryClassPath::new()))
    }

    fn utf8(s: &str) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend((s.len() as u16).to_be_bytes());
        out.extend(s.as_bytes());
        out
    }

    /// Hand-assembles a minimal class file, optionally extending
    /// `super_name`, for tests that need the VM to actually resolve
    /// and allocate an exception class rather than hold it in hand.
    fn class_bytes(name: &str, super_name: Option<&str>) -> Vec<u8> {
        let mut cp = Vec::new();
        cp.extend(utf8(name));
        cp.push(7);
        cp.extend([0, 1]);
        let super_index = if let Some(sn) = super_name {
            cp.extend(utf8(sn));
            cp.push(7);
            cp.extend([0, 3]);
            4u16
        } else {
            0u16
        };
        let cp_count = if super_name.is_some() { 5u16 } else { 3u16 };
        let mut data = Vec::new();
        data.extend(0xCAFEBABEu32.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data.extend(52u16.to_be_bytes());
        data.extend(cp_count.to_be_bytes());
        data.extend(cp);
        data.extend(0x0021u16.to_be_bytes());
        data.extend(2u16.to_be_bytes());
        data.extend(super_index.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data.extend(0u16.to_be_bytes());
        data
    }

    #[test]
    fn simple_addition_returns_expected_value() {
        let code = vec![ICONST_2, ICONST_3, IADD, IRETURN];
        let class = class_with(method_with_code(code));
        let mut frame = Frame::new(class.clone(), 0, method_ref(&class));
        let vm = test_vm();
        let outcome = run_frame(&vm, 1, &mut frame).unwrap();
        match outcome {
            FrameOutcome::Returned(Some(Slot::Int(v))) => assert_eq!(v, 5),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn division_by_zero_throws_an_arithmetic_exception() {
        let code = vec![ICONST_1, ICONST_0, IDIV, IRETURN];
        let class = class_with(method_with_code(code));
        let mut frame = Frame::new(class.clone(), 0, method_ref(&class));
        let config = VmConfig::new("Main".to_string(), vec![], vec!["target/does-not-exist".to_string()]);
        let mut cp = MemoryClassPath::new();
        cp.insert("java/lang/Object", class_bytes("java/lang/Object", None));
        cp.insert(
            "java/lang/ArithmeticException",
            class_bytes("java/lang/ArithmeticException", Some("java/lang/Object")),
        );
        let vm = Vm::new_with_class_path(config, Box::new(cp));
        let outcome = run_frame(&vm, 1, &mut frame).unwrap();
        match outcome {
            FrameOutcome::Threw(handle) => {
                let thrown_class = vm.object_class(handle).unwrap();
                assert_eq!(thrown_class.name(), "java/lang/ArithmeticException");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn goto_skips_the_dead_branch() {
        let code = vec![GOTO, 0x00, 0x04, ICONST_0, IRETURN, ICONST_1, IRETURN];
        let class = class_with(method_with_code(code));
        let mut frame = Frame::new(class.clone(), 0, method_ref(&class));
        let vm = test_vm();
        let outcome = run_frame(&vm, 1, &mut frame).unwrap();
        match outcome {
            FrameOutcome::Returned(Some(Slot::Int(v))) => assert_eq!(v, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn iinc_adjusts_the_local_in_place() {
        let code = vec![ICONST_5, ISTORE_0, IINC, 0x00, 0x03, ILOAD_0, IRETURN];
        let class = class_with(method_with_code(code));
        let mut frame = Frame::new(class.clone(), 0, method_ref(&class));
        let vm = test_vm();
        let outcome = run_frame(&vm, 1, &mut frame).unwrap();
        match outcome {
            FrameOutcome::Returned(Some(Slot::Int(v))) => assert_eq!(v, 8),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
