//! The fixed help-routine table `lower.rs` lowers field, array,
//! allocation, invocation, and misc opcodes to. Every entry delegates
//! straight to the matching `pub(crate)` interpreter routine so a
//! compiled method's heap/loader/thread interactions run through
//! exactly the same code a plain interpreted frame would; the two
//! exceptions opcode pairs with no dedicated interpreter routine of
//! their own (`monitorenter`/`monitorexit`, whose logic lives inline
//! in `step_one`) get a small reimplementation here instead.
//!
//! `exec.rs` is the only caller: it stages `Instr::Help`'s operands
//! onto the real frame stack, calls [`call`], and pops/truncates
//! around it. This module never touches the symbolic stack or the IR
//! itself, only a real [`Frame`].

use crate::error::{Result, VmError};
use crate::frame::Frame;
use crate::interpreter::opcodes::NEWARRAY;
use crate::interpreter::{self, InvokeKind, Step};
use crate::vm::Vm;

use super::ir::{HelpCall, InvokeShape, MiscOp};

pub(crate) fn call(vm: &Vm, thread_id: u64, frame: &mut Frame, help: &HelpCall) -> Result<Step> {
    match help {
        HelpCall::GetField { pc } => interpreter::getfield(vm, frame, *pc as usize),
        HelpCall::PutField { pc } => interpreter::putfield(vm, frame, *pc as usize),
        HelpCall::GetStatic { pc } => interpreter::getstatic(vm, frame, *pc as usize),
        HelpCall::PutStatic { pc } => interpreter::putstatic(vm, frame, *pc as usize),
        HelpCall::ArrayLoad { opcode } => interpreter::array_load(vm, frame, *opcode),
        HelpCall::ArrayStore { opcode } => interpreter::array_store(vm, frame, *opcode),
        HelpCall::AllocInstance { pc } => interpreter::new_instance(vm, frame, *pc as usize),
        HelpCall::AllocArray { pc } => {
            let opcode = interpreter::u1(interpreter::code_at(frame), *pc as usize)?;
            if opcode == NEWARRAY {
                interpreter::newarray(vm, frame, *pc as usize)
            } else {
                interpreter::anewarray(vm, frame, *pc as usize)
            }
        }
        HelpCall::AllocMultiArray { pc } => interpreter::multianewarray(vm, frame, *pc as usize),
        HelpCall::ArrayLength { pc } => interpreter::arraylength(vm, frame, *pc as usize),
        HelpCall::CheckedArithmetic { opcode } => interpreter::checked_arithmetic(vm, frame, *opcode),
        HelpCall::InvokeMethod { pc, kind } => {
            interpreter::invoke(vm, thread_id, frame, *pc as usize, invoke_kind(*kind))
        }
        HelpCall::InvokeInterface { pc } => interpreter::invoke_interface(vm, thread_id, frame, *pc as usize),
        HelpCall::InvokeDynamic { pc } => interpreter::invokedynamic(vm, thread_id, frame, *pc as usize),
        HelpCall::LdcRef { index } => {
            interpreter::push_constant(vm, frame, *index)?;
            Ok(Step::Continue)
        }
        HelpCall::Misc(MiscOp::InstanceOf { pc }) => interpreter::instanceof(vm, frame, *pc as usize),
        HelpCall::Misc(MiscOp::CheckCast { pc }) => interpreter::checkcast(vm, frame, *pc as usize),
        HelpCall::Misc(MiscOp::MonitorEnter) => monitor_enter(vm, thread_id, frame),
        HelpCall::Misc(MiscOp::MonitorExit) => monitor_exit(vm, thread_id, frame),
    }
}

fn invoke_kind(shape: InvokeShape) -> InvokeKind {
    match shape {
        InvokeShape::Virtual => InvokeKind::Virtual,
        InvokeShape::Special => InvokeKind::Special,
        InvokeShape::Static => InvokeKind::Static,
    }
}

fn monitor_enter(vm: &Vm, thread_id: u64, frame: &mut Frame) -> Result<Step> {
    let v = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("monitorenter operand is not a reference"))?;
    match v {
        Some(obj) => {
            vm.threads().monitor_enter(obj, thread_id);
            frame.monitor_depth += 1;
            Ok(Step::Continue)
        }
        None => vm.throw(frame, "java/lang/NullPointerException"),
    }
}

fn monitor_exit(vm: &Vm, thread_id: u64, frame: &mut Frame) -> Result<Step> {
    let v = frame.pop()?.as_reference().ok_or_else(|| VmError::fatal("monitorexit operand is not a reference"))?;
    match v {
        Some(obj) => {
            vm.threads().monitor_exit(obj, thread_id)?;
            frame.monitor_depth = frame.monitor_depth.saturating_sub(1);
            Ok(Step::Continue)
        }
        None => vm.throw(frame, "java/lang/NullPointerException"),
    }
}
