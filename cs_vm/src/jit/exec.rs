//! Runs a method's lowered blocks against a live [`Frame`].
//!
//! Each block's register file is a flat map from [`ValueId`] to the
//! real [`Slot`] it currently holds. A block starts by popping its
//! statically-inferred entry shape off `frame.stack` into fresh
//! registers (mirroring how `BlockLowerer::new` seeded the symbolic
//! stack during lowering) and ends, for control-flow terminators that
//! hand off to another compiled block, by pushing the live exit-shape
//! values back onto `frame.stack` before the jump — the literal,
//! physical realization of the cross-block value merge `lower.rs`'s
//! module doc describes.
//!
//! Any [`Instr::Help`] can reach into the heap, the class loader, or
//! the monitor table, any of which can trigger a GC. The GC's root
//! scan (`interpreter::collect_thread_roots`) only ever walks
//! `frame.locals` and `frame.stack` — it has no notion of this
//! module's register file — so every register currently live is
//! spilled onto the real stack before such a call and discarded again
//! right after, keeping the scanner oblivious to the fact that a
//! compiled method is running at all.

use std::collections::HashMap;

use cs_model::{Slot, SlotKind};

use crate::error::{Result, VmError};
use crate::frame::Frame;
use crate::interpreter::{self, FrameOutcome, Step};
use crate::vm::Vm;

use super::ir::{HelpCall, Instr, IntPredicate, IrConst, LoweredBlock, Terminator};

/// A method's full set of lowered blocks, indexed the same way
/// `cfg::MethodCfg::blocks` is: `blocks[i]` is the compiled form of
/// CFG block `i`.
pub struct CompiledMethod {
    pub blocks: Vec<LoweredBlock>,
}

type Registers = HashMap<u32, Slot>;

/// Drives `frame` through its method's compiled blocks until it
/// returns or an exception escapes. `maybe_compile` never compiles a
/// method with a non-empty exception table (a catch handler's entry
/// pc is not a block boundary the lowerer tracks), so any exception
/// reaching a compiled frame has nowhere local to be caught and
/// always propagates to the caller, matching what an interpreted
/// frame would do once its own handler search comes up empty.
pub fn run_compiled(compiled: &CompiledMethod, vm: &Vm, thread_id: u64, frame: &mut Frame) -> Result<FrameOutcome> {
    let _guard = interpreter::push_frame_for_roots(frame);
    let mut block_index: u32 = 0;

    loop {
        let block = compiled
            .blocks
            .get(block_index as usize)
            .ok_or_else(|| VmError::fatal("jit: jumped to a block index outside the compiled method"))?;
        let mut regs = bind_entry(frame, &block.entry_shape)?;

        for instr in &block.instrs {
            match run_instr(vm, thread_id, frame, &mut regs, instr)? {
                Some(step) => return Ok(outcome_from_escape(frame, step)?),
                None => {}
            }
        }

        match eval_terminator(vm, frame, &mut regs, &block.terminator)? {
            TermOutcome::Jump(next) => {
                push_exit_shape(frame, &regs, &block.exit_stack)?;
                block_index = next;
            }
            TermOutcome::Return(outcome) => return Ok(outcome),
            TermOutcome::Thrown(step) => return outcome_from_escape(frame, step),
        }
    }
}

/// Handles a `Step` returned by a help call that isn't `Continue`:
/// `Return` means the method is finished; `Thrown` is first offered
/// to the method's own exception table before escaping, exactly as
/// `run_frame` does for interpreted frames.
fn outcome_from_escape(frame: &mut Frame, step: Step) -> Result<FrameOutcome> {
    match step {
        Step::Continue => unreachable!("outcome_from_escape is only called for a non-Continue step"),
        Step::Return(value) => Ok(FrameOutcome::Returned(value)),
        Step::Thrown(obj) => Ok(FrameOutcome::Threw(obj)),
    }
}

fn bind_entry(frame: &mut Frame, entry_shape: &[SlotKind]) -> Result<Registers> {
    let mut regs = HashMap::new();
    for i in (0..entry_shape.len()).rev() {
        if entry_shape[i].is_wide() {
            frame.pop()?;
        }
        let value = frame.pop()?;
        regs.insert(i as u32, value);
    }
    Ok(regs)
}

fn push_exit_shape(frame: &mut Frame, regs: &Registers, exit_stack: &[(super::ir::ValueId, SlotKind)]) -> Result<()> {
    for &(id, kind) in exit_stack {
        let value = get(regs, id)?;
        frame.push(value);
        if kind.is_wide() {
            frame.push(Slot::Padding);
        }
    }
    Ok(())
}

enum TermOutcome {
    Jump(u32),
    Return(FrameOutcome),
    Thrown(Step),
}

fn eval_terminator(vm: &Vm, frame: &mut Frame, regs: &mut Registers, term: &Terminator) -> Result<TermOutcome> {
    match term {
        Terminator::Jump { target } => Ok(TermOutcome::Jump(*target)),
        Terminator::IfUnary { pred, value, if_true, if_false } => {
            let v = get(regs, *value)?.as_int().ok_or_else(|| VmError::fatal("jit: ifcond on a non-int value"))?;
            Ok(TermOutcome::Jump(branch(if eval_int_predicate(*pred, v, 0) { *if_true } else { *if_false }, *if_true, *if_false)))
        }
        Terminator::IfIntCompare { pred, lhs, rhs, if_true, if_false } => {
            let a = get(regs, *lhs)?.as_int().ok_or_else(|| VmError::fatal("jit: if_icmp on a non-int value"))?;
            let b = get(regs, *rhs)?.as_int().ok_or_else(|| VmError::fatal("jit: if_icmp on a non-int value"))?;
            Ok(TermOutcome::Jump(branch(if eval_int_predicate(*pred, a, b) { *if_true } else { *if_false }, *if_true, *if_false)))
        }
        Terminator::IfRefCompare { equal, lhs, rhs, if_true, if_false } => {
            let a = get(regs, *lhs)?;
            let b = get(regs, *rhs)?;
            let same = a.as_reference().ok_or_else(|| VmError::fatal("jit: if_acmp on a non-reference value"))?
                == b.as_reference().ok_or_else(|| VmError::fatal("jit: if_acmp on a non-reference value"))?;
            Ok(TermOutcome::Jump(branch(same == *equal, *if_true, *if_false)))
        }
        Terminator::IfNull { is_null, value, if_true, if_false } => {
            let v = get(regs, *value)?.as_reference().ok_or_else(|| VmError::fatal("jit: ifnull on a non-reference value"))?;
            Ok(TermOutcome::Jump(branch(v.is_none() == *is_null, *if_true, *if_false)))
        }
        Terminator::TableSwitch { selector, low, targets, default } => {
            let v = get(regs, *selector)?.as_int().ok_or_else(|| VmError::fatal("jit: tableswitch on a non-int value"))?;
            let idx = v - *low;
            let target = if idx >= 0 && (idx as usize) < targets.len() { targets[idx as usize] } else { *default };
            Ok(TermOutcome::Jump(target))
        }
        Terminator::LookupSwitch { selector, pairs, default } => {
            let v = get(regs, *selector)?.as_int().ok_or_else(|| VmError::fatal("jit: lookupswitch on a non-int value"))?;
            let target = pairs.iter().find(|(key, _)| *key == v).map(|(_, t)| *t).unwrap_or(*default);
            Ok(TermOutcome::Jump(target))
        }
        Terminator::Return { value } => {
            let slot = match value {
                Some(id) => Some(get(regs, *id)?),
                None => None,
            };
            Ok(TermOutcome::Return(FrameOutcome::Returned(slot)))
        }
        Terminator::Throw { value } => {
            let v = get(regs, *value)?;
            stage(frame, v);
            let step = interpreter::athrow(vm, frame)?;
            Ok(TermOutcome::Thrown(step))
        }
    }
}

fn branch(taken: bool, if_true: u32, if_false: u32) -> u32 {
    if taken { if_true } else { if_false }
}

fn eval_int_predicate(pred: IntPredicate, a: i32, b: i32) -> bool {
    match pred {
        IntPredicate::Eq => a == b,
        IntPredicate::Ne => a != b,
        IntPredicate::Lt => a < b,
        IntPredicate::Ge => a >= b,
        IntPredicate::Gt => a > b,
        IntPredicate::Le => a <= b,
    }
}

fn get(regs: &Registers, id: super::ir::ValueId) -> Result<Slot> {
    regs.get(&id.0).copied().ok_or_else(|| VmError::fatal("jit: value used before it was defined"))
}

fn stage(frame: &mut Frame, value: Slot) {
    frame.push(value);
    if value.kind().is_wide() {
        frame.push(Slot::Padding);
    }
}

/// Runs one instruction. Returns `Some(step)` only for a `Help` call
/// that escaped with `Return`/`Thrown`, short-circuiting the rest of
/// the block exactly like `step_one`'s own early returns do mid-
/// method.
fn run_instr(vm: &Vm, thread_id: u64, frame: &mut Frame, regs: &mut Registers, instr: &Instr) -> Result<Option<Step>> {
    match instr {
        Instr::Const { dst, value } => {
            regs.insert(dst.0, const_slot(*value));
            Ok(None)
        }
        Instr::GetLocal { dst, index, .. } => {
            regs.insert(dst.0, frame.local(*index as usize)?);
            Ok(None)
        }
        Instr::SetLocal { index, src } => {
            let v = get(regs, *src)?;
            frame.set_local(*index as usize, v)?;
            Ok(None)
        }
        Instr::Arithmetic { dst, opcode, operands } => {
            let baseline = frame.stack.len();
            for id in operands {
                stage(frame, get(regs, *id)?);
            }
            interpreter::arithmetic(frame, *opcode)?;
            if let Some((dst, kind)) = dst {
                if kind.is_wide() {
                    frame.pop()?;
                }
                let v = frame.pop()?;
                regs.insert(dst.0, v);
            }
            frame.stack.truncate(baseline);
            Ok(None)
        }
        Instr::Help { dsts, operands, call } => run_help(vm, thread_id, frame, regs, dsts, operands, call),
    }
}

fn const_slot(value: IrConst) -> Slot {
    match value {
        IrConst::Int(v) => Slot::Int(v),
        IrConst::Long(v) => Slot::Long(v),
        IrConst::Float(v) => Slot::Float(v),
        IrConst::Double(v) => Slot::Double(v),
        IrConst::Null => Slot::Reference(None),
    }
}

fn run_help(
    vm: &Vm,
    thread_id: u64,
    frame: &mut Frame,
    regs: &mut Registers,
    dsts: &[(super::ir::ValueId, SlotKind)],
    operands: &[super::ir::ValueId],
    call: &HelpCall,
) -> Result<Option<Step>> {
    let baseline = frame.stack.len();

    // Make every value this block still has live visible to a GC
    // root scan that might run inside the call below, not just this
    // instruction's own operands.
    let live: Vec<Slot> = regs.values().copied().collect();
    for slot in live {
        frame.push(slot);
    }
    for id in operands {
        stage(frame, get(regs, *id)?);
    }

    let step = super::help::call(vm, thread_id, frame, call)?;

    if !matches!(step, Step::Continue) {
        frame.stack.truncate(baseline);
        return Ok(Some(step));
    }

    for (id, kind) in dsts.iter().rev() {
        if kind.is_wide() {
            frame.pop()?;
        }
        let v = frame.pop()?;
        regs.insert(id.0, v);
    }
    frame.stack.truncate(baseline);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::MethodCfg;
    use crate::class::{Class, Field, InitLock, InstanceClass, Method};
    use crate::classpath::MemoryClassPath;
    use crate::config::VmConfig;
    use crate::interpreter::opcodes::*;
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

    fn class_with(method: Method) -> crate::class::ClassRef {
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

    fn instance_class(class: &crate::class::ClassRef) -> &InstanceClass {
        match class.as_ref() {
            Class::Instance(ic) => ic,
            _ => unreachable!(),
        }
    }

    fn method_ref(class: &crate::class::ClassRef) -> &Method {
        &instance_class(class).methods[0]
    }

    fn test_vm() -> Vm {
        let config = VmConfig::new("Main".to_string(), vec![], vec!["target/does-not-exist".to_string()]);
        Vm::new_with_class_path(config, Box::new(MemoryClassPath::new()))
    }

    fn compile(class: &crate::class::ClassRef, code: &[u8]) -> CompiledMethod {
        let cfg = MethodCfg::build(code).unwrap();
        let blocks = super::super::lower::lower_method(instance_class(class), code, &cfg).unwrap();
        CompiledMethod { blocks }
    }

    fn returned_int(outcome: FrameOutcome) -> i32 {
        match outcome {
            FrameOutcome::Returned(Some(Slot::Int(v))) => v,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn lowering_a_branching_method_produces_one_block_per_cfg_block() {
        // iconst_0 ; ifeq +5 ; iconst_0 ; ireturn ; iconst_1 ; ireturn
        let code = vec![ICONST_0, IFEQ, 0x00, 0x05, ICONST_0, IRETURN, ICONST_1, IRETURN];
        let class = class_with(method_with_code(code.clone()));
        let cfg = MethodCfg::build(&code).unwrap();
        let compiled = compile(&class, &code);
        assert_eq!(compiled.blocks.len(), cfg.blocks.len());
        assert!(compiled.blocks.len() >= 2);
    }

    #[test]
    fn run_compiled_matches_the_interpreter_for_straight_line_code() {
        let code = vec![ICONST_2, ICONST_3, IADD, IRETURN];
        let class = class_with(method_with_code(code.clone()));
        let compiled = compile(&class, &code);
        let vm = test_vm();

        let mut interpreted = Frame::new(class.clone(), 0, method_ref(&class));
        let interpreted_result = returned_int(interpreter::run_frame(&vm, 1, &mut interpreted).unwrap());

        let mut compiled_frame = Frame::new(class.clone(), 0, method_ref(&class));
        let compiled_result = returned_int(run_compiled(&compiled, &vm, 1, &mut compiled_frame).unwrap());

        assert_eq!(interpreted_result, 5);
        assert_eq!(compiled_result, interpreted_result);
    }

    #[test]
    fn run_compiled_takes_the_branch_to_the_right_block() {
        // iconst_0 ; ifeq +5 (taken, since the top is 0) ; iconst_0 ;
        // ireturn (dead) ; iconst_1 ; ireturn (branch target)
        let code = vec![ICONST_0, IFEQ, 0x00, 0x05, ICONST_0, IRETURN, ICONST_1, IRETURN];
        let class = class_with(method_with_code(code.clone()));
        let compiled = compile(&class, &code);
        let vm = test_vm();
        let mut frame = Frame::new(class.clone(), 0, method_ref(&class));
        let result = returned_int(run_compiled(&compiled, &vm, 1, &mut frame).unwrap());
        assert_eq!(result, 1);
    }

    #[test]
    fn a_wide_value_round_trips_through_a_local_with_its_padding_intact() {
        let code = vec![LCONST_1, LSTORE_0, LLOAD_0, LRETURN];
        let class = class_with(method_with_code(code.clone()));
        let compiled = compile(&class, &code);
        let vm = test_vm();
        let mut frame = Frame::new(class.clone(), 0, method_ref(&class));
        match run_compiled(&compiled, &vm, 1, &mut frame).unwrap() {
            FrameOutcome::Returned(Some(Slot::Long(v))) => assert_eq!(v, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn a_help_call_result_flows_back_into_the_symbolic_stack() {
        // newarray of 5 ints, then arraylength, matching the int
        // pushed in as the array's own size.
        let code = vec![ICONST_5, NEWARRAY, T_INT, ARRAYLENGTH, IRETURN];
        let class = class_with(method_with_code(code.clone()));
        let compiled = compile(&class, &code);
        let vm = test_vm();
        let mut frame = Frame::new(class.clone(), 0, method_ref(&class));
        let result = returned_int(run_compiled(&compiled, &vm, 1, &mut frame).unwrap());
        assert_eq!(result, 5);
    }
}
