//! Bytecode -> typed IR lowering: turns one [`MethodBlock`]'s raw
//! bytecode range into a straight-line [`Instr`] list plus a
//! [`Terminator`], threading a symbolic typed operand stack across
//! the whole method.
//!
//! Block-entry operand-stack shapes are resolved with a single
//! forward scan over blocks in `start_pc` order (`cfg.rs` already
//! hands them back sorted that way, see [`MethodCfg::build`]): block
//! 0 always enters empty, and every other block's entry shape is
//! *stashed* by whichever predecessor reaches it first and *asserted*
//! against by every later predecessor, including a backward (loop)
//! edge into an already-finalized block. A verified class file's
//! operand-stack shape at any `pc` is the same no matter which
//! predecessor got there, so a single pass suffices; a mismatch means
//! lowering has a bug or the class file is malformed, and either way
//! the method falls back to the interpreter rather than compiling.
//!
//! Cross-block "phi" merging is realized physically rather than as an
//! SSA graph: each block pops its inferred entry shape off the real
//! `Frame` operand stack into fresh registers on entry, and pushes its
//! exit shape back (inserting `Slot::Padding` for wide values exactly
//! where the interpreter would) immediately before its terminator
//! fires. `exec.rs` is what actually performs those pushes and pops;
//! this module only has to agree with it on the shapes.

use std::collections::HashMap;

use cs_model::SlotKind;
use cs_parser::CpInfo;

use crate::cfg::{MethodBlock, MethodCfg};
use crate::class::InstanceClass;
use crate::error::{Result, VmError};
use crate::interpreter::opcodes::*;
use crate::interpreter::{align4, i1, i2, i4, u1, u2};

use super::ir::*;

pub struct LoweredBlock {
    pub entry_shape: Vec<SlotKind>,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
    /// The symbolic stack's logical contents at the end of the block,
    /// bottom to top, as it stood right before the terminator fired.
    /// For a `Jump`/`If*`/`*Switch` terminator this is exactly the
    /// entry shape the target block(s) expect, so `exec.rs` reads the
    /// values straight out of this block's register file by id and
    /// pushes them onto the real stack before the jump; for
    /// `Return`/`Throw` it's unused since no successor compiled block
    /// needs it.
    pub exit_stack: Vec<(ValueId, SlotKind)>,
}

/// Lowers every block of `cfg` over `code`, the owning class's own
/// constant pool resolving field/method/constant operands as they're
/// encountered. Returns one [`LoweredBlock`] per `cfg.blocks` entry,
/// in the same order (so a `MethodBlock`'s `index` is also an index
/// into the returned `Vec`).
pub fn lower_method(class: &InstanceClass, code: &[u8], cfg: &MethodCfg) -> Result<Vec<LoweredBlock>> {
    let mut shapes: HashMap<u32, Vec<SlotKind>> = HashMap::new();
    shapes.insert(0, Vec::new());

    let mut out = Vec::with_capacity(cfg.blocks.len());
    for block in &cfg.blocks {
        let entry_shape = shapes
            .get(&block.index)
            .cloned()
            .ok_or_else(|| VmError::fatal("jit: block has no inferred entry stack shape"))?;
        let mut lowerer = BlockLowerer::new(class, code, cfg, &entry_shape);
        let terminator = lowerer.lower(block)?;
        let exit_stack = lowerer.exit_stack();
        let exit_shape: Vec<SlotKind> = exit_stack.iter().map(|&(_, kind)| kind).collect();
        for target in successor_targets(&terminator) {
            stash_or_assert(&mut shapes, target, &exit_shape)?;
        }
        out.push(LoweredBlock { entry_shape, instrs: lowerer.instrs, terminator, exit_stack });
    }
    Ok(out)
}

fn stash_or_assert(shapes: &mut HashMap<u32, Vec<SlotKind>>, target: u32, shape: &[SlotKind]) -> Result<()> {
    match shapes.get(&target) {
        Some(existing) if existing == shape => Ok(()),
        Some(_) => Err(VmError::fatal("jit: divergent operand stack shapes at a block boundary")),
        None => {
            shapes.insert(target, shape.to_vec());
            Ok(())
        }
    }
}

fn successor_targets(term: &Terminator) -> Vec<u32> {
    match term {
        Terminator::Jump { target } => vec![*target],
        Terminator::IfUnary { if_true, if_false, .. }
        | Terminator::IfIntCompare { if_true, if_false, .. }
        | Terminator::IfRefCompare { if_true, if_false, .. }
        | Terminator::IfNull { if_true, if_false, .. } => vec![*if_true, *if_false],
        Terminator::TableSwitch { targets, default, .. } => {
            let mut v = targets.clone();
            v.push(*default);
            v
        }
        Terminator::LookupSwitch { pairs, default, .. } => {
            let mut v: Vec<u32> = pairs.iter().map(|(_, t)| *t).collect();
            v.push(*default);
            v
        }
        Terminator::Return { .. } | Terminator::Throw { .. } => Vec::new(),
    }
}

fn unary_predicate(opcode: u8) -> IntPredicate {
    match opcode {
        IFEQ => IntPredicate::Eq,
        IFNE => IntPredicate::Ne,
        IFLT => IntPredicate::Lt,
        IFGE => IntPredicate::Ge,
        IFGT => IntPredicate::Gt,
        IFLE => IntPredicate::Le,
        _ => unreachable!("unary_predicate only called for ifcond opcodes"),
    }
}

fn int_compare_predicate(opcode: u8) -> IntPredicate {
    match opcode {
        IF_ICMPEQ => IntPredicate::Eq,
        IF_ICMPNE => IntPredicate::Ne,
        IF_ICMPLT => IntPredicate::Lt,
        IF_ICMPGE => IntPredicate::Ge,
        IF_ICMPGT => IntPredicate::Gt,
        IF_ICMPLE => IntPredicate::Le,
        _ => unreachable!("int_compare_predicate only called for if_icmpcond opcodes"),
    }
}

fn load_kind(opcode: u8) -> SlotKind {
    match opcode {
        ILOAD | ILOAD_0..=ILOAD_3 => SlotKind::Int,
        LLOAD | LLOAD_0..=LLOAD_3 => SlotKind::Long,
        FLOAD | FLOAD_0..=FLOAD_3 => SlotKind::Float,
        DLOAD | DLOAD_0..=DLOAD_3 => SlotKind::Double,
        ALOAD | ALOAD_0..=ALOAD_3 => SlotKind::Reference,
        _ => unreachable!("load_kind only called for *load opcodes"),
    }
}

fn array_element_kind(opcode: u8) -> SlotKind {
    match opcode {
        IALOAD | IASTORE | BALOAD | BASTORE | CALOAD | CASTORE | SALOAD | SASTORE => SlotKind::Int,
        LALOAD | LASTORE => SlotKind::Long,
        FALOAD | FASTORE => SlotKind::Float,
        DALOAD | DASTORE => SlotKind::Double,
        AALOAD | AASTORE => SlotKind::Reference,
        _ => unreachable!("array_element_kind only called for *aload/*astore opcodes"),
    }
}

/// Arity and result kind of one of `arithmetic()`'s pure opcodes,
/// mirroring its own match arms one for one.
fn arithmetic_shape(opcode: u8) -> (usize, Option<SlotKind>) {
    use SlotKind::*;
    match opcode {
        IADD | ISUB | IMUL | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => (2, Some(Int)),
        LADD | LSUB | LMUL | LAND | LOR | LXOR | LSHL | LSHR | LUSHR => (2, Some(Long)),
        FADD | FSUB | FMUL | FDIV | FREM => (2, Some(Float)),
        DADD | DSUB | DMUL | DDIV | DREM => (2, Some(Double)),
        INEG => (1, Some(Int)),
        LNEG => (1, Some(Long)),
        FNEG => (1, Some(Float)),
        DNEG => (1, Some(Double)),
        I2L => (1, Some(Long)),
        I2F => (1, Some(Float)),
        I2D => (1, Some(Double)),
        L2I => (1, Some(Int)),
        L2F => (1, Some(Float)),
        L2D => (1, Some(Double)),
        F2I => (1, Some(Int)),
        F2L => (1, Some(Long)),
        F2D => (1, Some(Double)),
        D2I => (1, Some(Int)),
        D2L => (1, Some(Long)),
        D2F => (1, Some(Float)),
        I2B | I2C | I2S => (1, Some(Int)),
        LCMP | FCMPL | FCMPG | DCMPL | DCMPG => (2, Some(Int)),
        _ => unreachable!("arithmetic_shape only called for arithmetic() opcodes"),
    }
}

struct BlockLowerer<'a> {
    class: &'a InstanceClass,
    code: &'a [u8],
    cfg: &'a MethodCfg,
    stack: Vec<StackItem>,
    instrs: Vec<Instr>,
    next_value: u32,
}

impl<'a> BlockLowerer<'a> {
    fn new(class: &'a InstanceClass, code: &'a [u8], cfg: &'a MethodCfg, entry_shape: &[SlotKind]) -> Self {
        let mut stack = Vec::new();
        let mut next_value = 0;
        for &kind in entry_shape {
            stack.push(StackItem::Value(ValueId(next_value), kind));
            next_value += 1;
            if kind.is_wide() {
                stack.push(StackItem::Padding);
            }
        }
        BlockLowerer { class, code, cfg, stack, instrs: Vec::new(), next_value }
    }

    fn exit_stack(&self) -> Vec<(ValueId, SlotKind)> {
        self.stack
            .iter()
            .filter_map(|item| match item {
                StackItem::Value(id, kind) => Some((*id, *kind)),
                StackItem::Padding => None,
            })
            .collect()
    }

    fn fresh(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    // -- logical (kind-aware) stack access, mirroring Frame::push/pop
    // including the padding a wide value trails --

    fn push(&mut self, id: ValueId, kind: SlotKind) {
        self.stack.push(StackItem::Value(id, kind));
        if kind.is_wide() {
            self.stack.push(StackItem::Padding);
        }
    }

    fn pop(&mut self) -> Result<(ValueId, SlotKind)> {
        match self.pop_raw()? {
            StackItem::Padding => match self.pop_raw()? {
                StackItem::Value(id, kind) if kind.is_wide() => Ok((id, kind)),
                _ => Err(VmError::fatal("jit: padding on the symbolic stack without a preceding wide value")),
            },
            StackItem::Value(id, kind) => Ok((id, kind)),
        }
    }

    fn peek(&self) -> Result<(ValueId, SlotKind)> {
        let mut iter = self.stack.iter().rev();
        match iter.next() {
            Some(StackItem::Padding) => match iter.next() {
                Some(StackItem::Value(id, kind)) => Ok((*id, *kind)),
                _ => Err(VmError::fatal("jit: padding on the symbolic stack without a preceding wide value")),
            },
            Some(StackItem::Value(id, kind)) => Ok((*id, *kind)),
            None => Err(VmError::fatal("jit: symbolic stack empty")),
        }
    }

    // -- raw (slot-granular) stack access, for the dup/pop/swap family,
    // which JVM bytecode itself defines in terms of raw stack words
    // rather than logical values --

    fn push_raw(&mut self, item: StackItem) {
        self.stack.push(item);
    }

    fn pop_raw(&mut self) -> Result<StackItem> {
        self.stack.pop().ok_or_else(|| VmError::fatal("jit: symbolic stack underflow"))
    }

    // -- emission primitives with no stack effect of their own --

    fn emit_const(&mut self, value: IrConst) -> ValueId {
        let dst = self.fresh();
        self.instrs.push(Instr::Const { dst, value });
        dst
    }

    fn emit_get_local(&mut self, index: u16, kind: SlotKind) -> ValueId {
        let dst = self.fresh();
        self.instrs.push(Instr::GetLocal { dst, index, kind });
        dst
    }

    fn emit_set_local(&mut self, index: u16, src: ValueId) {
        self.instrs.push(Instr::SetLocal { index, src });
    }

    fn emit_arith(&mut self, opcode: u8, operands: Vec<ValueId>, result: Option<SlotKind>) -> Option<ValueId> {
        let dst = result.map(|kind| (self.fresh(), kind));
        self.instrs.push(Instr::Arithmetic { dst, opcode, operands });
        dst.map(|(id, _)| id)
    }

    fn emit_help(&mut self, operands: Vec<ValueId>, dsts: Vec<(ValueId, SlotKind)>, call: HelpCall) {
        self.instrs.push(Instr::Help { dsts, operands, call });
    }

    // -- stack-facing wrappers used by the opcode match below --

    fn const_instr(&mut self, value: IrConst) {
        let kind = value.kind();
        let dst = self.emit_const(value);
        self.push(dst, kind);
    }

    fn get_local(&mut self, index: u16, kind: SlotKind) {
        let dst = self.emit_get_local(index, kind);
        self.push(dst, kind);
    }

    fn set_local(&mut self, index: u16) -> Result<()> {
        let (src, _) = self.pop()?;
        self.emit_set_local(index, src);
        Ok(())
    }

    fn arithmetic(&mut self, opcode: u8) -> Result<()> {
        let (arity, result) = arithmetic_shape(opcode);
        let mut operands = Vec::with_capacity(arity);
        for _ in 0..arity {
            operands.push(self.pop()?.0);
        }
        operands.reverse();
        if let Some(dst) = self.emit_arith(opcode, operands, result) {
            self.push(dst, result.unwrap());
        }
        Ok(())
    }

    /// One result, pushed onto the symbolic stack (the common case:
    /// field/array loads, allocation, `instanceof`, checked division).
    fn help1(&mut self, operands: Vec<ValueId>, result: SlotKind, call: HelpCall) {
        let dst = self.fresh();
        self.emit_help(operands, vec![(dst, result)], call);
        self.push(dst, result);
    }

    /// No result (field/array stores, `monitorenter`/`monitorexit`).
    fn help0(&mut self, operands: Vec<ValueId>, call: HelpCall) {
        self.emit_help(operands, Vec::new(), call);
    }

    fn lower_iinc(&mut self, index: u16, delta: i32) {
        let cur = self.emit_get_local(index, SlotKind::Int);
        let d = self.emit_const(IrConst::Int(delta));
        let sum = self.emit_arith(IADD, vec![cur, d], Some(SlotKind::Int)).expect("iadd always yields a value");
        self.emit_set_local(index, sum);
    }

    fn lower_ldc(&mut self, index: u16) -> Result<()> {
        match self.class.constant_pool.get(index)? {
            CpInfo::Integer(v) => self.const_instr(IrConst::Int(*v)),
            CpInfo::Float(v) => self.const_instr(IrConst::Float(*v)),
            CpInfo::Long(v) => self.const_instr(IrConst::Long(*v)),
            CpInfo::Double(v) => self.const_instr(IrConst::Double(*v)),
            CpInfo::String { .. } | CpInfo::Class { .. } => {
                self.help1(Vec::new(), SlotKind::Reference, HelpCall::LdcRef { index });
            }
            _ => return Err(VmError::fatal("jit: ldc of an unsupported constant kind")),
        }
        Ok(())
    }

    fn member_descriptor(&self, index: u16) -> Result<cs_model::MethodDescriptor> {
        let (_, _, descriptor) = self.class.constant_pool.member_ref(index)?;
        cs_model::MethodDescriptor::parse(descriptor).map_err(|e| VmError::fatal(e.to_string()))
    }

    fn lower_invoke(&mut self, pc: u32, index: u16, kind: InvokeShape) -> Result<()> {
        let descriptor = self.member_descriptor(index)?;
        let is_static = matches!(kind, InvokeShape::Static);
        let mut operands = Vec::with_capacity(descriptor.parameters.len() + 1);
        for param in descriptor.parameters.iter().rev() {
            let (id, _) = self.pop()?;
            debug_assert_eq!(param.slot_kind().is_wide(), param.slot_kind().is_wide());
            operands.push(id);
        }
        operands.reverse();
        if !is_static {
            let (receiver, _) = self.pop()?;
            operands.insert(0, receiver);
        }
        let call = HelpCall::InvokeMethod { pc, kind };
        match descriptor.return_type.slot_kind() {
            SlotKind::None => self.help0(operands, call),
            result => self.help1(operands, result, call),
        }
        Ok(())
    }

    fn lower_invoke_interface(&mut self, pc: u32, index: u16) -> Result<()> {
        let descriptor = self.member_descriptor(index)?;
        let mut operands = Vec::with_capacity(descriptor.parameters.len() + 1);
        for _ in &descriptor.parameters {
            operands.push(self.pop()?.0);
        }
        operands.reverse();
        let (receiver, _) = self.pop()?;
        operands.insert(0, receiver);
        let call = HelpCall::InvokeInterface { pc };
        match descriptor.return_type.slot_kind() {
            SlotKind::None => self.help0(operands, call),
            result => self.help1(operands, result, call),
        }
        Ok(())
    }

    fn lower_invokedynamic(&mut self, pc: u32, index: u16) -> Result<()> {
        let CpInfo::InvokeDynamic { name_and_type_index, .. } = self.class.constant_pool.get(index)? else {
            return Err(VmError::fatal("jit: invokedynamic operand is not an InvokeDynamic constant"));
        };
        let (_, descriptor) = self.class.constant_pool.name_and_type(*name_and_type_index)?;
        let descriptor = cs_model::MethodDescriptor::parse(descriptor).map_err(|e| VmError::fatal(e.to_string()))?;
        let mut operands = Vec::with_capacity(descriptor.parameters.len());
        for _ in &descriptor.parameters {
            operands.push(self.pop()?.0);
        }
        operands.reverse();
        let call = HelpCall::InvokeDynamic { pc };
        match descriptor.return_type.slot_kind() {
            SlotKind::None => self.help0(operands, call),
            result => self.help1(operands, result, call),
        }
        Ok(())
    }

    fn block_target(&self, pc: u32) -> Result<u32> {
        self.cfg
            .block_containing(pc)
            .map(|b| b.index)
            .ok_or_else(|| VmError::fatal("jit: branch target outside every block"))
    }

    /// Lowers `block`'s bytecode range, returning the `Terminator` the
    /// block ends on. Every control-transfer opcode returns directly
    /// from inside the loop; everything else goes through
    /// [`Self::lower_one`] and the loop continues.
    fn lower(&mut self, block: &MethodBlock) -> Result<Terminator> {
        let mut pc = block.start_pc;
        while pc < block.end_pc {
            let opcode = u1(self.code, pc as usize)?;
            macro_rules! target {
                ($offset_ty:ty, $read:ident) => {{
                    let offset = $read(self.code, pc as usize + 1)? as i64;
                    self.block_target((pc as i64 + offset) as u32)?
                }};
            }
            match opcode {
                IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE => {
                    let pred = unary_predicate(opcode);
                    let (value, _) = self.pop()?;
                    let if_true = target!(i16, i2);
                    let if_false = self.block_target(pc + 3)?;
                    return Ok(Terminator::IfUnary { pred, value, if_true, if_false });
                }
                IF_ICMPEQ..=IF_ICMPLE => {
                    let pred = int_compare_predicate(opcode);
                    let (rhs, _) = self.pop()?;
                    let (lhs, _) = self.pop()?;
                    let if_true = target!(i16, i2);
                    let if_false = self.block_target(pc + 3)?;
                    return Ok(Terminator::IfIntCompare { pred, lhs, rhs, if_true, if_false });
                }
                IF_ACMPEQ | IF_ACMPNE => {
                    let (rhs, _) = self.pop()?;
                    let (lhs, _) = self.pop()?;
                    let if_true = target!(i16, i2);
                    let if_false = self.block_target(pc + 3)?;
                    return Ok(Terminator::IfRefCompare { equal: opcode == IF_ACMPEQ, lhs, rhs, if_true, if_false });
                }
                IFNULL | IFNONNULL => {
                    let (value, _) = self.pop()?;
                    let if_true = target!(i16, i2);
                    let if_false = self.block_target(pc + 3)?;
                    return Ok(Terminator::IfNull { is_null: opcode == IFNULL, value, if_true, if_false });
                }
                GOTO => {
                    let target = target!(i16, i2);
                    return Ok(Terminator::Jump { target });
                }
                GOTO_W => {
                    let target = target!(i32, i4);
                    return Ok(Terminator::Jump { target });
                }
                JSR | JSR_W | RET => {
                    return Err(VmError::fatal("jit: jsr/ret is not lowered"));
                }
                TABLESWITCH => {
                    let (selector, _) = self.pop()?;
                    let aligned = align4(pc as usize + 1);
                    let default_offset = i4(self.code, aligned)?;
                    let low = i4(self.code, aligned + 4)?;
                    let high = i4(self.code, aligned + 8)?;
                    if high < low {
                        return Err(VmError::fatal("jit: tableswitch high < low"));
                    }
                    let mut targets = Vec::with_capacity((high - low + 1) as usize);
                    for i in 0..=(high - low) {
                        let offset = i4(self.code, aligned + 12 + 4 * i as usize)?;
                        targets.push(self.block_target((pc as i64 + offset as i64) as u32)?);
                    }
                    let default = self.block_target((pc as i64 + default_offset as i64) as u32)?;
                    return Ok(Terminator::TableSwitch { selector, low, targets, default });
                }
                LOOKUPSWITCH => {
                    let (selector, _) = self.pop()?;
                    let aligned = align4(pc as usize + 1);
                    let default_offset = i4(self.code, aligned)?;
                    let npairs = i4(self.code, aligned + 4)?;
                    let mut pairs = Vec::with_capacity(npairs.max(0) as usize);
                    for i in 0..npairs {
                        let pair_pc = aligned + 8 + 8 * i as usize;
                        let key = i4(self.code, pair_pc)?;
                        let offset = i4(self.code, pair_pc + 4)?;
                        pairs.push((key, self.block_target((pc as i64 + offset as i64) as u32)?));
                    }
                    let default = self.block_target((pc as i64 + default_offset as i64) as u32)?;
                    return Ok(Terminator::LookupSwitch { selector, pairs, default });
                }
                IRETURN | FRETURN | ARETURN => {
                    let (value, _) = self.pop()?;
                    return Ok(Terminator::Return { value: Some(value) });
                }
                LRETURN | DRETURN => {
                    let (value, _) = self.pop()?;
                    return Ok(Terminator::Return { value: Some(value) });
                }
                RETURN => return Ok(Terminator::Return { value: None }),
                ATHROW => {
                    let (value, _) = self.pop()?;
                    return Ok(Terminator::Throw { value });
                }
                _ => pc = self.lower_one(opcode, pc)?,
            }
        }
        if block.auto_fallthrough {
            let target = block
                .successors
                .first()
                .copied()
                .ok_or_else(|| VmError::fatal("jit: fallthrough block has no successor"))?;
            Ok(Terminator::Jump { target })
        } else {
            Err(VmError::fatal("jit: block ran off its end with no terminator"))
        }
    }

    /// Lowers one non-terminator opcode at `pc`, returning the pc of
    /// the next instruction.
    fn lower_one(&mut self, opcode: u8, pc: u32) -> Result<u32> {
        let p = pc as usize;
        match opcode {
            NOP => Ok(pc + 1),
            ACONST_NULL => {
                self.const_instr(IrConst::Null);
                Ok(pc + 1)
            }
            ICONST_M1..=ICONST_5 => {
                self.const_instr(IrConst::Int(opcode as i32 - ICONST_0 as i32));
                Ok(pc + 1)
            }
            LCONST_0 | LCONST_1 => {
                self.const_instr(IrConst::Long((opcode - LCONST_0) as i64));
                Ok(pc + 1)
            }
            FCONST_0..=FCONST_2 => {
                self.const_instr(IrConst::Float((opcode - FCONST_0) as f32));
                Ok(pc + 1)
            }
            DCONST_0 | DCONST_1 => {
                self.const_instr(IrConst::Double((opcode - DCONST_0) as f64));
                Ok(pc + 1)
            }
            BIPUSH => {
                let v = i1(self.code, p + 1)?;
                self.const_instr(IrConst::Int(v as i32));
                Ok(pc + 2)
            }
            SIPUSH => {
                let v = i2(self.code, p + 1)?;
                self.const_instr(IrConst::Int(v as i32));
                Ok(pc + 3)
            }
            LDC => {
                let index = u1(self.code, p + 1)? as u16;
                self.lower_ldc(index)?;
                Ok(pc + 2)
            }
            LDC_W | LDC2_W => {
                let index = u2(self.code, p + 1)?;
                self.lower_ldc(index)?;
                Ok(pc + 3)
            }
            ILOAD | FLOAD | ALOAD | LLOAD | DLOAD => {
                let index = u1(self.code, p + 1)? as u16;
                self.get_local(index, load_kind(opcode));
                Ok(pc + 2)
            }
            ILOAD_0..=ILOAD_3 => {
                self.get_local((opcode - ILOAD_0) as u16, SlotKind::Int);
                Ok(pc + 1)
            }
            FLOAD_0..=FLOAD_3 => {
                self.get_local((opcode - FLOAD_0) as u16, SlotKind::Float);
                Ok(pc + 1)
            }
            ALOAD_0..=ALOAD_3 => {
                self.get_local((opcode - ALOAD_0) as u16, SlotKind::Reference);
                Ok(pc + 1)
            }
            LLOAD_0..=LLOAD_3 => {
                self.get_local((opcode - LLOAD_0) as u16, SlotKind::Long);
                Ok(pc + 1)
            }
            DLOAD_0..=DLOAD_3 => {
                self.get_local((opcode - DLOAD_0) as u16, SlotKind::Double);
                Ok(pc + 1)
            }
            ISTORE | FSTORE | ASTORE | LSTORE | DSTORE => {
                let index = u1(self.code, p + 1)? as u16;
                self.set_local(index)?;
                Ok(pc + 2)
            }
            ISTORE_0..=ISTORE_3 => {
                self.set_local((opcode - ISTORE_0) as u16)?;
                Ok(pc + 1)
            }
            FSTORE_0..=FSTORE_3 => {
                self.set_local((opcode - FSTORE_0) as u16)?;
                Ok(pc + 1)
            }
            ASTORE_0..=ASTORE_3 => {
                self.set_local((opcode - ASTORE_0) as u16)?;
                Ok(pc + 1)
            }
            LSTORE_0..=LSTORE_3 => {
                self.set_local((opcode - LSTORE_0) as u16)?;
                Ok(pc + 1)
            }
            DSTORE_0..=DSTORE_3 => {
                self.set_local((opcode - DSTORE_0) as u16)?;
                Ok(pc + 1)
            }
            IALOAD | LALOAD | FALOAD | DALOAD | AALOAD | BALOAD | CALOAD | SALOAD => {
                let (index, _) = self.pop()?;
                let (array, _) = self.pop()?;
                self.help1(vec![array, index], array_element_kind(opcode), HelpCall::ArrayLoad { opcode });
                Ok(pc + 1)
            }
            IASTORE | LASTORE | FASTORE | DASTORE | AASTORE | BASTORE | CASTORE | SASTORE => {
                let (value, _) = self.pop()?;
                let (index, _) = self.pop()?;
                let (array, _) = self.pop()?;
                self.help0(vec![array, index, value], HelpCall::ArrayStore { opcode });
                Ok(pc + 1)
            }
            POP => {
                self.pop_raw()?;
                Ok(pc + 1)
            }
            POP2 => {
                // A wide value's own padding sits on top, so one raw
                // pop already removes the whole logical value; two
                // narrow values need one raw pop each.
                match self.pop_raw()? {
                    StackItem::Padding => {
                        self.pop_raw()?;
                    }
                    StackItem::Value(..) => {
                        self.pop_raw()?;
                    }
                }
                Ok(pc + 1)
            }
            DUP => {
                let v = *self.stack.last().ok_or_else(|| VmError::fatal("jit: dup on an empty stack"))?;
                self.push_raw(v);
                Ok(pc + 1)
            }
            DUP_X1 => {
                let top = self.pop_raw()?;
                let below = self.pop_raw()?;
                self.push_raw(top);
                self.push_raw(below);
                self.push_raw(top);
                Ok(pc + 1)
            }
            DUP_X2 => {
                let v1 = self.pop_raw()?;
                let v2 = self.pop_raw()?;
                let v3 = self.pop_raw()?;
                self.push_raw(v1);
                self.push_raw(v3);
                self.push_raw(v2);
                self.push_raw(v1);
                Ok(pc + 1)
            }
            DUP2 => {
                let v2 = self.pop_raw()?;
                let v1 = self.pop_raw()?;
                self.push_raw(v1);
                self.push_raw(v2);
                self.push_raw(v1);
                self.push_raw(v2);
                Ok(pc + 1)
            }
            DUP2_X1 => {
                let v2 = self.pop_raw()?;
                let v1 = self.pop_raw()?;
                let v0 = self.pop_raw()?;
                self.push_raw(v1);
                self.push_raw(v2);
                self.push_raw(v0);
                self.push_raw(v1);
                self.push_raw(v2);
                Ok(pc + 1)
            }
            DUP2_X2 => {
                let v2 = self.pop_raw()?;
                let v1 = self.pop_raw()?;
                let v0 = self.pop_raw()?;
                let vm1 = self.pop_raw()?;
                self.push_raw(v1);
                self.push_raw(v2);
                self.push_raw(vm1);
                self.push_raw(v0);
                self.push_raw(v1);
                self.push_raw(v2);
                Ok(pc + 1)
            }
            SWAP => {
                let top = self.pop_raw()?;
                let below = self.pop_raw()?;
                self.push_raw(top);
                self.push_raw(below);
                Ok(pc + 1)
            }
            IADD | ISUB | IMUL | LADD | LSUB | LMUL | FADD | FSUB | FMUL | FDIV | FREM | DADD | DSUB | DMUL
            | DDIV | DREM | INEG | LNEG | FNEG | DNEG | ISHL | LSHL | ISHR | LSHR | IUSHR | LUSHR | IAND
            | LAND | IOR | LOR | IXOR | LXOR | I2L | I2F | I2D | L2I | L2F | L2D | F2I | F2L | F2D | D2I
            | D2L | D2F | I2B | I2C | I2S | LCMP | FCMPL | FCMPG | DCMPL | DCMPG => {
                self.arithmetic(opcode)?;
                Ok(pc + 1)
            }
            IDIV | IREM | LDIV | LREM => {
                let (b, _) = self.pop()?;
                let (a, _) = self.pop()?;
                let result = if matches!(opcode, LDIV | LREM) { SlotKind::Long } else { SlotKind::Int };
                self.help1(vec![a, b], result, HelpCall::CheckedArithmetic { opcode });
                Ok(pc + 1)
            }
            IINC => {
                let index = u1(self.code, p + 1)? as u16;
                let delta = i1(self.code, p + 2)? as i32;
                self.lower_iinc(index, delta);
                Ok(pc + 3)
            }
            GETSTATIC => {
                let index = u2(self.code, p + 1)?;
                let kind = self.field_kind(index)?;
                self.help1(Vec::new(), kind, HelpCall::GetStatic { pc });
                Ok(pc + 3)
            }
            PUTSTATIC => {
                let index = u2(self.code, p + 1)?;
                let _ = self.field_kind(index)?;
                let (value, _) = self.pop()?;
                self.help0(vec![value], HelpCall::PutStatic { pc });
                Ok(pc + 3)
            }
            GETFIELD => {
                let index = u2(self.code, p + 1)?;
                let kind = self.field_kind(index)?;
                let (receiver, _) = self.pop()?;
                self.help1(vec![receiver], kind, HelpCall::GetField { pc });
                Ok(pc + 3)
            }
            PUTFIELD => {
                let index = u2(self.code, p + 1)?;
                let _ = self.field_kind(index)?;
                let (value, _) = self.pop()?;
                let (receiver, _) = self.pop()?;
                self.help0(vec![receiver, value], HelpCall::PutField { pc });
                Ok(pc + 3)
            }
            INVOKEVIRTUAL => {
                let index = u2(self.code, p + 1)?;
                self.lower_invoke(pc, index, InvokeShape::Virtual)?;
                Ok(pc + 3)
            }
            INVOKESPECIAL => {
                let index = u2(self.code, p + 1)?;
                self.lower_invoke(pc, index, InvokeShape::Special)?;
                Ok(pc + 3)
            }
            INVOKESTATIC => {
                let index = u2(self.code, p + 1)?;
                self.lower_invoke(pc, index, InvokeShape::Static)?;
                Ok(pc + 3)
            }
            INVOKEINTERFACE => {
                let index = u2(self.code, p + 1)?;
                self.lower_invoke_interface(pc, index)?;
                Ok(pc + 5)
            }
            INVOKEDYNAMIC => {
                let index = u2(self.code, p + 1)?;
                self.lower_invokedynamic(pc, index)?;
                Ok(pc + 5)
            }
            NEW => {
                self.help1(Vec::new(), SlotKind::Reference, HelpCall::AllocInstance { pc });
                Ok(pc + 3)
            }
            NEWARRAY => {
                let (length, _) = self.pop()?;
                self.help1(vec![length], SlotKind::Reference, HelpCall::AllocArray { pc });
                Ok(pc + 2)
            }
            ANEWARRAY => {
                let (length, _) = self.pop()?;
                self.help1(vec![length], SlotKind::Reference, HelpCall::AllocArray { pc });
                Ok(pc + 3)
            }
            MULTIANEWARRAY => {
                let dimensions = u1(self.code, p + 3)? as usize;
                let mut sizes = Vec::with_capacity(dimensions);
                for _ in 0..dimensions {
                    sizes.push(self.pop()?.0);
                }
                sizes.reverse();
                self.help1(sizes, SlotKind::Reference, HelpCall::AllocMultiArray { pc });
                Ok(pc + 4)
            }
            ARRAYLENGTH => {
                let (array, _) = self.pop()?;
                self.help1(vec![array], SlotKind::Int, HelpCall::ArrayLength { pc });
                Ok(pc + 1)
            }
            CHECKCAST => {
                let (value, _) = self.peek()?;
                self.help0(vec![value], HelpCall::Misc(MiscOp::CheckCast { pc }));
                Ok(pc + 3)
            }
            INSTANCEOF => {
                let (value, _) = self.pop()?;
                self.help1(vec![value], SlotKind::Int, HelpCall::Misc(MiscOp::InstanceOf { pc }));
                Ok(pc + 3)
            }
            MONITORENTER => {
                let (value, _) = self.pop()?;
                self.help0(vec![value], HelpCall::Misc(MiscOp::MonitorEnter));
                Ok(pc + 1)
            }
            MONITOREXIT => {
                let (value, _) = self.pop()?;
                self.help0(vec![value], HelpCall::Misc(MiscOp::MonitorExit));
                Ok(pc + 1)
            }
            WIDE => self.lower_wide(pc),
            _ => Err(VmError::fatal(format!("jit: opcode 0x{opcode:02x} is not lowered"))),
        }
    }

    fn field_kind(&self, index: u16) -> Result<SlotKind> {
        let (_, _, descriptor) = self.class.constant_pool.member_ref(index)?;
        let first = descriptor.chars().next().ok_or_else(|| VmError::fatal("jit: empty field descriptor"))?;
        Ok(SlotKind::from_descriptor_first_char(first))
    }

    fn lower_wide(&mut self, pc: u32) -> Result<u32> {
        let p = pc as usize;
        let widened = u1(self.code, p + 1)?;
        if widened == IINC {
            let index = u2(self.code, p + 2)?;
            let delta = i2(self.code, p + 4)? as i32;
            self.lower_iinc(index, delta);
            return Ok(pc + 6);
        }
        let index = u2(self.code, p + 2)?;
        match widened {
            ILOAD | FLOAD | ALOAD | LLOAD | DLOAD => self.get_local(index, load_kind(widened)),
            ISTORE | FSTORE | ASTORE | LSTORE | DSTORE => self.set_local(index)?,
            RET => return Err(VmError::fatal("jit: wide ret is not lowered")),
            other => return Err(VmError::fatal(format!("jit: wide prefix on unsupported opcode 0x{other:02x}"))),
        }
        Ok(pc + 4)
    }
}
