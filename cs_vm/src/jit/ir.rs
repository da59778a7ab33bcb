//! The typed IR vocabulary `lower.rs` emits and `exec.rs` runs.
//!
//! A value is a [`ValueId`] scoped to a single compiled block; its
//! type is always one of [`SlotKind`]'s five real kinds (`Int`,
//! `Long`, `Float`, `Double`, `Reference` — i32/i64/f32/f64/ptr).
//! There is no block-spanning SSA graph: cross-block "phi" merging is
//! realized physically, by popping the block's statically-inferred
//! entry shape off the real operand stack and pushing the exit shape
//! back before a terminator fires (see `lower.rs`'s module doc).

use cs_model::SlotKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

/// A logical item on the symbolic operand stack used while lowering
/// one block: either a typed value, or the inert padding slot that
/// trails a wide (`Long`/`Double`) value on the real frame stack.
/// Lowering inserts and removes these exactly where the interpreter's
/// `Slot::Padding` pushes/pops would.
#[derive(Debug, Clone, Copy)]
pub enum StackItem {
    Value(ValueId, SlotKind),
    Padding,
}

#[derive(Debug, Clone, Copy)]
pub enum IrConst {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
}

impl IrConst {
    pub fn kind(self) -> SlotKind {
        match self {
            IrConst::Int(_) => SlotKind::Int,
            IrConst::Long(_) => SlotKind::Long,
            IrConst::Float(_) => SlotKind::Float,
            IrConst::Double(_) => SlotKind::Double,
            IrConst::Null => SlotKind::Reference,
        }
    }
}

/// One instruction in a lowered block. Pure value-shuffling ops
/// (`Const`/`GetLocal`/`SetLocal`/`Arithmetic`) never touch the VM;
/// `Help` is every operation that needs the heap, the loader, or a
/// thread/monitor table, routed through the fixed table in
/// `help.rs`.
#[derive(Debug, Clone)]
pub enum Instr {
    Const { dst: ValueId, value: IrConst },
    GetLocal { dst: ValueId, index: u16, kind: SlotKind },
    SetLocal { index: u16, src: ValueId },
    /// One of `step_one`'s pure arithmetic/conversion/comparison
    /// opcodes (everything `arithmetic()` in the interpreter handles)
    /// applied to `operands`, producing `dst` (tagged with its kind,
    /// so the executor knows whether to pop a trailing padding slot
    /// off a wide result) if the opcode yields a value. Delegates
    /// straight to `interpreter::arithmetic` at run time rather than
    /// re-deriving wrapping/NaN semantics here, so a compiled method
    /// can never compute a different answer than an interpreted one
    /// would.
    Arithmetic { dst: Option<(ValueId, SlotKind)>, opcode: u8, operands: Vec<ValueId> },
    /// `operands` are staged onto the real frame stack, in order,
    /// immediately before the help routine runs; `dsts` (each tagged
    /// with the kind needed to know how many real slots it occupies)
    /// are popped back off afterward, and the stack is truncated back
    /// to its pre-call depth so a routine like `checkcast` that peeks
    /// rather than pops never leaks an extra real slot into the next
    /// instruction.
    Help { dsts: Vec<(ValueId, SlotKind)>, operands: Vec<ValueId>, call: HelpCall },
}

// Stack-shuffle opcodes (dup/dup2/dup_x1/dup_x2/dup2_x1/dup2_x2/pop/
// pop2/swap) never produce an `Instr`: lowering resolves them purely
// by rearranging the symbolic stack in `lower.rs`, the same way they
// cost nothing beyond stack-pointer bookkeeping in a real JIT.

/// The fixed table of VM entry points the lowerer routes field,
/// array, allocation, invocation, and misc opcodes to. This is the
/// abstraction boundary the GC's root scan stays oblivious to: every
/// help routine runs with a real `Frame` and leaves it in a state the
/// scanner already knows how to walk.
#[derive(Debug, Clone)]
pub enum HelpCall {
    GetField { pc: u32 },
    PutField { pc: u32 },
    GetStatic { pc: u32 },
    PutStatic { pc: u32 },
    ArrayLoad { opcode: u8 },
    ArrayStore { opcode: u8 },
    AllocInstance { pc: u32 },
    /// Covers both `newarray` and `anewarray`: `pc` points at the real
    /// opcode byte in the method's own code, which the routine reads
    /// to tell the two apart rather than the IR carrying a duplicate
    /// flag.
    AllocArray { pc: u32 },
    AllocMultiArray { pc: u32 },
    ArrayLength { pc: u32 },
    CheckedArithmetic { opcode: u8 },
    /// `invokevirtual`/`invokespecial`/`invokestatic`, which share one
    /// resolution routine distinguished only by `kind`.
    InvokeMethod { pc: u32, kind: InvokeShape },
    InvokeInterface { pc: u32 },
    InvokeDynamic { pc: u32 },
    LdcRef { index: u16 },
    /// instanceOf / checkcast / monitor enter-exit: one slot for the
    /// miscellaneous opcodes that don't carry their own dedicated
    /// entry, grouped the way help-routine tables traditionally bucket
    /// "everything else" together.
    Misc(MiscOp),
}

#[derive(Debug, Clone, Copy)]
pub enum InvokeShape {
    Virtual,
    Special,
    Static,
}

#[derive(Debug, Clone, Copy)]
pub enum MiscOp {
    InstanceOf { pc: u32 },
    CheckCast { pc: u32 },
    MonitorEnter,
    MonitorExit,
}

#[derive(Debug, Clone, Copy)]
pub enum IntPredicate {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// How a block ends. Every variant names its successor(s) by CFG
/// block index, resolved once at lowering time from the jump target
/// `pc`s `cfg.rs` already computed.
#[derive(Debug, Clone)]
pub enum Terminator {
    Jump { target: u32 },
    IfUnary { pred: IntPredicate, value: ValueId, if_true: u32, if_false: u32 },
    IfIntCompare { pred: IntPredicate, lhs: ValueId, rhs: ValueId, if_true: u32, if_false: u32 },
    IfRefCompare { equal: bool, lhs: ValueId, rhs: ValueId, if_true: u32, if_false: u32 },
    IfNull { is_null: bool, value: ValueId, if_true: u32, if_false: u32 },
    TableSwitch { selector: ValueId, low: i32, targets: Vec<u32>, default: u32 },
    LookupSwitch { selector: ValueId, pairs: Vec<(i32, u32)>, default: u32 },
    Return { value: Option<ValueId> },
    Throw { value: ValueId },
}
