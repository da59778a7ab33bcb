//! On-stack-replacement-free method compilation: once a method's
//! invocation count crosses [`crate::config::VmConfig::jit_threshold`],
//! [`maybe_compile`] lowers its bytecode to the typed IR in [`ir`]
//! (via [`lower`]) and stores the result in [`class::Method::compiled`]
//! for [`run_compiled`] to drive on every subsequent call.
//!
//! A method that can't be lowered (an unsupported opcode, a
//! malformed stack shape) or that declares a `try`/`catch` simply
//! stays interpreted: [`maybe_compile`] swallows the lowering error
//! and logs it rather than propagating, and skips a method with a
//! non-empty exception table outright, since failing to compile is
//! never a correctness problem, only a missed optimization. `exec.rs`
//! guarantees a compiled method produces the same
//! [`crate::interpreter::FrameOutcome`] a plain interpreted run
//! would, so callers never need to know which path ran.
//!
//! A native-code backend (e.g. `cranelift-codegen`, gated behind the
//! `cranelift` feature) would slot in as an alternative executor for
//! the same IR this module already produces; until one exists,
//! [`run_compiled`] is itself that executor, interpreting the IR one
//! instruction at a time rather than one bytecode at a time.

mod exec;
mod help;
mod ir;
mod lower;

use tracing::{debug, warn};

use crate::cfg::MethodCfg;
use crate::class::{Class, ClassRef};
use crate::error::Result;
use crate::frame::Frame;
use crate::interpreter::FrameOutcome;
use crate::vm::Vm;

pub use exec::CompiledMethod;

/// Lowers `class.methods[method_index]` and installs the result in
/// the method's `compiled` slot. A no-op if the method has already
/// been compiled, has no code (abstract/native — `invoke_method`
/// never reaches here for those, but a belt-and-braces check costs
/// nothing), or fails to lower.
pub fn maybe_compile(_vm: &Vm, class: &ClassRef, method_index: usize) {
    let Class::Instance(ic) = class.as_ref() else {
        return;
    };
    let method = &ic.methods[method_index];
    if method.compiled.read().is_some() {
        return;
    }
    if method.code.is_empty() {
        return;
    }
    if !method.exception_table.is_empty() {
        debug!(class = %ic.name, method = %method.name, "jit: method has a try/catch, staying interpreted");
        return;
    }

    match compile(ic, &method.code) {
        Ok(compiled) => {
            debug!(class = %ic.name, method = %method.name, "jit: compiled method");
            *method.compiled.write() = Some(compiled);
        }
        Err(err) => {
            warn!(class = %ic.name, method = %method.name, error = %err, "jit: falling back to the interpreter");
        }
    }
}

fn compile(ic: &crate::class::InstanceClass, code: &[u8]) -> Result<CompiledMethod> {
    let cfg = MethodCfg::build(code)?;
    let blocks = lower::lower_method(ic, code, &cfg)?;
    Ok(CompiledMethod { blocks })
}

/// Runs a method that [`maybe_compile`] has already lowered. Never
/// called unless `method.compiled` is `Some`, so `compiled` here is
/// always a fully-lowered method, not a partial one.
pub fn run_compiled(compiled: &CompiledMethod, vm: &Vm, thread_id: u64, frame: &mut Frame) -> Result<FrameOutcome> {
    exec::run_compiled(compiled, vm, thread_id, frame)
}
