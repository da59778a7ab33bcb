//! Error taxonomy, per spec.md §7: managed exceptions are modeled
//! separately (they're heap objects, see [`crate::heap::ObjRef`]
//! thrown values); this enum covers linkage failures and fatal
//! invariant violations — the two kinds `main` can actually observe
//! and react to before a managed frame exists to catch them.

use cs_model::u2;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("parse error: {0}")]
    Parse(#[from] cs_parser::ParseError),

    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("could not initialize class {0}: initializer previously failed")]
    NoClassDefFound(String),

    #[error("unresolved field {class}.{name}:{descriptor}")]
    UnresolvedField {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("unresolved method {class}.{name}{descriptor}")]
    UnresolvedMethod {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("constant pool index {0} does not resolve to a usable entry")]
    BadConstantPoolIndex(u2),

    #[error("fatal VM error: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmError>;

impl VmError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        VmError::Fatal(msg.into())
    }
}
