//! Shared data model used by both the class-file decoder (`cs_parser`)
//! and the virtual machine (`cs_vm`): the tagged value/slot type,
//! field and method descriptor parsing, and the access-flag bitsets.

pub mod access_flags;
pub mod descriptor;
pub mod objref;
pub mod slot;

pub use access_flags::{ClassAccessFlags, FieldAccessFlags, InnerClassAccessFlags, MethodAccessFlags};
pub use descriptor::{DescriptorError, FieldType, MethodDescriptor, MethodReturn};
pub use objref::ObjRef;
pub use slot::{Slot, SlotKind};

/// The raw integer types used throughout the class-file spec, named
/// the way the format itself names them.
#[allow(non_camel_case_types)]
pub type u1 = u8;
#[allow(non_camel_case_types)]
pub type u2 = u16;
#[allow(non_camel_case_types)]
pub type u4 = u32;
