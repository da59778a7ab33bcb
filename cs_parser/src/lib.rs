//! Decoder for the class-file binary format: the byte reader (§2.1),
//! constant pool and attribute model (§2.2), tying into a single
//! [`parse_class_file`] entry point, exactly as the teacher's
//! `cs_parser::parse_class_file` is consumed by `src/main.rs` and
//! `cs_class_printer`.

pub mod attributes;
pub mod class_file;
pub mod constant_pool;
pub mod error;
pub mod reader;

pub use attributes::{
    Attribute, BootstrapMethodEntry, ExceptionTableEntry, InnerClassEntry, LineNumberEntry,
    LocalVariableEntry, RawAttribute, StackMapFrame, VerificationTypeInfo,
};
pub use class_file::{parse_class_file, ClassFile, FieldInfo, MethodInfo};
pub use constant_pool::{ConstantPool, CpInfo};
pub use error::{ParseError, Result};
pub use reader::ByteReader;
