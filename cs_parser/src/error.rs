use cs_model::u1;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected end of class file data")]
    UnexpectedEof,
    #[error("bad magic number: expected 0xCAFEBABE, found {0:#010X}")]
    BadMagic(u32),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u1),
    #[error("invalid stack map frame type: {0}")]
    InvalidStackMapFrameType(u1),
    #[error("invalid verification type tag: {0}")]
    InvalidVerificationTypeTag(u1),
    #[error("invalid annotation element value tag: {0}")]
    InvalidAnnotationElementTag(char),
    #[error("constant pool index {0} out of bounds")]
    ConstantPoolIndexOutOfBounds(u16),
    #[error("constant pool entry at index {0} has unexpected kind (expected {1})")]
    ConstantPoolKindMismatch(u16, &'static str),
    #[error("invalid modified utf-8 in constant pool: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("attribute name at index {0} is not a Utf8 constant")]
    AttributeNameNotUtf8(u16),
    #[error("unknown attribute name: {0}")]
    UnknownAttribute(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;
