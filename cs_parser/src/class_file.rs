//! The top-level `ClassFile` decoder, grounded on
//! `src/parse/mod.rs`'s `Parse for ClassFile` impl: magic, version,
//! constant pool, access flags, super/interfaces, fields, methods,
//! attributes, in that exact order (spec.md §6's "class-unit
//! format").

use crate::attributes::{Attribute, RawAttribute};
use crate::constant_pool::ConstantPool;
use crate::error::{ParseError, Result};
use crate::reader::ByteReader;
use cs_model::{u2, u4};

const CLASS_FILE_MAGIC: u4 = 0xCAFE_BABE;

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u2,
    pub name_index: u2,
    pub descriptor_index: u2,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u2,
    pub name_index: u2,
    pub descriptor_index: u2,
    pub attributes: Vec<Attribute>,
}

impl MethodInfo {
    pub fn code_attribute(&self) -> Option<&Attribute> {
        self.attributes.iter().find(|a| matches!(a, Attribute::Code { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u2,
    pub major_version: u2,
    pub constant_pool: ConstantPool,
    pub access_flags: u2,
    pub this_class: u2,
    pub super_class: Option<u2>,
    pub interfaces: Vec<u2>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    pub fn this_class_name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn super_class_name(&self) -> Result<Option<&str>> {
        match self.super_class {
            None => Ok(None),
            Some(index) => self.constant_pool.class_name(index).map(Some),
        }
    }

    pub fn source_file(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::SourceFile { index } => self.constant_pool.utf8(*index).ok(),
            _ => None,
        })
    }
}

fn parse_fields_or_methods_raw(reader: &mut ByteReader) -> Result<Vec<(u2, u2, u2, Vec<RawAttribute>)>> {
    let count = reader.u2()?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = reader.u2()?;
        let name_index = reader.u2()?;
        let descriptor_index = reader.u2()?;
        let attr_count = reader.u2()?;
        let mut attrs = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            attrs.push(RawAttribute::parse(reader)?);
        }
        items.push((access_flags, name_index, descriptor_index, attrs));
    }
    Ok(items)
}

fn resolve_attributes(raw: Vec<RawAttribute>, pool: &ConstantPool) -> Result<Vec<Attribute>> {
    raw.into_iter()
        .map(|r| {
            let mut attr = r.resolve(pool)?;
            attr.resolve_nested_code_attributes(pool)?;
            Ok(attr)
        })
        .collect()
}

/// Parses a complete class unit from its byte buffer.
pub fn parse_class_file(data: &[u8]) -> Result<ClassFile> {
    let mut reader = ByteReader::new(data);

    let magic = reader.u4()?;
    if magic != CLASS_FILE_MAGIC {
        return Err(ParseError::BadMagic(magic));
    }
    let minor_version = reader.u2()?;
    let major_version = reader.u2()?;

    let constant_pool_count = reader.u2()?;
    let constant_pool = ConstantPool::parse(&mut reader, constant_pool_count)?;

    let access_flags = reader.u2()?;
    let this_class = reader.u2()?;
    let super_class = match reader.u2()? {
        0 => None,
        n => Some(n),
    };

    let interfaces_count = reader.u2()?;
    let mut interfaces = Vec::with_capacity(interfaces_count as usize);
    for _ in 0..interfaces_count {
        interfaces.push(reader.u2()?);
    }

    let raw_fields = parse_fields_or_methods_raw(&mut reader)?;
    let raw_methods = parse_fields_or_methods_raw(&mut reader)?;

    let attributes_count = reader.u2()?;
    let mut raw_class_attrs = Vec::with_capacity(attributes_count as usize);
    for _ in 0..attributes_count {
        raw_class_attrs.push(RawAttribute::parse(&mut reader)?);
    }

    let fields = raw_fields
        .into_iter()
        .map(|(access_flags, name_index, descriptor_index, attrs)| {
            Ok(FieldInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes: resolve_attributes(attrs, &constant_pool)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let methods = raw_methods
        .into_iter()
        .map(|(access_flags, name_index, descriptor_index, attrs)| {
            Ok(MethodInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes: resolve_attributes(attrs, &constant_pool)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let attributes = resolve_attributes(raw_class_attrs, &constant_pool)?;

    Ok(ClassFile {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(s: &str) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend((s.len() as u16).to_be_bytes());
        out.extend(s.as_bytes());
        out
    }

    /// Hand-assembles the smallest legal class file: no fields, no
    /// methods, no interfaces, extending `java/lang/Object`.
    fn minimal_class_bytes(class_name: &str) -> Vec<u8> {
        let mut cp = Vec::new();
        cp.extend(utf8(class_name)); // #1
        cp.extend([7, 0, 1]); // #2 Class -> #1
        cp.extend(utf8("java/lang/Object")); // #3
        cp.extend([7, 0, 3]); // #4 Class -> #3

        let mut data = Vec::new();
        data.extend(0xCAFEBABEu32.to_be_bytes());
        data.extend(0u16.to_be_bytes()); // minor
        data.extend(52u16.to_be_bytes()); // major
        data.extend(5u16.to_be_bytes()); // constant_pool_count = max_index + 1
        data.extend(cp);
        data.extend(0x0021u16.to_be_bytes()); // ACC_PUBLIC | ACC_SUPER
        data.extend(2u16.to_be_bytes()); // this_class
        data.extend(4u16.to_be_bytes()); // super_class
        data.extend(0u16.to_be_bytes()); // interfaces_count
        data.extend(0u16.to_be_bytes()); // fields_count
        data.extend(0u16.to_be_bytes()); // methods_count
        data.extend(0u16.to_be_bytes()); // attributes_count
        data
    }

    #[test]
    fn parses_minimal_class() {
        let bytes = minimal_class_bytes("Minimal");
        let class = parse_class_file(&bytes).unwrap();
        assert_eq!(class.this_class_name().unwrap(), "Minimal");
        assert_eq!(class.super_class_name().unwrap(), Some("java/lang/Object"));
        assert!(class.fields.is_empty());
        assert!(class.methods.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = minimal_class_bytes("Minimal");
        bytes[0] = 0;
        assert!(matches!(parse_class_file(&bytes), Err(ParseError::BadMagic(_))));
    }
}
