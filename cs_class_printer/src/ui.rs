use std::io;
use std::io::Write;

use cs_parser::ClassFile;
use cs_vm::class::{Class, InstanceClass};

fn access_flag_names(bits: u16, names: &[(u16, &str)]) -> String {
    let matched: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if matched.is_empty() {
        "<none>".to_string()
    } else {
        matched.join(" ")
    }
}

const CLASS_FLAG_NAMES: &[(u16, &str)] = &[
    (0x0001, "public"),
    (0x0010, "final"),
    (0x0020, "super"),
    (0x0200, "interface"),
    (0x0400, "abstract"),
    (0x1000, "synthetic"),
    (0x2000, "annotation"),
    (0x4000, "enum"),
];

const MEMBER_FLAG_NAMES: &[(u16, &str)] = &[
    (0x0001, "public"),
    (0x0002, "private"),
    (0x0004, "protected"),
    (0x0008, "static"),
    (0x0010, "final"),
    (0x0020, "synchronized"),
    (0x0040, "bridge/volatile"),
    (0x0080, "varargs/transient"),
    (0x0100, "native"),
    (0x0400, "abstract"),
    (0x0800, "strictfp"),
    (0x1000, "synthetic"),
];

/// Dumps a raw, unlinked [`ClassFile`] as parsed directly off disk —
/// the constant-pool indices a `.class` file itself stores, not the
/// resolved names a loaded [`Class`] carries.
pub fn display_parsed<W: Write>(mut w: W, class: &ClassFile) -> Result<(), io::Error> {
    writeln!(w, ".class file version {}.{}", class.major_version, class.minor_version)?;
    writeln!(w)?;

    let this_name = class.this_class_name().unwrap_or("<unresolved>");
    let super_name = class.super_class_name().ok().flatten().unwrap_or("<none>");
    writeln!(
        w,
        "class {this_name} extends {super_name} [{}]",
        access_flag_names(class.access_flags, CLASS_FLAG_NAMES)
    )?;

    if !class.interfaces.is_empty() {
        let names: Vec<&str> = class
            .interfaces
            .iter()
            .filter_map(|&idx| class.constant_pool.class_name(idx).ok())
            .collect();
        writeln!(w, "  implements {}", names.join(", "))?;
    }

    writeln!(w)?;
    writeln!(w, " constant pool: {} entries", class.constant_pool.len())?;

    writeln!(w)?;
    writeln!(w, " fields:")?;
    for field in &class.fields {
        let name = class.constant_pool.utf8(field.name_index).unwrap_or("?");
        let descriptor = class.constant_pool.utf8(field.descriptor_index).unwrap_or("?");
        writeln!(
            w,
            "  [{}] {descriptor} {name}",
            access_flag_names(field.access_flags, MEMBER_FLAG_NAMES)
        )?;
    }

    writeln!(w)?;
    writeln!(w, " methods:")?;
    for method in &class.methods {
        let name = class.constant_pool.utf8(method.name_index).unwrap_or("?");
        let descriptor = class.constant_pool.utf8(method.descriptor_index).unwrap_or("?");
        writeln!(
            w,
            "  [{}] {name}{descriptor}",
            access_flag_names(method.access_flags, MEMBER_FLAG_NAMES)
        )?;
        if let Some(code) = method.code_attribute() {
            if let cs_parser::Attribute::Code { code, max_stack, max_locals, .. } = code {
                writeln!(w, "    code: {} bytes, max_stack={max_stack}, max_locals={max_locals}", code.len())?;
            }
        }
    }

    Ok(())
}

/// Dumps a linked, in-memory [`Class`] — resolved super/interface
/// handles and laid-out instance/static slot offsets instead of raw
/// constant-pool indices, which is the shape the interpreter actually
/// runs against.
pub fn display_linked<W: Write>(mut w: W, class: &Class) -> Result<(), io::Error> {
    match class {
        Class::Primitive { name, slot_kind } => {
            writeln!(w, "primitive {name} ({slot_kind:?})")
        }
        Class::ObjectArray(array) | Class::TypeArray(array) => {
            writeln!(
                w,
                "array {} (dimensions={}, component={})",
                array.name,
                array.dimensions,
                array.component.name()
            )
        }
        Class::Instance(instance) => display_linked_instance(w, instance),
    }
}

fn display_linked_instance<W: Write>(mut w: W, instance: &InstanceClass) -> Result<(), io::Error> {
    let super_name = instance.super_class.read().as_ref().map(|c| c.name().to_string());
    writeln!(
        w,
        "class {} extends {}",
        instance.name,
        super_name.as_deref().unwrap_or("<none>")
    )?;
    let interface_names: Vec<String> = instance.interfaces.read().iter().map(|i| i.name().to_string()).collect();
    if !interface_names.is_empty() {
        writeln!(w, "  implements {}", interface_names.join(", "))?;
    }

    writeln!(
        w,
        "  instance slots: {} own, {} inherited, {} total",
        instance.instance_slot_count,
        *instance.instance_slot_base.read(),
        instance.total_instance_slots()
    )?;
    writeln!(w, "  static slots: {}", instance.static_slots.read().len())?;

    writeln!(w)?;
    writeln!(w, " fields:")?;
    for field in &instance.fields {
        writeln!(
            w,
            "  {:?} {} {} (slot {})",
            field.slot_kind, field.descriptor, field.name, field.slot_index
        )?;
    }

    writeln!(w)?;
    writeln!(w, " methods:")?;
    for method in &instance.methods {
        writeln!(w, "  {}{}", method.name, method.descriptor)?;
        writeln!(
            w,
            "    jit: {}",
            if method.compiled.read().is_some() { "compiled" } else { "interpreted" }
        )?;
    }

    Ok(())
}
