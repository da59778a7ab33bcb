//! A `javap`-style diagnostic dump, kept from the teacher and
//! extended to also print a linked, in-memory [`cs_vm::class::Class`]
//! rather than just the raw parsed [`ClassFile`].

mod ui;

use cs_parser::ClassFile;
use cs_vm::class::Class;

/// Pretty-prints a class file exactly as parsed off disk.
pub fn print_parsed(class_file: &ClassFile) {
    let stdout = std::io::stdout();
    if let Err(why) = ui::display_parsed(stdout.lock(), class_file) {
        eprintln!("{why}");
    }
}

/// Pretty-prints a linked, in-memory class: resolved super/interface
/// handles, laid-out slot offsets, and JIT compilation state.
pub fn print_linked(class: &Class) {
    let stdout = std::io::stdout();
    if let Err(why) = ui::display_linked(stdout.lock(), class) {
        eprintln!("{why}");
    }
}
