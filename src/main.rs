//! The VM's command-line entry point: parses argv, wires the class
//! path, constructs a [`Vm`], and runs it (spec.md §6's "argv[0] is
//! the entry class's internal name; argv[1..] are passed to `main`").

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use cs_vm::classpath::DirClassPath;
use cs_vm::{Vm, VmConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A bytecode virtual machine for the class-file object platform.
#[derive(Parser, Debug)]
#[command(name = "coldsquare", version, about)]
struct Cli {
    /// Class-path entries (directories holding `.class` files),
    /// `:`/`;`-separated or repeated. Falls back to `CLASSPATH`/
    /// `JAVA_HOME`/`JAVA8_HOME` when empty.
    #[arg(short = 'c', long = "classpath", visible_alias = "cp", value_delimiter = if cfg!(windows) { ';' } else { ':' })]
    class_path: Vec<String>,

    /// Dump a single `.class` file's parsed structure to stdout and
    /// exit instead of running it — a `javap`-style diagnostic, not
    /// part of the VM's normal execution path.
    #[arg(long = "dump-class", value_name = "FILE")]
    dump_class: Option<String>,

    /// Internal name (`pkg/Cls`, not `pkg.Cls`) of the class whose
    /// `static void main(String[])` starts the program. Required
    /// unless `--dump-class` is given.
    #[arg(required_unless_present = "dump_class")]
    entry_class: Option<String>,

    /// Arguments forwarded to the entry class's `main` method.
    program_args: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(path) = cli.dump_class {
        return dump_class(&path);
    }

    let entry_class = cli.entry_class.expect("clap enforces entry_class is present without --dump-class");
    let config = VmConfig::new(entry_class, cli.program_args, cli.class_path);
    let class_path = Box::new(DirClassPath::new(config.class_path.clone()));
    info!(entry_class = config.entry_class, class_path = ?config.class_path, "starting vm");

    let vm = Arc::new(Vm::new_with_class_path(config, class_path));
    match vm.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("coldsquare: {err}");
            ExitCode::FAILURE
        }
    }
}

fn dump_class(path: &str) -> ExitCode {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("coldsquare: could not read {path}: {err}");
            return ExitCode::FAILURE;
        }
    };
    match cs_parser::parse_class_file(&bytes) {
        Ok(class_file) => {
            cs_class_printer::print_parsed(&class_file);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("coldsquare: {err}");
            ExitCode::FAILURE
        }
    }
}
