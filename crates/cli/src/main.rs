//! Command-line driver: parses CLI arguments, loads optional VM
//! configuration, reads a program, compiles it, and interprets the
//! resulting `Proto`. Pairing compilation and execution — and turning
//! their respective error types into one process exit code — is this
//! binary's job; neither `xr-compiler` nor `xr-vm` know about each other.

mod config;
#[cfg(feature = "toy-parser")]
mod toy_parser;

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use xr_compiler::{CompileError, Node};
use xr_core::VmConfig;
use xr_symbol::SymbolTable;
use xr_vm::{TraceFrame, Vm, VmError};

use config::CliError;

#[derive(Parser, Debug)]
#[command(name = "xray", about = "xray scripting language compiler and VM")]
struct Cli {
    /// Script file to run. Omit to read from `-e` instead.
    file: Option<PathBuf>,

    /// Enables per-instruction execution tracing (logged at `trace` level).
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Evaluates the given source string instead of reading a file.
    #[arg(short = 'e', long = "eval", value_name = "CODE")]
    eval: Option<String>,

    /// Writes a debug dump of the parsed AST to the given path and exits.
    #[arg(long, value_name = "PATH")]
    dump_ast: Option<PathBuf>,

    /// Loads `VmConfig` overrides from a TOML file (see `xr-core::config`).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Outcome of compiling and running one program, mirroring the split
/// between `xr-compiler`'s and `xr-vm`'s independent error types.
enum VmOutcome {
    Ok,
    CompileError(Vec<CompileError>),
    RuntimeError(VmError, Vec<TraceFrame>),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "trace" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let vm_config = match &cli.config {
        Some(path) => config::load_vm_config(path)?,
        None => VmConfig::default(),
    };

    let source = read_source(&cli)?;

    let statements = parse_source(&source)?;

    if let Some(dump_path) = &cli.dump_ast {
        fs::write(dump_path, format!("{statements:#?}\n"))
            .map_err(|source| CliError::Io { path: dump_path.clone(), source })?;
        return Ok(());
    }

    match compile_and_run(&statements, vm_config) {
        VmOutcome::Ok => Ok(()),
        VmOutcome::CompileError(errors) => Err(CliError::compile(errors)),
        VmOutcome::RuntimeError(err, trace) => Err(CliError::runtime(err, trace)),
    }
}

fn read_source(cli: &Cli) -> Result<String, CliError> {
    if let Some(code) = &cli.eval {
        return Ok(code.clone());
    }
    match &cli.file {
        Some(path) => {
            fs::read_to_string(path).map_err(|source| CliError::Io { path: path.clone(), source })
        }
        None => Err(CliError::NoInput),
    }
}

#[cfg(feature = "toy-parser")]
fn parse_source(source: &str) -> Result<Vec<Node>, CliError> {
    toy_parser::parse(source).map_err(CliError::Parse)
}

#[cfg(not(feature = "toy-parser"))]
fn parse_source(_source: &str) -> Result<Vec<Node>, CliError> {
    Err(CliError::NoParser)
}

fn compile_and_run(statements: &[Node], vm_config: VmConfig) -> VmOutcome {
    let symbols = Rc::new(RefCell::new(SymbolTable::new()));
    let proto = match xr_compiler::compile_program(statements, Rc::clone(&symbols)) {
        Ok(proto) => proto,
        Err(errors) => return VmOutcome::CompileError(errors),
    };

    let mut vm = Vm::new(symbols, vm_config);
    match vm.interpret(proto) {
        Ok(()) => VmOutcome::Ok,
        Err((err, trace)) => VmOutcome::RuntimeError(err, trace),
    }
}
