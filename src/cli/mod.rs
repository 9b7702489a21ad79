//! The Kiln command-line interface.
//!
//! Every command compiles in a fresh [`Session`] whose loader publishes into
//! the process-wide unit namespace.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;
use tracing::debug;
use walkdir::WalkDir;

use crate::cli::args::{Command, KilnArgs, SessionArgs};
use crate::compiler::loader::{ReferenceLoader, UnitNamespace};
use crate::compiler::{codegen::ReferenceCodegen, Compilation, Session};
use crate::config::SessionConfig;
use crate::errors::{config_error, io_error, print_error, KilnError, SourceContext};
use crate::logging::init_tracing;
use crate::syntax::parse;

pub mod args;
pub mod output;

/// File extension of Kiln sources.
pub const SOURCE_EXTENSION: &str = "kiln";

/// The main entry point for the CLI.
pub fn run() {
    let args = KilnArgs::parse();
    init_tracing(args.session.verbose);

    let result = match args.command {
        Command::Expand { file, trace } => handle_expand(&args.session, &file, trace),
        Command::Macros { file } => handle_macros(&args.session, &file),
        Command::Compile { path, out } => handle_compile(&args.session, &path, out),
        Command::Ast { file } => handle_ast(&file),
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(error) => {
            print_error(error);
            process::exit(1);
        }
    }
}

// ============================================================================
// COMMAND HANDLERS
// ============================================================================

/// Returns `Ok(false)` when the source compiled with errors.
fn handle_expand(flags: &SessionArgs, file: &Path, trace: bool) -> Result<bool, KilnError> {
    let mut session = open_session(flags, None)?;
    let compilation = compile_file(&mut session, file)?;
    if trace {
        output::print_trace(&compilation.expansions);
    } else {
        println!("{}", compilation.program);
    }
    Ok(report(&compilation))
}

fn handle_macros(flags: &SessionArgs, file: &Path) -> Result<bool, KilnError> {
    let mut session = open_session(flags, None)?;
    let compilation = compile_file(&mut session, file)?;
    output::print_macros(session.types());
    Ok(report(&compilation))
}

fn handle_compile(flags: &SessionArgs, path: &Path, out: Option<PathBuf>) -> Result<bool, KilnError> {
    let mut session = open_session(flags, out)?;
    let destination = session
        .config()
        .destination
        .clone()
        .ok_or_else(|| config_error("no output directory: pass --out or set `destination`"))?;

    let mut ok = true;
    for file in source_files(path)? {
        let compilation = compile_file(&mut session, &file)?;
        ok &= report(&compilation);
    }
    let written = session.write_outputs()?;
    debug!(destination = %destination.display(), files = written.len(), "compile finished");
    output::print_written(&written);
    Ok(ok)
}

fn handle_ast(file: &Path) -> Result<bool, KilnError> {
    let text = read_source(file)?;
    let source = SourceContext::from_file(file.display().to_string(), text.clone());
    let program = parse(&text, &source)?;
    println!("{program:#?}");
    Ok(true)
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Configuration from `--config` or `kiln.yaml`, overridden by flags.
fn load_config(flags: &SessionArgs, out: Option<PathBuf>) -> Result<SessionConfig, KilnError> {
    let mut config = match &flags.config {
        Some(path) => SessionConfig::load(path)?,
        None => {
            let cwd = std::env::current_dir().map_err(|e| io_error(Path::new("."), &e))?;
            SessionConfig::discover(&cwd)?.unwrap_or_default()
        }
    };
    config.classpath.extend(flags.classpath.iter().cloned());
    if let Some(package) = &flags.package {
        config.package = package.clone();
    }
    if out.is_some() {
        config.destination = out;
    }
    config.verbose |= flags.verbose;
    Ok(config)
}

fn open_session(flags: &SessionArgs, out: Option<PathBuf>) -> Result<Session, KilnError> {
    let config = load_config(flags, out)?;
    let loader = ReferenceLoader::with_namespace(UnitNamespace::global(), config.classpath.clone());
    Ok(Session::with_backend(
        config,
        Box::new(ReferenceCodegen::new()),
        Box::new(loader),
    ))
}

fn read_source(file: &Path) -> Result<String, KilnError> {
    std::fs::read_to_string(file).map_err(|e| io_error(file, &e))
}

fn compile_file(session: &mut Session, file: &Path) -> Result<Compilation, KilnError> {
    let text = read_source(file)?;
    session.compile_source(&file.display().to_string(), &text)
}

/// `path` itself, or every `.kiln` file below it in a stable order.
fn source_files(path: &Path) -> Result<Vec<PathBuf>, KilnError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
            io_error(path, &io)
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == SOURCE_EXTENSION)
        {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Prints diagnostics; returns whether the compilation succeeded.
fn report(compilation: &Compilation) -> bool {
    output::print_warnings(&compilation.warnings);
    if compilation.is_ok() {
        return true;
    }
    output::print_errors(&compilation.errors);
    false
}
