//! Shared helpers for the Kiln integration suites.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kiln::compiler::codegen::ReferenceCodegen;
use kiln::compiler::loader::{ReferenceLoader, UnitNamespace};
use kiln::compiler::{Artifacts, CodeGenerator, Compilation};
use kiln::errors::{KilnError, SourceContext};
use kiln::syntax::{collapse, parse};
use kiln::{Node, Session, SessionConfig, TemplateEngine};

/// Reference code generator that counts how many units it compiled.
#[derive(Debug, Clone, Default)]
pub struct CountingCodegen {
    inner: ReferenceCodegen,
    count: Arc<AtomicUsize>,
}

impl CountingCodegen {
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

impl CodeGenerator for CountingCodegen {
    fn compile(&self, unit: &Node, templates: &TemplateEngine<Node>) -> Result<Artifacts, KilnError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(unit, templates)
    }
}

/// Session with default configuration and a private unit namespace.
pub fn session() -> Session {
    Session::new(SessionConfig::default())
}

/// Session whose compile calls are counted.
pub fn counted_session() -> (Session, Arc<AtomicUsize>) {
    let codegen = CountingCodegen::default();
    let count = codegen.counter();
    let loader = ReferenceLoader::new(Vec::new());
    let session = Session::with_backend(SessionConfig::default(), Box::new(codegen), Box::new(loader));
    (session, count)
}

/// Session publishing into `namespace`.
pub fn shared_session(namespace: Arc<UnitNamespace>) -> Session {
    let loader = ReferenceLoader::with_namespace(namespace, Vec::new());
    Session::with_backend(
        SessionConfig::default(),
        Box::new(ReferenceCodegen::new()),
        Box::new(loader),
    )
}

/// Session writing its output to `destination`.
pub fn writing_session(destination: &Path) -> Session {
    Session::new(SessionConfig {
        destination: Some(destination.to_path_buf()),
        ..SessionConfig::default()
    })
}

/// Session reading earlier output from `classpath`.
pub fn reading_session(classpath: &Path) -> Session {
    Session::new(SessionConfig {
        classpath: vec![classpath.to_path_buf()],
        ..SessionConfig::default()
    })
}

/// Session that reads earlier output from `dir` and writes back into it.
pub fn round_trip_session(dir: &Path) -> Session {
    Session::new(SessionConfig {
        destination: Some(dir.to_path_buf()),
        classpath: vec![dir.to_path_buf()],
        ..SessionConfig::default()
    })
}

/// Compiles `text`, panicking on syntax errors.
pub fn compile(session: &mut Session, text: &str) -> Compilation {
    session
        .compile_source("test.kiln", text)
        .unwrap_or_else(|e| panic!("syntax error: {e}"))
}

/// Compiles `text` and asserts that it produced no error.
pub fn compile_ok(session: &mut Session, text: &str) -> Compilation {
    let compilation = compile(session, text);
    if let Some(error) = compilation.errors.first() {
        panic!("unexpected error: {error}");
    }
    compilation
}

/// The single statement `text` parses to.
pub fn expr(text: &str) -> Node {
    collapse(parse(text, &SourceContext::from_file("expected.kiln", text)).expect("parse"))
}

/// Non-noop statements of a compiled program.
pub fn statements(compilation: &Compilation) -> Vec<&Node> {
    compilation
        .program
        .statements()
        .iter()
        .filter(|n| !matches!(n.kind, kiln::NodeKind::Noop))
        .collect()
}
