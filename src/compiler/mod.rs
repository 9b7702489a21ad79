//! Compilation sessions.
//!
//! A [`Session`] owns everything one compilation needs: configuration, the
//! type registry, the template engine, the macro definition arena, the inline
//! expanders and the code generation backend. Nothing is shared between
//! sessions except units published in a shared [`loader::UnitNamespace`].
//!
//! The session is also the [`Transformer`] handed to compiled macros, which
//! use it to turn quoted template text back into trees.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::ast::{Node, NodeKind, Span};
use crate::config::SessionConfig;
use crate::errors::{DiagnosticContext, KilnError, SourceContext};
use crate::macros::metadata::{reconstruct, DescriptorStore};
use crate::macros::{EntryKind, InlineRegistry, MacroDefinitions, MacroEntry, MacroHandle};
use crate::syntax::{collapse, parse, parse_with, ParseOptions};
use crate::template::TemplateEngine;
use crate::types::{MethodInfo, OwnerType, TypeRef, TypeRegistry};

pub mod codegen;
pub mod interp;
pub mod loader;
pub mod typer;

use codegen::ReferenceCodegen;
use loader::ReferenceLoader;
use typer::Typer;

/// Compiled units by fully-qualified name.
pub type Artifacts = BTreeMap<String, Vec<u8>>;

// ============================================================================
// COLLABORATOR INTERFACES
// ============================================================================

/// Compiler services available to running macros.
pub trait Transformer {
    /// Expands inline macros in `form`, failing on the first error.
    fn transform(&mut self, form: Node) -> Result<Node, KilnError>;

    /// Parses template text, resolving ordinal placeholders to `bindings`,
    /// and transforms the result.
    fn eval(&mut self, code: &str, label: &str, bindings: Vec<Node>) -> Result<Node, KilnError>;

    /// `template` followed by the next value of the session counter.
    fn fresh_name(&mut self, template: &str) -> String;

    /// Where compiled output is written, if anywhere.
    fn destination(&self) -> Option<&Path>;

    fn verbose(&self) -> bool;
}

/// Turns a typed tree into loadable artifacts.
pub trait CodeGenerator: fmt::Debug {
    fn compile(&self, unit: &Node, templates: &TemplateEngine<Node>) -> Result<Artifacts, KilnError>;
}

/// Loads compiled units into the running process.
pub trait UnitLoader: fmt::Debug {
    /// Loads `artifacts` and returns the handle of unit `fqn`.
    fn load_unit(&self, fqn: &str, artifacts: &Artifacts) -> Result<Arc<dyn MacroHandle>, KilnError>;

    /// Finds an already compiled unit by name.
    fn resolve_unit(&self, fqn: &str) -> Result<Arc<dyn MacroHandle>, KilnError>;

    /// Whether `fqn` is already loaded or present on the classpath.
    fn contains_unit(&self, fqn: &str) -> bool;
}

// ============================================================================
// SCOPES
// ============================================================================

/// Static context of the code being typed.
#[derive(Debug, Clone)]
pub struct Scope {
    pub self_type: TypeRef,
    /// Type whose macros a synthesized unit may call unqualified.
    pub lexical_owner: Option<String>,
    pub script_type: String,
    pub locals: BTreeMap<String, TypeRef>,
}

impl Scope {
    pub fn script(script_type: &str) -> Self {
        Self {
            self_type: TypeRef::Named(script_type.to_string()),
            lexical_owner: None,
            script_type: script_type.to_string(),
            locals: BTreeMap::new(),
        }
    }

    /// Scope of an extension unit for a macro defined on `owner`.
    pub fn extension(unit: &str, owner: &str, script_type: &str) -> Self {
        Self {
            self_type: TypeRef::Named(unit.to_string()),
            lexical_owner: Some(owner.to_string()),
            script_type: script_type.to_string(),
            locals: BTreeMap::new(),
        }
    }

    /// Scope for the body of a class.
    pub fn class(&self, self_type: TypeRef) -> Self {
        Self {
            self_type,
            lexical_owner: self.lexical_owner.clone(),
            script_type: self.script_type.clone(),
            locals: BTreeMap::new(),
        }
    }

    /// Scope for a method or block body, seeded with its parameters.
    pub fn nested(&self, params: impl IntoIterator<Item = (String, TypeRef)>, inherit_locals: bool) -> Self {
        let mut locals = if inherit_locals {
            self.locals.clone()
        } else {
            BTreeMap::new()
        };
        locals.extend(params);
        Self {
            self_type: self.self_type.clone(),
            lexical_owner: self.lexical_owner.clone(),
            script_type: self.script_type.clone(),
            locals,
        }
    }

    /// Owners searched for an unqualified macro call, in order.
    pub fn macro_owners(&self) -> Vec<String> {
        let mut owners = Vec::new();
        if let Some(owner) = self.self_type.owner_name() {
            owners.push(owner.to_string());
        }
        for owner in self.lexical_owner.iter().chain(std::iter::once(&self.script_type)) {
            if !owners.contains(owner) {
                owners.push(owner.clone());
            }
        }
        owners
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// One compiled macro call replaced by its expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionStep {
    pub macro_name: String,
    pub unit: String,
    /// Nesting level; calls produced by another expansion are one deeper.
    pub depth: usize,
    pub call: String,
    pub expansion: String,
}

/// Result of compiling one source.
#[derive(Debug)]
pub struct Compilation {
    /// The fully expanded program.
    pub program: Node,
    pub errors: Vec<KilnError>,
    pub warnings: Vec<KilnError>,
    /// Compiled macro expansions, in the order they ran.
    pub expansions: Vec<ExpansionStep>,
}

impl Compilation {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// State of one compilation session.
#[derive(Debug)]
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) types: TypeRegistry,
    pub(crate) templates: TemplateEngine<Node>,
    pub(crate) definitions: MacroDefinitions,
    pub(crate) inline: InlineRegistry,
    pub(crate) codegen: Box<dyn CodeGenerator>,
    pub(crate) loader: Box<dyn UnitLoader>,
    pub(crate) warnings: Vec<KilnError>,
    pub(crate) expansions: Vec<ExpansionStep>,
    counter: usize,
    /// Spans of the call sites currently being expanded, innermost last.
    pub(crate) sites: Vec<Span>,
    /// Source currently being compiled.
    pub(crate) source: SourceContext,
}

impl Session {
    /// Session with the reference backend and a private unit namespace.
    pub fn new(config: SessionConfig) -> Self {
        let loader = ReferenceLoader::new(config.classpath.clone());
        Self::with_backend(config, Box::new(ReferenceCodegen::new()), Box::new(loader))
    }

    pub fn with_backend(
        config: SessionConfig,
        codegen: Box<dyn CodeGenerator>,
        loader: Box<dyn UnitLoader>,
    ) -> Self {
        Self {
            types: TypeRegistry::new(&config.script_type),
            config,
            templates: TemplateEngine::new(),
            definitions: MacroDefinitions::new(),
            inline: InlineRegistry::with_builtins(),
            codegen,
            loader,
            warnings: Vec::new(),
            expansions: Vec::new(),
            counter: 0,
            sites: Vec::new(),
            source: SourceContext::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn definitions(&self) -> &MacroDefinitions {
        &self.definitions
    }

    pub fn warnings(&self) -> &[KilnError] {
        &self.warnings
    }

    pub fn templates(&self) -> &TemplateEngine<Node> {
        &self.templates
    }

    pub fn inline_macros(&self) -> &InlineRegistry {
        &self.inline
    }

    pub fn inline_macros_mut(&mut self) -> &mut InlineRegistry {
        &mut self.inline
    }

    /// Parses, expands and types `text`.
    ///
    /// Syntax errors abort the compilation. Every other failure is collected
    /// in the returned [`Compilation`] and leaves an error marker in the tree.
    pub fn compile_source(&mut self, name: &str, text: &str) -> Result<Compilation, KilnError> {
        self.source = SourceContext::from_file(name, text);
        let warnings_before = self.warnings.len();
        let expansions_before = self.expansions.len();
        debug!(source = name, "compiling");

        let program = parse(text, &self.source)?;
        let mut errors = Vec::new();
        let mut program = self.expand_inline(program, Some(&mut errors))?;

        let mut scope = Scope::script(&self.config.script_type);
        let mut typer = Typer::new(self);
        typer.infer(&mut program, &mut scope);
        errors.extend(typer.resolve(false)?);

        if self.config.destination.is_some() {
            self.write_outputs()?;
        }

        Ok(Compilation {
            program,
            errors,
            warnings: self.warnings[warnings_before..].to_vec(),
            expansions: self.expansions[expansions_before..].to_vec(),
        })
    }

    /// Writes the descriptor of every type compiled in this session.
    pub fn write_outputs(&self) -> Result<Vec<PathBuf>, KilnError> {
        let Some(destination) = self.config.destination.as_deref() else {
            return Ok(Vec::new());
        };
        let store = DescriptorStore::new(destination);
        self.types.descriptors().map(|d| store.write(d)).collect()
    }

    /// Reads `name` back from the classpath. Returns whether it was found.
    pub fn import_type(&mut self, name: &str) -> Result<bool, KilnError> {
        let Some(descriptor) = DescriptorStore::find(&self.config.classpath, name)? else {
            return Ok(false);
        };
        let handles = reconstruct(&descriptor, self.loader.as_ref())?;

        let mut owner = OwnerType {
            name: descriptor.name.clone(),
            superclass: descriptor.superclass.clone(),
            methods: BTreeMap::new(),
            macros: Default::default(),
            descriptor: None,
            builtin: false,
        };
        for method in &descriptor.methods {
            owner.methods.insert(
                method.name.clone(),
                MethodInfo {
                    name: method.name.clone(),
                    params: method.params.iter().map(|p| TypeRef::from_name(p)).collect(),
                    returns: TypeRef::from_name(&method.returns),
                },
            );
        }
        for (record, handle) in handles {
            // A blockless record sharing its unit with a block-taking one is
            // the overload of a macro whose block is optional.
            let overload = !record.signature.has_block()
                && descriptor.macros.iter().any(|other| {
                    other.unit == record.unit
                        && other.signature.has_block()
                        && other.signature.without_block() == record.signature
                });
            owner.macros.add(MacroEntry {
                name: record.name.clone(),
                argument_types: record.signature.argument_types(),
                signature: record.signature.clone(),
                handle,
                kind: if overload {
                    EntryKind::BlocklessOverload
                } else {
                    EntryKind::Macro
                },
            });
        }
        debug!(
            type_name = name,
            macros = owner.macros.len(),
            "imported type from classpath"
        );
        owner.descriptor = Some(descriptor);
        self.types.install(owner);
        Ok(true)
    }

    /// Expands inline macros. With an error sink, a failing statement is
    /// recorded and replaced by an error marker; without one the first
    /// failure is returned.
    pub(crate) fn expand_inline(
        &mut self,
        mut form: Node,
        mut sink: Option<&mut Vec<KilnError>>,
    ) -> Result<Node, KilnError> {
        let ctx = DiagnosticContext::new(self.source.clone(), "transform");
        self.expand_node(&ctx, &mut form, &mut sink)?;
        Ok(form)
    }

    fn expand_node(
        &self,
        ctx: &DiagnosticContext,
        node: &mut Node,
        sink: &mut Option<&mut Vec<KilnError>>,
    ) -> Result<(), KilnError> {
        if let NodeKind::Quote(body) = &mut node.kind {
            return self.expand_holes(ctx, body, sink);
        }
        let expander = match &node.kind {
            NodeKind::FunctionalCall { name, .. } | NodeKind::Local(name) => self.inline.lookup(name),
            NodeKind::MacroDefinition { .. } => return Ok(()),
            _ => None,
        };

        if let Some(expander) = expander {
            let call = match &node.kind {
                NodeKind::Local(name) => Node::functional_call(name.clone(), Vec::new(), None, node.span),
                _ => node.clone(),
            };
            match expander(ctx, &call) {
                Ok(expanded) => {
                    trace!(name = call.call_name().unwrap_or(""), "inline expansion");
                    *node = expanded;
                    if matches!(node.kind, NodeKind::MacroDefinition { .. }) {
                        return Ok(());
                    }
                }
                Err(error) => match sink {
                    Some(errors) => {
                        *node = Node::new(NodeKind::Error(error.to_string()), node.span);
                        errors.push(error);
                        return Ok(());
                    }
                    None => return Err(error),
                },
            }
        }

        for child in node.children_mut() {
            self.expand_node(ctx, child, sink)?;
        }
        Ok(())
    }

    /// Expands inline macros inside the holes of a quoted body only.
    fn expand_holes(
        &self,
        ctx: &DiagnosticContext,
        node: &mut Node,
        sink: &mut Option<&mut Vec<KilnError>>,
    ) -> Result<(), KilnError> {
        match &mut node.kind {
            NodeKind::Unquote(inner) => self.expand_node(ctx, inner, sink),
            NodeKind::Quote(_) => Ok(()),
            _ => {
                for child in node.children_mut() {
                    self.expand_holes(ctx, child, sink)?;
                }
                Ok(())
            }
        }
    }

    fn unit_taken(&self, fqn: &str) -> bool {
        self.loader.contains_unit(fqn)
            || self
                .types
                .descriptors()
                .any(|d| d.macros.iter().any(|record| record.unit == fqn))
    }

    /// Context for errors raised against the current source.
    pub(crate) fn diagnostics(&self, phase: &str) -> DiagnosticContext {
        DiagnosticContext::new(self.source.clone(), phase)
    }
}

impl Transformer for Session {
    fn transform(&mut self, form: Node) -> Result<Node, KilnError> {
        self.expand_inline(form, None)
    }

    fn eval(&mut self, code: &str, label: &str, bindings: Vec<Node>) -> Result<Node, KilnError> {
        let source = SourceContext::from_file(label, code);
        let anchor = self.sites.last().copied();
        trace!(label, bindings = bindings.len(), "evaluating template");

        let parsed = self.templates.inject_values(bindings, || {
            parse_with(
                code,
                &source,
                ParseOptions {
                    templates: Some(&self.templates),
                    anchor,
                },
            )
        });
        let parsed = parsed.map_err(|error| match anchor {
            Some(span) => error.reanchor(span, &self.source),
            None => error,
        })?;
        let node = collapse(parsed);
        self.transform(node)
    }

    /// Skips names whose unit is loaded, on the classpath or recorded in a
    /// known descriptor.
    fn fresh_name(&mut self, template: &str) -> String {
        loop {
            self.counter += 1;
            let name = format!("{}{}", template, self.counter);
            if !self.unit_taken(&format!("{}.{}", self.config.package, name)) {
                return name;
            }
            trace!(name = %name, "extension name taken");
        }
    }

    fn destination(&self) -> Option<&Path> {
        self.config.destination.as_deref()
    }

    fn verbose(&self) -> bool {
        self.config.verbose
    }
}

