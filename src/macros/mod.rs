//! Macro definitions, compiled macro handles and per-type macro tables.
//!
//! # Macro Types
//! - **Inline expanders**: native callbacks bound by name (see [`builtins`]).
//!   They implement the definition syntax itself and the output shorthands.
//! - **Compiled macros**: user macros built into an extension unit, loaded
//!   back into the process and invoked through a [`MacroHandle`].
//!
//! # Lifecycle
//! Definition syntax becomes a [`MacroSpec`]. The [`orchestrator`] turns the
//! spec into an extension unit ([`extension`]), compiles and loads it, then
//! registers the handle in the owner type's [`MacroTable`] and records it in
//! the type's descriptor ([`metadata`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::ast::Node;
use crate::compiler::Transformer;
use crate::errors::KilnError;
use crate::types::TypeRef;

pub mod builtins;
pub mod extension;
pub mod metadata;
pub mod orchestrator;

pub use builtins::{InlineExpander, InlineRegistry};
pub use metadata::{MacroRecord, MacroSignature, ParamKind, TypeDescriptor};
pub use orchestrator::{MacroDefinitions, MacroOrchestrator, MacroState};

// ============================================================================
// MACRO SPECS
// ============================================================================

/// Index of a macro definition within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacroDefId(pub usize);

/// One declared macro parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgumentSpec {
    Required(String),
    /// Name and the default used when the call site omits the argument.
    Optional(String, Node),
    /// Name and whether the block may be omitted.
    Block(String, bool),
}

impl ArgumentSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Required(name) | Self::Optional(name, _) | Self::Block(name, _) => name,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block(..))
    }

    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Required(_) => ParamKind::Required,
            Self::Optional(..) => ParamKind::Optional,
            Self::Block(..) => ParamKind::Block,
        }
    }
}

/// A macro's name, parameters and authored body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSpec {
    pub name: String,
    pub arguments: Vec<ArgumentSpec>,
    pub body: Node,
}

impl MacroSpec {
    /// True when the last argument is a block the call site may omit.
    pub fn has_optional_block(&self) -> bool {
        matches!(self.arguments.last(), Some(ArgumentSpec::Block(_, true)))
    }

    /// Parameter types of the compiled macro. Block arguments take a block;
    /// every other argument is an untyped node.
    pub fn argument_types(&self) -> Vec<TypeRef> {
        self.arguments
            .iter()
            .map(|a| if a.is_block() { TypeRef::Block } else { TypeRef::Any })
            .collect()
    }

    pub fn signature(&self) -> MacroSignature {
        MacroSignature::new(self.arguments.iter().map(ArgumentSpec::kind).collect())
    }
}

// ============================================================================
// COMPILED MACROS
// ============================================================================

/// A loaded extension unit that expands call sites.
pub trait MacroHandle: Send + Sync + fmt::Debug {
    /// Fully-qualified name of the unit implementing the macro.
    fn unit_name(&self) -> &str;

    /// Expands `call` into its replacement node.
    fn expand(&self, transformer: &mut dyn Transformer, call: &Node) -> Result<Node, KilnError>;
}

/// How an entry came to be in a macro table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Macro,
    /// The without-block registration of a macro whose block is optional.
    BlocklessOverload,
}

/// One callable entry of a macro table.
#[derive(Debug, Clone)]
pub struct MacroEntry {
    pub name: String,
    pub signature: MacroSignature,
    pub argument_types: Vec<TypeRef>,
    pub handle: Arc<dyn MacroHandle>,
    pub kind: EntryKind,
}

impl MacroEntry {
    /// Whether a call with `argc` positional arguments and the given
    /// block-ness can use this entry.
    pub fn accepts(&self, argc: usize, has_block: bool) -> bool {
        self.signature.has_block() == has_block
            && self.signature.required() <= argc
            && argc <= self.signature.positional()
    }
}

/// Macro entries registered on one owner type.
///
/// Append-only within a session. Registering an entry with the same name and
/// signature as an existing one replaces its handle, so re-registration is
/// idempotent.
#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    entries: Vec<MacroEntry>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entry`, returning `false` if it replaced an existing one.
    pub fn add(&mut self, entry: MacroEntry) -> bool {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.name == entry.name && e.signature == entry.signature)
        {
            *existing = entry;
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// The entry a call `name(argc args)` with or without a block resolves to.
    pub fn resolve(&self, name: &str, argc: usize, has_block: bool) -> Option<&MacroEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name && e.accepts(argc, has_block))
    }

    pub fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MacroEntry> + 'a {
        self.entries.iter().filter(move |e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MacroEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    #[derive(Debug)]
    struct Fixed(&'static str);

    impl MacroHandle for Fixed {
        fn unit_name(&self) -> &str {
            self.0
        }

        fn expand(&self, _: &mut dyn Transformer, call: &Node) -> Result<Node, KilnError> {
            Ok(Node::string(self.0, call.span))
        }
    }

    fn entry(name: &str, params: Vec<ParamKind>, unit: &'static str) -> MacroEntry {
        let signature = MacroSignature::new(params);
        MacroEntry {
            name: name.into(),
            argument_types: signature.argument_types(),
            signature,
            handle: Arc::new(Fixed(unit)),
            kind: EntryKind::Macro,
        }
    }

    #[test]
    fn resolution_respects_arity_and_block() {
        let mut table = MacroTable::new();
        table.add(entry(
            "each",
            vec![ParamKind::Required, ParamKind::Optional, ParamKind::Block],
            "with_block",
        ));
        table.add(entry("each", vec![ParamKind::Required, ParamKind::Optional], "without"));

        assert_eq!(table.resolve("each", 1, true).unwrap().handle.unit_name(), "with_block");
        assert_eq!(table.resolve("each", 2, false).unwrap().handle.unit_name(), "without");
        assert!(table.resolve("each", 0, false).is_none());
        assert!(table.resolve("each", 3, true).is_none());
    }

    #[test]
    fn same_signature_replaces() {
        let mut table = MacroTable::new();
        assert!(table.add(entry("m", vec![ParamKind::Required], "first")));
        assert!(!table.add(entry("m", vec![ParamKind::Required], "second")));
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("m", 1, false).unwrap().handle.unit_name(), "second");
    }

    #[test]
    fn spec_argument_types_are_universal_except_blocks() {
        let spec = MacroSpec {
            name: "m".into(),
            arguments: vec![
                ArgumentSpec::Required("a".into()),
                ArgumentSpec::Optional("b".into(), Node::nil(Span::default())),
                ArgumentSpec::Block("blk".into(), true),
            ],
            body: Node::nil(Span::default()),
        };
        assert_eq!(
            spec.argument_types(),
            vec![TypeRef::Any, TypeRef::Any, TypeRef::Block]
        );
        assert!(spec.has_optional_block());
        assert_eq!(spec.signature().encode(), "(ROB)N");
    }
}
