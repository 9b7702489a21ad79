//! Abstract syntax tree for Kiln programs.
//!
//! Nodes carry a byte [`Span`] into the source they came from. Structural
//! equality ignores spans, so a template expanded at a call site compares equal
//! to the same fragment parsed from text.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::macros::{MacroDefId, MacroSpec};

pub mod printer;

/// Represents a span in the source code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A positioned AST node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

/// The node variants of the surface language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Fixnum(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Nil,
    SelfRef,
    /// Bare identifier: a local variable, or a zero-argument call on self.
    Local(String),
    LocalAssign {
        name: String,
        value: Box<Node>,
    },
    Field(String),
    FieldAssign {
        name: String,
        value: Box<Node>,
    },
    Constant(String),
    Call {
        target: Box<Node>,
        name: String,
        args: Vec<Node>,
        block: Option<Box<Node>>,
    },
    FunctionalCall {
        name: String,
        args: Vec<Node>,
        block: Option<Box<Node>>,
    },
    If {
        condition: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Option<Box<Node>>,
    },
    Body(Vec<Node>),
    Block {
        params: Vec<String>,
        body: Box<Node>,
        brace: bool,
    },
    /// `&name` or `&name = nil` in a macro's call-style argument list.
    BlockArgument {
        name: String,
        optional: bool,
    },
    ClassDefinition {
        name: String,
        superclass: Option<String>,
        body: Box<Node>,
    },
    MethodDefinition(Box<MethodDef>),
    /// Placeholder for a macro definition until the orchestrator commits it.
    MacroDefinition {
        spec: Box<MacroSpec>,
        id: Option<MacroDefId>,
    },
    Quote(Box<Node>),
    Unquote(Box<Node>),
    Noop,
    /// Marker left where a definition failed.
    Error(String),
}

/// A method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: Option<String>,
    pub body: Node,
}

/// One parameter of a method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub type_name: Option<String>,
    pub default: Option<Node>,
    pub block: bool,
}

impl Param {
    pub fn named(name: impl Into<String>, type_name: Option<&str>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.map(str::to_string),
            default: None,
            block: false,
        }
    }
}

impl Node {
    pub fn new(kind: NodeKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn nil(span: Span) -> Self {
        Self::new(NodeKind::Nil, span)
    }

    pub fn noop(span: Span) -> Self {
        Self::new(NodeKind::Noop, span)
    }

    pub fn string(value: impl Into<String>, span: Span) -> Self {
        Self::new(NodeKind::Str(value.into()), span)
    }

    pub fn fixnum(value: i64, span: Span) -> Self {
        Self::new(NodeKind::Fixnum(value), span)
    }

    pub fn local(name: impl Into<String>, span: Span) -> Self {
        Self::new(NodeKind::Local(name.into()), span)
    }

    pub fn field(name: impl Into<String>, span: Span) -> Self {
        Self::new(NodeKind::Field(name.into()), span)
    }

    pub fn constant(name: impl Into<String>, span: Span) -> Self {
        Self::new(NodeKind::Constant(name.into()), span)
    }

    pub fn body(statements: Vec<Node>, span: Span) -> Self {
        Self::new(NodeKind::Body(statements), span)
    }

    pub fn call(
        target: Node,
        name: impl Into<String>,
        args: Vec<Node>,
        block: Option<Node>,
        span: Span,
    ) -> Self {
        Self::new(
            NodeKind::Call {
                target: Box::new(target),
                name: name.into(),
                args,
                block: block.map(Box::new),
            },
            span,
        )
    }

    pub fn functional_call(
        name: impl Into<String>,
        args: Vec<Node>,
        block: Option<Node>,
        span: Span,
    ) -> Self {
        Self::new(
            NodeKind::FunctionalCall {
                name: name.into(),
                args,
                block: block.map(Box::new),
            },
            span,
        )
    }

    /// Name of a call node, if this is one.
    pub fn call_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Call { name, .. } | NodeKind::FunctionalCall { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Positional arguments of a call node; empty for anything else.
    pub fn call_args(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Call { args, .. } | NodeKind::FunctionalCall { args, .. } => args,
            _ => &[],
        }
    }

    /// Trailing block of a call node.
    pub fn call_block(&self) -> Option<&Node> {
        match &self.kind {
            NodeKind::Call { block, .. } | NodeKind::FunctionalCall { block, .. } => {
                block.as_deref()
            }
            _ => None,
        }
    }

    /// Statements of a body, or the node itself as a single statement.
    pub fn statements(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Body(items) => items,
            _ => std::slice::from_ref(self),
        }
    }

    /// Direct children, in source order.
    pub fn children_mut(&mut self) -> Vec<&mut Node> {
        match &mut self.kind {
            NodeKind::LocalAssign { value, .. } | NodeKind::FieldAssign { value, .. } => {
                vec![value.as_mut()]
            }
            NodeKind::Call {
                target,
                args,
                block,
                ..
            } => {
                let mut children = vec![target.as_mut()];
                children.extend(args.iter_mut());
                children.extend(block.as_deref_mut());
                children
            }
            NodeKind::FunctionalCall { args, block, .. } => {
                let mut children: Vec<&mut Node> = args.iter_mut().collect();
                children.extend(block.as_deref_mut());
                children
            }
            NodeKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let mut children = vec![condition.as_mut(), then_branch.as_mut()];
                children.extend(else_branch.as_deref_mut());
                children
            }
            NodeKind::Body(items) => items.iter_mut().collect(),
            NodeKind::Block { body, .. } | NodeKind::ClassDefinition { body, .. } => {
                vec![body.as_mut()]
            }
            NodeKind::MethodDefinition(method) => {
                let MethodDef { params, body, .. } = method.as_mut();
                let mut children: Vec<&mut Node> =
                    params.iter_mut().filter_map(|p| p.default.as_mut()).collect();
                children.push(body);
                children
            }
            NodeKind::Quote(inner) | NodeKind::Unquote(inner) => vec![inner.as_mut()],
            _ => Vec::new(),
        }
    }

    /// Short description of the node variant, for diagnostics.
    pub fn describe(&self) -> &'static str {
        match &self.kind {
            NodeKind::Fixnum(_) => "integer literal",
            NodeKind::Float(_) => "float literal",
            NodeKind::Str(_) => "string literal",
            NodeKind::Bool(_) => "boolean literal",
            NodeKind::Nil => "nil",
            NodeKind::SelfRef => "self",
            NodeKind::Local(_) => "identifier",
            NodeKind::LocalAssign { .. } => "local assignment",
            NodeKind::Field(_) => "field",
            NodeKind::FieldAssign { .. } => "field assignment",
            NodeKind::Constant(_) => "constant",
            NodeKind::Call { .. } => "method call",
            NodeKind::FunctionalCall { .. } => "call",
            NodeKind::If { .. } => "conditional",
            NodeKind::Body(_) => "body",
            NodeKind::Block { .. } => "block",
            NodeKind::BlockArgument { .. } => "block argument",
            NodeKind::ClassDefinition { .. } => "class definition",
            NodeKind::MethodDefinition(_) => "method definition",
            NodeKind::MacroDefinition { .. } => "macro definition",
            NodeKind::Quote(_) => "quote",
            NodeKind::Unquote(_) => "unquote",
            NodeKind::Noop => "no-op",
            NodeKind::Error(_) => "error marker",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&printer::print(self))
    }
}
