//! Bootstrap macros.
//!
//! Inline expanders are native callbacks that rewrite a call node in place,
//! without building an extension unit. They provide the macro definition
//! syntax itself (`macro`, `defmacro`) and the output shorthands (`puts`,
//! `print`).
//!
//! # Definition syntaxes
//! ```text
//! macro name(a, b = default, &blk = nil) do
//!   body
//! end
//!
//! macro def name(a, b = default, &blk); body; end
//! ```
//! The `def` form also accepts operator names, but not an optional block.

use std::collections::HashMap;

use crate::ast::{MethodDef, Node, NodeKind, Param};
use crate::errors::{to_source_span, DiagnosticContext, ErrorKind, ErrorReporting, KilnError};
use crate::macros::{ArgumentSpec, MacroSpec};

/// A native macro: rewrites `call` into its replacement.
pub type InlineExpander = fn(&DiagnosticContext, &Node) -> Result<Node, KilnError>;

/// Inline expanders by name.
#[derive(Debug, Clone, Default)]
pub struct InlineRegistry {
    expanders: HashMap<String, InlineExpander>,
}

impl InlineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bootstrap macros installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        registry
    }

    /// Registers `expander` under `name`, returning the one it replaced.
    pub fn register(&mut self, name: &str, expander: InlineExpander) -> Option<InlineExpander> {
        self.expanders.insert(name.to_string(), expander)
    }

    pub fn lookup(&self, name: &str) -> Option<InlineExpander> {
        self.expanders.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.expanders.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.expanders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expanders.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.expanders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Installs `macro`, `defmacro`, `puts` and `print`.
pub fn register_builtins(registry: &mut InlineRegistry) {
    registry.register("macro", expand_definition);
    registry.register("defmacro", expand_definition);
    registry.register("puts", expand_puts);
    registry.register("print", expand_print);
}

// ============================================================================
// DEFINITION SYNTAX
// ============================================================================

fn definition_error(ctx: &DiagnosticContext, name: &str, reason: &str, node: &Node) -> KilnError {
    ctx.invalid_definition(name, reason, to_source_span(node.span))
}

/// `macro name(args) do ... end` and `macro def name(args) ... end`.
fn expand_definition(ctx: &DiagnosticContext, call: &Node) -> Result<Node, KilnError> {
    let keyword = call.call_name().unwrap_or("macro");
    let signature = match call.call_args() {
        [signature] => signature,
        [] => return Err(definition_error(ctx, keyword, "missing macro name", call)),
        _ => {
            return Err(definition_error(
                ctx,
                keyword,
                "expected a single macro signature",
                call,
            ))
        }
    };

    let spec = match &signature.kind {
        NodeKind::MethodDefinition(method) => {
            if call.call_block().is_some() {
                return Err(definition_error(
                    ctx,
                    &method.name,
                    "def syntax takes its body between def and end",
                    call,
                ));
            }
            from_def_syntax(ctx, method, call)?
        }
        NodeKind::FunctionalCall { name, args, block } => {
            if block.is_some() {
                return Err(definition_error(ctx, name, "unexpected block on the macro signature", call));
            }
            from_call_syntax(ctx, name, args, call)?
        }
        NodeKind::Local(name) => from_call_syntax(ctx, name, &[], call)?,
        _ => {
            return Err(definition_error(
                ctx,
                keyword,
                &format!("expected a macro signature, found {}", signature.describe()),
                signature,
            ))
        }
    };

    validate_arguments(ctx, &spec, call)?;
    Ok(Node::new(
        NodeKind::MacroDefinition {
            spec: Box::new(spec),
            id: None,
        },
        call.span,
    ))
}

fn from_call_syntax(
    ctx: &DiagnosticContext,
    name: &str,
    args: &[Node],
    call: &Node,
) -> Result<MacroSpec, KilnError> {
    let arguments = args
        .iter()
        .map(|arg| match &arg.kind {
            NodeKind::Local(arg_name) => Ok(ArgumentSpec::Required(arg_name.clone())),
            NodeKind::LocalAssign { name: arg_name, value } => {
                Ok(ArgumentSpec::Optional(arg_name.clone(), (**value).clone()))
            }
            NodeKind::BlockArgument {
                name: arg_name,
                optional,
            } => Ok(ArgumentSpec::Block(arg_name.clone(), *optional)),
            _ => Err(definition_error(
                ctx,
                name,
                &format!("unsupported argument {}", arg.describe()),
                arg,
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let body = match call.call_block().map(|b| &b.kind) {
        Some(NodeKind::Block { params, body, .. }) => {
            if !params.is_empty() {
                return Err(definition_error(
                    ctx,
                    name,
                    "macro bodies take no block parameters",
                    call,
                ));
            }
            (**body).clone()
        }
        _ => return Err(definition_error(ctx, name, "missing macro body", call)),
    };

    Ok(MacroSpec {
        name: name.to_string(),
        arguments,
        body,
    })
}

fn from_def_syntax(ctx: &DiagnosticContext, method: &MethodDef, call: &Node) -> Result<MacroSpec, KilnError> {
    let arguments = method
        .params
        .iter()
        .map(|param| def_argument(ctx, &method.name, param, call))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MacroSpec {
        name: method.name.clone(),
        arguments,
        body: method.body.clone(),
    })
}

fn def_argument(
    ctx: &DiagnosticContext,
    macro_name: &str,
    param: &Param,
    call: &Node,
) -> Result<ArgumentSpec, KilnError> {
    // Declared parameter types are not enforced; every argument is a node.
    match (&param.default, param.block) {
        (Some(_), true) => Err(definition_error(
            ctx,
            macro_name,
            "optional block arguments are not supported in def syntax",
            call,
        )),
        (None, true) => Ok(ArgumentSpec::Block(param.name.clone(), false)),
        (Some(default), false) => Ok(ArgumentSpec::Optional(param.name.clone(), default.clone())),
        (None, false) => Ok(ArgumentSpec::Required(param.name.clone())),
    }
}

fn validate_arguments(ctx: &DiagnosticContext, spec: &MacroSpec, call: &Node) -> Result<(), KilnError> {
    let fail = |reason: String| Err(definition_error(ctx, &spec.name, &reason, call));

    if spec.body.statements().is_empty() {
        return fail("missing macro body".into());
    }

    let mut seen_optional = false;
    for (index, argument) in spec.arguments.iter().enumerate() {
        let earlier = &spec.arguments[..index];
        if earlier.iter().any(|a| a.name() == argument.name()) {
            return fail(format!("duplicate argument '{}'", argument.name()));
        }
        match argument {
            ArgumentSpec::Block(name, _) if index + 1 != spec.arguments.len() => {
                return fail(format!("block argument '&{}' must come last", name));
            }
            ArgumentSpec::Required(name) if seen_optional => {
                return fail(format!(
                    "required argument '{}' follows an optional argument",
                    name
                ));
            }
            ArgumentSpec::Optional(..) => seen_optional = true,
            _ => {}
        }
    }
    Ok(())
}

// ============================================================================
// OUTPUT SHORTHANDS
// ============================================================================

fn expand_puts(ctx: &DiagnosticContext, call: &Node) -> Result<Node, KilnError> {
    expand_output(ctx, call, "println")
}

fn expand_print(ctx: &DiagnosticContext, call: &Node) -> Result<Node, KilnError> {
    expand_output(ctx, call, "print")
}

/// `puts(args)` becomes `System.out.println(args)`.
fn expand_output(ctx: &DiagnosticContext, call: &Node, method: &str) -> Result<Node, KilnError> {
    let name = call.call_name().unwrap_or(method);
    if call.call_block().is_some() {
        return Err(ctx.report(
            ErrorKind::ExpansionFailed {
                macro_name: name.to_string(),
                reason: "does not take a block".into(),
            },
            to_source_span(call.span),
        ));
    }
    let span = call.span;
    let stream = Node::call(Node::constant("System", span), "out", Vec::new(), None, span);
    Ok(Node::call(stream, method, call.call_args().to_vec(), None, span))
}
