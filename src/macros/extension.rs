//! Extension unit synthesis.
//!
//! A macro is compiled as a standalone class deriving from `MacroExtension`:
//!
//! ```text
//! class <fqn> < MacroExtension
//!   def initialize(mirah:Compiler, call:Node)
//!     @mirah = mirah
//!     @call = call
//!   end
//!   def expand:Node
//!     _expand(@call.argument(0), @call.argument_or(1, quote { default }), @call.block)
//!   end
//!   def _expand(a:Node, b:Node, blk:Block):Node
//!     <macro body>
//!   end
//! end
//! ```
//!
//! The unit is built directly as a tree; nodes created here take the span of
//! the macro definition, while the body keeps its own.

use crate::ast::{MethodDef, Node, NodeKind, Param, Span};
use crate::macros::{ArgumentSpec, MacroSpec};
use crate::types::MACRO_EXTENSION;

/// Name of the method holding the authored body.
pub const BODY_METHOD: &str = "_expand";

/// Name of the entry point the loader invokes.
pub const ENTRY_METHOD: &str = "expand";

pub fn synthesize(fqn: &str, spec: &MacroSpec, span: Span) -> Node {
    let members = vec![constructor(span), entry_method(spec, span), body_method(spec)];
    Node::new(
        NodeKind::ClassDefinition {
            name: fqn.to_string(),
            superclass: Some(MACRO_EXTENSION.to_string()),
            body: Box::new(Node::body(members, span)),
        },
        span,
    )
}

fn method(name: &str, params: Vec<Param>, returns: Option<&str>, body: Node, span: Span) -> Node {
    Node::new(
        NodeKind::MethodDefinition(Box::new(MethodDef {
            name: name.to_string(),
            params,
            returns: returns.map(str::to_string),
            body,
        })),
        span,
    )
}

fn constructor(span: Span) -> Node {
    let assign = |field: &str| {
        Node::new(
            NodeKind::FieldAssign {
                name: field.to_string(),
                value: Box::new(Node::local(field, span)),
            },
            span,
        )
    };
    method(
        "initialize",
        vec![
            Param::named("mirah", Some("Compiler")),
            Param::named("call", Some("Node")),
        ],
        None,
        Node::body(vec![assign("mirah"), assign("call")], span),
        span,
    )
}

/// `expand` pulls each argument out of the call and forwards it to the body.
fn entry_method(spec: &MacroSpec, span: Span) -> Node {
    let call = || Node::field("call", span);
    let mut position = 0i64;
    let forwarded = spec
        .arguments
        .iter()
        .map(|argument| match argument {
            ArgumentSpec::Required(_) => {
                let index = Node::fixnum(position, span);
                position += 1;
                Node::call(call(), "argument", vec![index], None, span)
            }
            ArgumentSpec::Optional(_, default) => {
                let index = Node::fixnum(position, span);
                position += 1;
                let default = Node::new(NodeKind::Quote(Box::new(default.clone())), span);
                Node::call(call(), "argument_or", vec![index, default], None, span)
            }
            ArgumentSpec::Block(..) => Node::call(call(), "block", Vec::new(), None, span),
        })
        .collect();

    let body = Node::functional_call(BODY_METHOD, forwarded, None, span);
    method(ENTRY_METHOD, Vec::new(), Some("Node"), Node::body(vec![body], span), span)
}

fn body_method(spec: &MacroSpec) -> Node {
    let params = spec
        .arguments
        .iter()
        .map(|argument| {
            let type_name = if argument.is_block() { "Block" } else { "Node" };
            Param::named(argument.name(), Some(type_name))
        })
        .collect();
    method(BODY_METHOD, params, Some("Node"), spec.body.clone(), spec.body.span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::printer::print;

    #[test]
    fn unit_forwards_arguments_by_position() {
        let span = Span::new(0, 10);
        let spec = MacroSpec {
            name: "each".into(),
            arguments: vec![
                ArgumentSpec::Required("list".into()),
                ArgumentSpec::Optional("sep".into(), Node::string(", ", span)),
                ArgumentSpec::Block("blk".into(), true),
            ],
            body: Node::body(vec![Node::local("list", span)], span),
        };
        let text = print(&synthesize("kiln.macros.Script$Extension1", &spec, span));

        assert!(text.starts_with("class kiln.macros.Script$Extension1 < MacroExtension"));
        assert!(text.contains("def initialize(mirah:Compiler, call:Node)"));
        assert!(text.contains(
            "_expand(@call.argument(0), @call.argument_or(1, quote {"
        ));
        assert!(text.contains("@call.block)"));
        assert!(text.contains("def _expand(list:Node, sep:Node, blk:Block):Node"));
    }
}
