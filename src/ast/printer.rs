//! Renders nodes back to program text the parser accepts.
//!
//! In template mode every unquoted hole of the outermost quote is captured into
//! the active extraction scope and printed as an ordinal placeholder
//! (`` `$0` ``), so the text can cross a compile boundary and be re-parsed with
//! the captured values injected back.

use crate::ast::{MethodDef, Node, NodeKind, Param};
use crate::macros::{ArgumentSpec, MacroSpec};
use crate::template::{TemplateEngine, TemplateError};

/// Method names printed in infix position.
pub const BINARY_OPERATORS: &[&str] = &[
    "||", "&&", "==", "!=", "<", "<=", ">", ">=", "<<", "+", "-", "*", "/", "%",
];

/// Prints a node as source text.
pub fn print(node: &Node) -> String {
    let mut printer = Printer::new(None);
    // Without a template engine holes print verbatim and never fail.
    let _ = printer.top_level(node);
    printer.out
}

/// Prints the body of a template, capturing each hole into the innermost
/// extraction scope of `templates`.
pub fn print_template(node: &Node, templates: &TemplateEngine<Node>) -> Result<String, TemplateError> {
    let mut printer = Printer::new(Some(templates));
    printer.top_level(node)?;
    Ok(printer.out)
}

struct Printer<'a> {
    out: String,
    indent: usize,
    holes: Option<&'a TemplateEngine<Node>>,
    quote_depth: usize,
}

type Printed = Result<(), TemplateError>;

impl<'a> Printer<'a> {
    fn new(holes: Option<&'a TemplateEngine<Node>>) -> Self {
        Self {
            out: String::new(),
            indent: 0,
            holes,
            quote_depth: 0,
        }
    }

    fn top_level(&mut self, node: &Node) -> Printed {
        let mut first = true;
        for statement in node.statements() {
            if matches!(statement.kind, NodeKind::Noop) {
                continue;
            }
            if !first {
                self.newline();
            }
            first = false;
            self.expr(statement)?;
        }
        Ok(())
    }

    fn write(&mut self, text: &str) {
        self.out.push_str(text);
    }

    fn newline(&mut self) {
        self.out.push('\n');
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
    }

    /// Indented statement list followed by a closing keyword on its own line.
    fn block_body(&mut self, body: &Node, close: &str) -> Printed {
        self.indent += 1;
        for statement in body.statements() {
            if matches!(statement.kind, NodeKind::Noop) {
                continue;
            }
            self.newline();
            self.expr(statement)?;
        }
        self.indent -= 1;
        self.newline();
        self.write(close);
        Ok(())
    }

    fn list(&mut self, items: &[Node]) -> Printed {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.expr(item)?;
        }
        Ok(())
    }

    /// Operand position: compound expressions get parentheses.
    fn operand(&mut self, node: &Node) -> Printed {
        match &node.kind {
            NodeKind::If { .. } | NodeKind::Body(_) | NodeKind::LocalAssign { .. } => {
                self.write("(");
                self.expr(node)?;
                self.write(")");
                Ok(())
            }
            _ => self.expr(node),
        }
    }

    fn expr(&mut self, node: &Node) -> Printed {
        match &node.kind {
            NodeKind::Fixnum(value) => self.write(&value.to_string()),
            NodeKind::Float(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    self.write(&format!("{:.1}", value))
                } else {
                    self.write(&value.to_string())
                }
            }
            NodeKind::Str(value) => self.write(&quote_string(value)),
            NodeKind::Bool(value) => self.write(if *value { "true" } else { "false" }),
            NodeKind::Nil => self.write("nil"),
            NodeKind::SelfRef => self.write("self"),
            NodeKind::Local(name) => self.write(name),
            NodeKind::LocalAssign { name, value } => {
                self.write(name);
                self.write(" = ");
                self.expr(value)?;
            }
            NodeKind::Field(name) => {
                self.write("@");
                self.write(name);
            }
            NodeKind::FieldAssign { name, value } => {
                self.write("@");
                self.write(name);
                self.write(" = ");
                self.expr(value)?;
            }
            NodeKind::Constant(name) => self.write(name),
            NodeKind::Call {
                target,
                name,
                args,
                block,
            } => self.call(target, name, args, block.as_deref())?,
            NodeKind::FunctionalCall { name, args, block } => {
                self.write(name);
                self.write("(");
                self.list(args)?;
                self.write(")");
                if let Some(block) = block {
                    self.block(block)?;
                }
            }
            NodeKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.write("if ");
                self.expr(condition)?;
                match else_branch {
                    Some(else_branch) => {
                        self.block_body(then_branch, "else")?;
                        self.block_body(else_branch, "end")?;
                    }
                    None => self.block_body(then_branch, "end")?,
                }
            }
            NodeKind::Body(items) => {
                self.write("(");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.write("; ");
                    }
                    self.expr(item)?;
                }
                self.write(")");
            }
            NodeKind::Block { .. } => self.block(node)?,
            NodeKind::BlockArgument { name, optional } => {
                self.write("&");
                self.write(name);
                if *optional {
                    self.write(" = nil");
                }
            }
            NodeKind::ClassDefinition {
                name,
                superclass,
                body,
            } => {
                self.write("class ");
                self.write(name);
                if let Some(superclass) = superclass {
                    self.write(" < ");
                    self.write(superclass);
                }
                self.block_body(body, "end")?;
            }
            NodeKind::MethodDefinition(method) => self.method(method)?,
            NodeKind::MacroDefinition { spec, .. } => self.macro_definition(spec)?,
            NodeKind::Quote(body) => {
                self.quote_depth += 1;
                self.write("quote {");
                let printed = self.block_body(body, "}");
                self.quote_depth -= 1;
                printed?;
            }
            NodeKind::Unquote(value) => self.hole(value)?,
            NodeKind::Noop => {}
            NodeKind::Error(message) => {
                self.write("# error: ");
                self.write(message);
            }
        }
        Ok(())
    }

    fn call(&mut self, target: &Node, name: &str, args: &[Node], block: Option<&Node>) -> Printed {
        if block.is_none() && args.len() == 1 && BINARY_OPERATORS.contains(&name) {
            self.write("(");
            self.operand(target)?;
            self.write(" ");
            self.write(name);
            self.write(" ");
            self.operand(&args[0])?;
            self.write(")");
            return Ok(());
        }
        if block.is_none() && args.is_empty() && (name == "!" || name == "-@") {
            self.write(if name == "!" { "!(" } else { "-(" });
            self.expr(target)?;
            self.write(")");
            return Ok(());
        }
        self.operand(target)?;
        self.write(".");
        self.write(name);
        if !args.is_empty() {
            self.write("(");
            self.list(args)?;
            self.write(")");
        }
        if let Some(block) = block {
            self.block(block)?;
        }
        Ok(())
    }

    fn block(&mut self, block: &Node) -> Printed {
        let (params, body, brace) = match &block.kind {
            NodeKind::Block {
                params,
                body,
                brace,
            } => (params.as_slice(), body.as_ref(), *brace),
            _ => (&[][..], block, true),
        };
        self.write(if brace { " {" } else { " do" });
        if !params.is_empty() {
            self.write(" |");
            self.write(&params.join(", "));
            self.write("|");
        }
        self.block_body(body, if brace { "}" } else { "end" })
    }

    fn method(&mut self, method: &MethodDef) -> Printed {
        self.write("def ");
        self.write(&method.name);
        if !method.params.is_empty() {
            self.write("(");
            for (i, param) in method.params.iter().enumerate() {
                if i > 0 {
                    self.write(", ");
                }
                self.param(param)?;
            }
            self.write(")");
        }
        if let Some(returns) = &method.returns {
            self.write(":");
            self.write(returns);
        }
        self.block_body(&method.body, "end")
    }

    fn param(&mut self, param: &Param) -> Printed {
        if param.block {
            self.write("&");
        }
        self.write(&param.name);
        if let Some(type_name) = &param.type_name {
            self.write(":");
            self.write(type_name);
        }
        if let Some(default) = &param.default {
            self.write(" = ");
            self.expr(default)?;
        }
        Ok(())
    }

    fn macro_definition(&mut self, spec: &MacroSpec) -> Printed {
        self.write("macro ");
        self.write(&spec.name);
        self.write("(");
        for (i, argument) in spec.arguments.iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            match argument {
                ArgumentSpec::Required(name) => self.write(name),
                ArgumentSpec::Optional(name, default) => {
                    self.write(name);
                    self.write(" = ");
                    self.expr(default)?;
                }
                ArgumentSpec::Block(name, optional) => {
                    self.write("&");
                    self.write(name);
                    if *optional {
                        self.write(" = nil");
                    }
                }
            }
        }
        self.write(") do");
        self.block_body(&spec.body, "end")
    }

    fn hole(&mut self, value: &Node) -> Printed {
        match self.holes {
            Some(templates) if self.quote_depth == 0 => {
                let ordinal = templates.capture(value.clone())?;
                self.write(&format!("`${}`", ordinal));
            }
            _ => {
                self.write("`");
                self.expr(value)?;
                self.write("`");
            }
        }
        Ok(())
    }
}

fn quote_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn sp() -> Span {
        Span::default()
    }

    #[test]
    fn binary_calls_print_infix() {
        let node = Node::call(
            Node::local("a", sp()),
            ">",
            vec![Node::local("b", sp())],
            None,
            sp(),
        );
        assert_eq!(print(&node), "(a > b)");
    }

    #[test]
    fn strings_are_escaped() {
        let node = Node::string("say \"hi\"\n", sp());
        assert_eq!(print(&node), "\"say \\\"hi\\\"\\n\"");
    }

    #[test]
    fn template_mode_replaces_holes_with_ordinals() {
        let templates = TemplateEngine::new();
        let body = Node::call(
            Node::new(NodeKind::Unquote(Box::new(Node::local("a", sp()))), sp()),
            "+",
            vec![Node::new(
                NodeKind::Unquote(Box::new(Node::local("b", sp()))),
                sp(),
            )],
            None,
            sp(),
        );
        let (text, captured) = templates.extract_values(|| print_template(&body, &templates));
        assert_eq!(text.unwrap(), "(`$0` + `$1`)");
        assert_eq!(captured, vec![Node::local("a", sp()), Node::local("b", sp())]);
    }

    #[test]
    fn nested_quotes_keep_their_holes() {
        let templates = TemplateEngine::new();
        let inner = Node::new(
            NodeKind::Quote(Box::new(Node::new(
                NodeKind::Unquote(Box::new(Node::local("x", sp()))),
                sp(),
            ))),
            sp(),
        );
        let (text, captured) = templates.extract_values(|| print_template(&inner, &templates));
        assert_eq!(text.unwrap(), "quote {\n  `x`\n}");
        assert!(captured.is_empty());
    }
}
