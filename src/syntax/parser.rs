//! Kiln Parser
//!
//! Converts program text into [`Node`] trees with source location tracking.
//! The parser is purely syntactic. The only non-syntactic step is resolving
//! ordinal template placeholders (`` `$0` ``) through an injection scope when
//! one is supplied in [`ParseOptions`].

use crate::ast::{MethodDef, Node, NodeKind, Param, Span};
use crate::errors::{
    to_source_span, DiagnosticContext, ErrorKind, ErrorReporting, KilnError, SourceContext,
};
use crate::template::{TemplateEngine, TemplateError};
use pest::error::InputLocation;
use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "syntax/grammar.pest"]
struct KilnParser;

/// Options for parsing template text.
#[derive(Default, Clone, Copy)]
pub struct ParseOptions<'a> {
    /// Injection scopes used to resolve ordinal placeholders.
    pub templates: Option<&'a TemplateEngine<Node>>,
    /// When set, every node built from the text gets this span. Injected
    /// values keep their own.
    pub anchor: Option<Span>,
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Parse program text into a `Body` node.
pub fn parse(source_text: &str, source: &SourceContext) -> Result<Node, KilnError> {
    parse_with(source_text, source, ParseOptions::default())
}

/// Parse with template options. See [`ParseOptions`].
pub fn parse_with(
    source_text: &str,
    source: &SourceContext,
    options: ParseOptions<'_>,
) -> Result<Node, KilnError> {
    let builder = AstBuilder {
        ctx: DiagnosticContext::new(source.clone(), "parse"),
        options,
    };

    let mut pairs = KilnParser::parse(Rule::program, source_text)
        .map_err(|e| builder.convert_parse_error(e))?;

    let program = pairs
        .next()
        .ok_or_else(|| builder.ctx.syntax_error("empty parse tree", to_source_span(Span::default())))?;
    let span = builder.span(&program);
    match program.into_inner().find(|p| p.as_rule() == Rule::body) {
        Some(body) => builder.build(body),
        None => Ok(Node::body(Vec::new(), span)),
    }
}

/// Collapses a one-statement body to the statement itself.
pub fn collapse(node: Node) -> Node {
    match node.kind {
        NodeKind::Body(mut items) if items.len() == 1 => items.remove(0),
        kind => Node {
            kind,
            span: node.span,
        },
    }
}

// ============================================================================
// AST BUILDERS
// ============================================================================

struct AstBuilder<'a> {
    ctx: DiagnosticContext,
    options: ParseOptions<'a>,
}

fn pratt() -> PrattParser<Rule> {
    PrattParser::new()
        .op(Op::infix(Rule::op_or, Assoc::Left))
        .op(Op::infix(Rule::op_and, Assoc::Left))
        .op(Op::infix(Rule::op_eq, Assoc::Left) | Op::infix(Rule::op_ne, Assoc::Left))
        .op(Op::infix(Rule::op_lt, Assoc::Left)
            | Op::infix(Rule::op_le, Assoc::Left)
            | Op::infix(Rule::op_gt, Assoc::Left)
            | Op::infix(Rule::op_ge, Assoc::Left))
        .op(Op::infix(Rule::op_shl, Assoc::Left))
        .op(Op::infix(Rule::op_add, Assoc::Left) | Op::infix(Rule::op_sub, Assoc::Left))
        .op(Op::infix(Rule::op_mul, Assoc::Left)
            | Op::infix(Rule::op_div, Assoc::Left)
            | Op::infix(Rule::op_rem, Assoc::Left))
        .op(Op::prefix(Rule::op_not) | Op::prefix(Rule::op_neg))
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_if
            | Rule::kw_elsif
            | Rule::kw_else
            | Rule::kw_end
            | Rule::kw_then
            | Rule::kw_class
            | Rule::kw_def
            | Rule::kw_do
            | Rule::kw_quote
    )
}

/// Inner pairs without structural keywords.
fn significant<'i>(pair: Pair<'i, Rule>) -> impl Iterator<Item = Pair<'i, Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

impl AstBuilder<'_> {
    fn span(&self, pair: &Pair<Rule>) -> Span {
        match self.options.anchor {
            Some(anchor) => anchor,
            None => {
                let span = pair.as_span();
                Span::new(span.start(), span.end())
            }
        }
    }

    fn error(&self, kind: ErrorKind, span: Span) -> KilnError {
        self.ctx.report(kind, to_source_span(span))
    }

    fn missing(&self, what: &str, span: Span) -> KilnError {
        self.error(
            ErrorKind::Syntax {
                message: format!("missing {}", what),
            },
            span,
        )
    }

    fn convert_parse_error(&self, error: pest::error::Error<Rule>) -> KilnError {
        let span = match self.options.anchor {
            Some(anchor) => anchor,
            None => match error.location {
                InputLocation::Pos(pos) => Span::new(pos, pos),
                InputLocation::Span((start, end)) => Span::new(start, end),
            },
        };
        self.error(
            ErrorKind::Syntax {
                message: error.variant.message().to_string(),
            },
            span,
        )
    }

    fn template_error(&self, error: TemplateError, span: Span) -> KilnError {
        match error {
            TemplateError::OutsideExpansion { hole } => {
                self.error(ErrorKind::TemplateUsage { hole }, span)
            }
            other => self.ctx.internal_error(&other.to_string(), to_source_span(span)),
        }
    }

    fn build(&self, pair: Pair<Rule>) -> Result<Node, KilnError> {
        let span = self.span(&pair);

        match pair.as_rule() {
            Rule::body => {
                let statements = pair
                    .into_inner()
                    .map(|p| self.build(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::body(statements, span))
            }

            Rule::assignment => {
                let mut inner = pair.into_inner();
                let target = inner.next().ok_or_else(|| self.missing("assignment target", span))?;
                let value = inner.next().ok_or_else(|| self.missing("assigned value", span))?;
                let value = Box::new(self.build(value)?);
                let kind = match target.as_rule() {
                    Rule::field => NodeKind::FieldAssign {
                        name: target.as_str()[1..].to_string(),
                        value,
                    },
                    _ => NodeKind::LocalAssign {
                        name: target.as_str().to_string(),
                        value,
                    },
                };
                Ok(Node::new(kind, span))
            }

            Rule::ternary => {
                let mut inner = pair.into_inner();
                let condition = inner.next().ok_or_else(|| self.missing("expression", span))?;
                let condition = self.build(condition)?;
                match (inner.next(), inner.next()) {
                    (Some(then_branch), Some(else_branch)) => Ok(Node::new(
                        NodeKind::If {
                            condition: Box::new(condition),
                            then_branch: Box::new(self.build(then_branch)?),
                            else_branch: Some(Box::new(self.build(else_branch)?)),
                        },
                        span,
                    )),
                    _ => Ok(condition),
                }
            }

            Rule::binary => self.build_binary(pair),

            Rule::postfix => {
                let mut inner = pair.into_inner();
                let primary = inner.next().ok_or_else(|| self.missing("expression", span))?;
                let mut node = self.build(primary)?;
                for suffix in inner {
                    node = self.build_suffix(node, suffix)?;
                }
                Ok(node)
            }

            Rule::integer => {
                let text = pair.as_str();
                let value = text.parse::<i64>().map_err(|_| {
                    self.error(
                        ErrorKind::InvalidLiteral {
                            literal_type: "integer".into(),
                            value: text.into(),
                        },
                        span,
                    )
                })?;
                Ok(Node::new(NodeKind::Fixnum(value), span))
            }

            Rule::float => {
                let text = pair.as_str();
                let value = text.parse::<f64>().map_err(|_| {
                    self.error(
                        ErrorKind::InvalidLiteral {
                            literal_type: "float".into(),
                            value: text.into(),
                        },
                        span,
                    )
                })?;
                Ok(Node::new(NodeKind::Float(value), span))
            }

            Rule::string => {
                let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
                Ok(Node::string(unescape_string(raw), span))
            }

            Rule::kw_true => Ok(Node::new(NodeKind::Bool(true), span)),
            Rule::kw_false => Ok(Node::new(NodeKind::Bool(false), span)),
            Rule::kw_nil => Ok(Node::nil(span)),
            Rule::kw_self => Ok(Node::new(NodeKind::SelfRef, span)),

            Rule::local => Ok(Node::local(pair.as_str(), span)),
            Rule::field => Ok(Node::field(&pair.as_str()[1..], span)),
            Rule::constant => Ok(Node::constant(pair.as_str(), span)),

            Rule::paren_expr => {
                let body = pair
                    .into_inner()
                    .next()
                    .ok_or_else(|| self.missing("expression", span))?;
                let body = self.build(body)?;
                match body.statements().len() {
                    0 => Ok(Node::nil(span)),
                    _ => Ok(collapse(body)),
                }
            }

            Rule::functional_call => {
                let mut inner = pair.into_inner();
                let name = inner.next().ok_or_else(|| self.missing("call name", span))?;
                let name = name.as_str().to_string();
                let args = match inner.next() {
                    Some(args) => self.build_list(args)?,
                    None => Vec::new(),
                };
                let block = inner.next().map(|b| self.build_block(b)).transpose()?;
                Ok(Node::functional_call(name, args, block, span))
            }

            Rule::command_call => {
                let mut inner = pair.into_inner();
                let name = inner.next().ok_or_else(|| self.missing("command name", span))?;
                let name = name.as_str().to_string();
                let mut args = match inner.next() {
                    Some(args) => self.build_list(args)?,
                    None => Vec::new(),
                };
                let mut block = inner.next().map(|b| self.build_block(b)).transpose()?;
                // A trailing `do` block belongs to the outermost command.
                if block.is_none() {
                    block = args.last_mut().and_then(take_do_block);
                }
                Ok(Node::functional_call(name, args, block, span))
            }

            Rule::block_arg => {
                let mut inner = pair.into_inner();
                let name = inner.next().ok_or_else(|| self.missing("block name", span))?;
                Ok(Node::new(
                    NodeKind::BlockArgument {
                        name: name.as_str().to_string(),
                        optional: inner.next().is_some(),
                    },
                    span,
                ))
            }

            Rule::quote_expr => {
                let block = significant(pair)
                    .next()
                    .ok_or_else(|| self.missing("quoted body", span))?;
                let body = match self.build_block(block)?.kind {
                    NodeKind::Block { body, .. } => *body,
                    other => Node::new(other, span),
                };
                Ok(Node::new(NodeKind::Quote(Box::new(body)), span))
            }

            Rule::unquote => {
                let inner = pair
                    .into_inner()
                    .next()
                    .ok_or_else(|| self.missing("unquoted expression", span))?;
                if inner.as_rule() == Rule::hole_ref {
                    return self.resolve_hole(inner, span);
                }
                Ok(Node::new(NodeKind::Unquote(Box::new(self.build(inner)?)), span))
            }

            Rule::if_expr => self.build_if(pair),

            Rule::class_def => {
                let mut inner = significant(pair);
                let name = inner.next().ok_or_else(|| self.missing("class name", span))?;
                let name = name.as_str().to_string();
                let mut superclass = None;
                let mut body = Node::body(Vec::new(), span);
                for part in inner {
                    match part.as_rule() {
                        Rule::constant => superclass = Some(part.as_str().to_string()),
                        Rule::body => body = self.build(part)?,
                        _ => {}
                    }
                }
                Ok(Node::new(
                    NodeKind::ClassDefinition {
                        name,
                        superclass,
                        body: Box::new(body),
                    },
                    span,
                ))
            }

            Rule::method_def => self.build_method(pair),

            rule => Err(self.error(
                ErrorKind::Syntax {
                    message: format!("unsupported rule: {:?}", rule),
                },
                span,
            )),
        }
    }

    fn build_list(&self, pair: Pair<Rule>) -> Result<Vec<Node>, KilnError> {
        pair.into_inner().map(|p| self.build(p)).collect()
    }

    fn build_binary(&self, pair: Pair<Rule>) -> Result<Node, KilnError> {
        let anchored = self.options.anchor;
        let node = pratt()
            .map_primary(|primary| self.build(primary))
            .map_prefix(|op, operand| {
                let operand = operand?;
                let name = match op.as_rule() {
                    Rule::op_not => "!",
                    _ => "-@",
                };
                let span = anchored.unwrap_or_else(|| self.span(&op).merge(operand.span));
                Ok(Node::call(operand, name, Vec::new(), None, span))
            })
            .map_infix(|lhs, op, rhs| {
                let (lhs, rhs) = (lhs?, rhs?);
                let span = anchored.unwrap_or_else(|| lhs.span.merge(rhs.span));
                Ok(Node::call(lhs, op.as_str(), vec![rhs], None, span))
            })
            .parse(pair.into_inner());
        node
    }

    fn build_suffix(&self, target: Node, suffix: Pair<Rule>) -> Result<Node, KilnError> {
        let suffix_span = self.span(&suffix);
        let span = match self.options.anchor {
            Some(anchor) => anchor,
            None => target.span.merge(suffix_span),
        };
        let mut name = None;
        let mut args = Vec::new();
        let mut block = None;
        for part in suffix.into_inner() {
            match part.as_rule() {
                Rule::method_name => name = Some(part.as_str().to_string()),
                Rule::call_args => args = self.build_list(part)?,
                _ => block = Some(self.build_block(part)?),
            }
        }
        let name = name.ok_or_else(|| self.missing("method name", suffix_span))?;
        Ok(Node::call(target, name, args, block, span))
    }

    fn build_block(&self, pair: Pair<Rule>) -> Result<Node, KilnError> {
        let span = self.span(&pair);
        let brace = pair.as_rule() == Rule::brace_block;
        let mut params = Vec::new();
        let mut body = Node::body(Vec::new(), span);
        for part in significant(pair) {
            match part.as_rule() {
                Rule::block_params => {
                    params = part.into_inner().map(|p| p.as_str().to_string()).collect();
                }
                Rule::body => body = self.build(part)?,
                _ => {}
            }
        }
        Ok(Node::new(
            NodeKind::Block {
                params,
                body: Box::new(body),
                brace,
            },
            span,
        ))
    }

    fn build_if(&self, pair: Pair<Rule>) -> Result<Node, KilnError> {
        let span = self.span(&pair);
        let mut inner = significant(pair);
        let condition = inner.next().ok_or_else(|| self.missing("condition", span))?;
        let condition = self.build(condition)?;
        let then_branch = inner.next().ok_or_else(|| self.missing("if body", span))?;
        let then_branch = collapse(self.build(then_branch)?);

        let mut clauses = Vec::new();
        let mut else_branch = None;
        for clause in inner {
            let clause_span = self.span(&clause);
            match clause.as_rule() {
                Rule::elsif_clause => {
                    let mut parts = significant(clause);
                    let cond = parts.next().ok_or_else(|| self.missing("condition", clause_span))?;
                    let body = parts.next().ok_or_else(|| self.missing("elsif body", clause_span))?;
                    clauses.push((self.build(cond)?, collapse(self.build(body)?), clause_span));
                }
                Rule::else_clause => {
                    let body = significant(clause)
                        .next()
                        .ok_or_else(|| self.missing("else body", clause_span))?;
                    else_branch = Some(collapse(self.build(body)?));
                }
                _ => {}
            }
        }

        for (cond, body, clause_span) in clauses.into_iter().rev() {
            else_branch = Some(Node::new(
                NodeKind::If {
                    condition: Box::new(cond),
                    then_branch: Box::new(body),
                    else_branch: else_branch.map(Box::new),
                },
                clause_span,
            ));
        }

        Ok(Node::new(
            NodeKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: else_branch.map(Box::new),
            },
            span,
        ))
    }

    fn build_method(&self, pair: Pair<Rule>) -> Result<Node, KilnError> {
        let span = self.span(&pair);
        let mut name = None;
        let mut params = Vec::new();
        let mut returns = None;
        let mut body = Node::body(Vec::new(), span);
        for part in significant(pair) {
            match part.as_rule() {
                Rule::method_name => name = Some(part.as_str().to_string()),
                Rule::param_list => {
                    params = part
                        .into_inner()
                        .map(|p| self.build_param(p))
                        .collect::<Result<Vec<_>, _>>()?;
                }
                Rule::return_type => {
                    returns = part.into_inner().next().map(|t| t.as_str().to_string());
                }
                Rule::body => body = self.build(part)?,
                _ => {}
            }
        }
        let name = name.ok_or_else(|| self.missing("method name", span))?;
        Ok(Node::new(
            NodeKind::MethodDefinition(Box::new(MethodDef {
                name,
                params,
                returns,
                body,
            })),
            span,
        ))
    }

    fn build_param(&self, pair: Pair<Rule>) -> Result<Param, KilnError> {
        let span = self.span(&pair);
        let mut param = Param::named(String::new(), None);
        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::block_marker => param.block = true,
                Rule::local => param.name = part.as_str().to_string(),
                Rule::type_name => param.type_name = Some(part.as_str().to_string()),
                _ => param.default = Some(self.build(part)?),
            }
        }
        if param.name.is_empty() {
            return Err(self.missing("parameter name", span));
        }
        Ok(param)
    }

    fn resolve_hole(&self, pair: Pair<Rule>, span: Span) -> Result<Node, KilnError> {
        let text = pair.as_str();
        let ordinal = text[1..].parse::<usize>().map_err(|_| {
            self.error(
                ErrorKind::InvalidLiteral {
                    literal_type: "template placeholder".into(),
                    value: text.into(),
                },
                span,
            )
        })?;
        match self.options.templates {
            Some(templates) => templates
                .resolve(ordinal)
                .map_err(|e| self.template_error(e, span)),
            None => Err(self.error(
                ErrorKind::TemplateUsage {
                    hole: format!("`{}`", text),
                },
                span,
            )),
        }
    }
}

/// Detaches a `do` block from a call so an enclosing command can claim it.
fn take_do_block(node: &mut Node) -> Option<Node> {
    match &mut node.kind {
        NodeKind::Call { block, .. } | NodeKind::FunctionalCall { block, .. } => {
            let is_do_block = matches!(
                block.as_deref(),
                Some(Node {
                    kind: NodeKind::Block { brace: false, .. },
                    ..
                })
            );
            if is_do_block {
                block.take().map(|b| *b)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn unescape_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
