//! Evaluator for loaded extension units.
//!
//! A unit runs the way the loader invokes it: the constructor receives the
//! compiler and the call node, then `expand` produces the replacement tree.
//! Values are deliberately few. Macro bodies manipulate nodes, strings and
//! numbers, and reach the compiler only through `@mirah.quote`.

use std::collections::HashMap;
use std::fmt;
use tracing::trace;

use crate::ast::{Node, NodeKind, Span};
use crate::compiler::codegen::MethodImage;
use crate::compiler::loader::LoadedUnit;
use crate::compiler::Transformer;
use crate::errors::{unspanned, DiagnosticContext, ErrorKind, ErrorReporting, KilnError, SourceContext};
use crate::macros::extension::ENTRY_METHOD;

const MAX_CALL_DEPTH: usize = 256;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Node(Node),
    /// The compiler services handed to the constructor.
    Compiler,
    /// The `System` constant.
    System,
    /// `System.out`.
    Stdout,
}

impl Value {
    fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "Nil",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "String",
            Value::Node(_) => "Node",
            Value::Compiler => "Compiler",
            Value::System => "System",
            Value::Stdout => "PrintStream",
        }
    }

    /// Tree for a value returned from a macro or spliced into a template.
    pub fn into_node(self, span: Span) -> Result<Node, String> {
        Ok(match self {
            Value::Node(node) => node,
            Value::Nil => Node::nil(span),
            Value::Bool(b) => Node::new(NodeKind::Bool(b), span),
            Value::Int(i) => Node::fixnum(i, span),
            Value::Float(f) => Node::new(NodeKind::Float(f), span),
            Value::Str(s) => Node::string(s, span),
            other => return Err(format!("a {} cannot be used as a node", other.type_name())),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => f.write_str(s),
            Value::Node(node) => write!(f, "{}", node),
            other => f.write_str(other.type_name()),
        }
    }
}

type Frame = HashMap<String, Value>;

/// Runs one expansion of a loaded unit.
pub struct Interpreter<'u, 't> {
    unit: &'u LoadedUnit,
    transformer: &'t mut dyn Transformer,
    fields: HashMap<String, Value>,
    depth: usize,
}

impl<'u, 't> Interpreter<'u, 't> {
    pub fn new(unit: &'u LoadedUnit, transformer: &'t mut dyn Transformer) -> Self {
        Self {
            unit,
            transformer,
            fields: HashMap::new(),
            depth: 0,
        }
    }

    /// Constructs the extension for `call` and returns its expansion.
    pub fn run(mut self, call: &Node) -> Result<Node, KilnError> {
        trace!(unit = %self.unit.name, "running extension");
        if self.unit.image.method("initialize").is_some() {
            self.invoke("initialize", vec![Value::Compiler, Value::Node(call.clone())])?;
        }
        let result = self.invoke(ENTRY_METHOD, Vec::new())?;
        result.into_node(call.span).map_err(|reason| self.fail(reason))
    }

    fn fail(&self, reason: impl Into<String>) -> KilnError {
        DiagnosticContext::new(SourceContext::fallback(&self.unit.name), "expand").report(
            ErrorKind::ExpansionFailed {
                macro_name: self.unit.name.clone(),
                reason: reason.into(),
            },
            unspanned(),
        )
    }

    fn method(&self, name: &str) -> Option<&'u MethodImage> {
        self.unit.image.method(name)
    }

    fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Value, KilnError> {
        let method = self
            .method(name)
            .ok_or_else(|| self.fail(format!("undefined method '{}'", name)))?;
        if method.params.len() != args.len() {
            return Err(self.fail(format!(
                "wrong number of arguments for '{}' ({} for {})",
                name,
                args.len(),
                method.params.len()
            )));
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.fail("stack level too deep"));
        }

        let mut frame: Frame = method.params.iter().cloned().zip(args).collect();
        self.depth += 1;
        let result = self.eval(&method.body, &mut frame);
        self.depth -= 1;
        result
    }

    fn eval(&mut self, node: &Node, frame: &mut Frame) -> Result<Value, KilnError> {
        match &node.kind {
            NodeKind::Fixnum(i) => Ok(Value::Int(*i)),
            NodeKind::Float(f) => Ok(Value::Float(*f)),
            NodeKind::Str(s) => Ok(Value::Str(s.clone())),
            NodeKind::Bool(b) => Ok(Value::Bool(*b)),
            NodeKind::Nil | NodeKind::Noop => Ok(Value::Nil),
            NodeKind::Local(name) => match frame.get(name) {
                Some(value) => Ok(value.clone()),
                None if self.method(name).is_some() => self.invoke(name, Vec::new()),
                None => Err(self.fail(format!("undefined local variable or method '{}'", name))),
            },
            NodeKind::LocalAssign { name, value } => {
                let value = self.eval(value, frame)?;
                frame.insert(name.clone(), value.clone());
                Ok(value)
            }
            NodeKind::Field(name) => Ok(self.fields.get(name).cloned().unwrap_or(Value::Nil)),
            NodeKind::FieldAssign { name, value } => {
                let value = self.eval(value, frame)?;
                self.fields.insert(name.clone(), value.clone());
                Ok(value)
            }
            NodeKind::Constant(name) if name == "System" => Ok(Value::System),
            NodeKind::Constant(name) => Err(self.fail(format!("uninitialized constant {}", name))),
            NodeKind::Call {
                target,
                name,
                args,
                block,
            } => {
                if block.is_some() {
                    return Err(self.fail(format!("'{}' does not take a block", name)));
                }
                self.eval_call(target, name, args, frame)
            }
            NodeKind::FunctionalCall { name, args, block } => {
                if block.is_some() {
                    return Err(self.fail(format!("'{}' does not take a block", name)));
                }
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, frame))
                    .collect::<Result<Vec<_>, _>>()?;
                self.invoke(name, args)
            }
            NodeKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition, frame)?.truthy() {
                    self.eval(then_branch, frame)
                } else if let Some(else_branch) = else_branch {
                    self.eval(else_branch, frame)
                } else {
                    Ok(Value::Nil)
                }
            }
            NodeKind::Body(items) => {
                let mut last = Value::Nil;
                for item in items {
                    last = self.eval(item, frame)?;
                }
                Ok(last)
            }
            NodeKind::Block { .. } => Ok(Value::Node(node.clone())),
            NodeKind::Error(message) => Err(self.fail(message.clone())),
            _ => Err(self.fail(format!("cannot evaluate {}", node.describe()))),
        }
    }

    fn eval_call(
        &mut self,
        target: &Node,
        name: &str,
        args: &[Node],
        frame: &mut Frame,
    ) -> Result<Value, KilnError> {
        // Short-circuit before evaluating the right-hand side.
        if let ("&&" | "||", [rhs]) = (name, args) {
            let lhs = self.eval(target, frame)?;
            return match (name, lhs.truthy()) {
                ("&&", false) | ("||", true) => Ok(lhs),
                _ => self.eval(rhs, frame),
            };
        }

        let receiver = self.eval(target, frame)?;
        let args = args
            .iter()
            .map(|arg| self.eval(arg, frame))
            .collect::<Result<Vec<_>, _>>()?;
        self.send(receiver, name, args)
    }

    fn send(&mut self, receiver: Value, name: &str, args: Vec<Value>) -> Result<Value, KilnError> {
        match (receiver, name, args.as_slice()) {
            (lhs, "==", [rhs]) => Ok(Value::Bool(lhs == *rhs)),
            (lhs, "!=", [rhs]) => Ok(Value::Bool(lhs != *rhs)),
            (value, "!", []) => Ok(Value::Bool(!value.truthy())),
            (value, "to_s", []) => Ok(Value::Str(value.to_string())),
            (value, "nil?", []) => Ok(Value::Bool(value == Value::Nil)),

            (Value::Int(i), "-@", []) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| self.fail(format!("integer overflow in -({})", i))),
            (Value::Float(f), "-@", []) => Ok(Value::Float(-f)),
            (Value::Int(a), op, [Value::Int(b)]) => self.integer_op(a, op, *b),
            (Value::Float(a), op, [Value::Float(b)]) => self.float_op(a, op, *b),
            (Value::Int(a), op, [Value::Float(b)]) => self.float_op(a as f64, op, *b),
            (Value::Float(a), op, [Value::Int(b)]) => self.float_op(a, op, *b as f64),

            (Value::Str(s), "+", [other]) => Ok(Value::Str(format!("{}{}", s, other))),
            (Value::Str(s), "length", []) => Ok(Value::Int(s.chars().count() as i64)),

            (Value::Node(node), method, args) => self.node_method(&node, method, args),

            (Value::Compiler, "quote", args) => self.quote(args),
            (Value::System, "out", []) => Ok(Value::Stdout),
            (Value::Stdout, "println", args) => {
                println!("{}", join(args));
                Ok(Value::Nil)
            }
            (Value::Stdout, "print", args) => {
                print!("{}", join(args));
                Ok(Value::Nil)
            }

            (receiver, method, args) => Err(self.fail(format!(
                "undefined method '{}' for {} with {} argument(s)",
                method,
                receiver.type_name(),
                args.len()
            ))),
        }
    }

    fn integer_op(&self, a: i64, op: &str, b: i64) -> Result<Value, KilnError> {
        let checked = |result: Option<i64>| {
            result
                .map(Value::Int)
                .ok_or_else(|| self.fail(format!("integer overflow or division by zero in {} {} {}", a, op, b)))
        };
        match op {
            "+" => checked(a.checked_add(b)),
            "-" => checked(a.checked_sub(b)),
            "*" => checked(a.checked_mul(b)),
            "/" => checked(a.checked_div(b)),
            "%" => checked(a.checked_rem(b)),
            "<" => Ok(Value::Bool(a < b)),
            "<=" => Ok(Value::Bool(a <= b)),
            ">" => Ok(Value::Bool(a > b)),
            ">=" => Ok(Value::Bool(a >= b)),
            _ => Err(self.fail(format!("undefined method '{}' for Int", op))),
        }
    }

    fn float_op(&self, a: f64, op: &str, b: f64) -> Result<Value, KilnError> {
        Ok(match op {
            "+" => Value::Float(a + b),
            "-" => Value::Float(a - b),
            "*" => Value::Float(a * b),
            "/" => Value::Float(a / b),
            "<" => Value::Bool(a < b),
            "<=" => Value::Bool(a <= b),
            ">" => Value::Bool(a > b),
            ">=" => Value::Bool(a >= b),
            _ => return Err(self.fail(format!("undefined method '{}' for Float", op))),
        })
    }

    /// Reflection available on call nodes and their parts.
    fn node_method(&self, node: &Node, method: &str, args: &[Value]) -> Result<Value, KilnError> {
        let index = |value: &Value| match value {
            Value::Int(i) if *i >= 0 => Ok(*i as usize),
            other => Err(self.fail(format!("argument index must be a non-negative Int, got {}", other.type_name()))),
        };
        match (method, args) {
            ("argument", [i]) => {
                let i = index(i)?;
                node.call_args()
                    .get(i)
                    .cloned()
                    .map(Value::Node)
                    .ok_or_else(|| self.fail(format!("call has no argument {}", i)))
            }
            ("argument_or", [i, default]) => {
                let i = index(i)?;
                Ok(node
                    .call_args()
                    .get(i)
                    .cloned()
                    .map(Value::Node)
                    .unwrap_or_else(|| default.clone()))
            }
            ("argument_count", []) => Ok(Value::Int(node.call_args().len() as i64)),
            ("block", []) => Ok(node.call_block().cloned().map(Value::Node).unwrap_or(Value::Nil)),
            ("name", []) => Ok(node.call_name().map(|n| Value::Str(n.to_string())).unwrap_or(Value::Nil)),
            ("target", []) => Ok(match &node.kind {
                NodeKind::Call { target, .. } => Value::Node(target.as_ref().clone()),
                _ => Value::Nil,
            }),
            ("body", []) => Ok(match &node.kind {
                NodeKind::Block { body, .. } => Value::Node(body.as_ref().clone()),
                _ => Value::Nil,
            }),
            ("params", []) => Ok(match &node.kind {
                NodeKind::Block { params, .. } => Value::Int(params.len() as i64),
                _ => Value::Nil,
            }),
            _ => Err(self.fail(format!(
                "undefined method '{}' for Node with {} argument(s)",
                method,
                args.len()
            ))),
        }
    }

    /// `@mirah.quote(text, label, holes...)`
    fn quote(&mut self, args: &[Value]) -> Result<Value, KilnError> {
        let [Value::Str(text), Value::Str(label), holes @ ..] = args else {
            return Err(self.fail("quote expects template text and a label"));
        };
        let bindings = holes
            .iter()
            .cloned()
            .map(|hole| hole.into_node(Span::default()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| self.fail(reason))?;
        self.transformer.eval(text, label, bindings).map(Value::Node)
    }
}

fn join(args: &[Value]) -> String {
    args.iter().map(Value::to_string).collect::<Vec<_>>().join("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::UnitImage;
    use std::path::Path;

    /// Transformer that returns the template text as a string node.
    struct Echo;

    impl Transformer for Echo {
        fn transform(&mut self, form: Node) -> Result<Node, KilnError> {
            Ok(form)
        }

        fn eval(&mut self, code: &str, _label: &str, bindings: Vec<Node>) -> Result<Node, KilnError> {
            Ok(Node::string(format!("{}/{}", code, bindings.len()), Span::default()))
        }

        fn fresh_name(&mut self, template: &str) -> String {
            template.to_string()
        }

        fn destination(&self) -> Option<&Path> {
            None
        }

        fn verbose(&self) -> bool {
            false
        }
    }

    fn unit(expand: Node) -> LoadedUnit {
        let span = Span::default();
        let assign = |field: &str| {
            Node::new(
                NodeKind::FieldAssign {
                    name: field.into(),
                    value: Box::new(Node::local(field, span)),
                },
                span,
            )
        };
        LoadedUnit {
            name: "kiln.macros.Script$Extension1".into(),
            checksum: String::new(),
            image: UnitImage {
                name: "kiln.macros.Script$Extension1".into(),
                superclass: None,
                methods: vec![
                    MethodImage {
                        name: "initialize".into(),
                        params: vec!["mirah".into(), "call".into()],
                        body: Node::body(vec![assign("mirah"), assign("call")], span),
                    },
                    MethodImage {
                        name: "expand".into(),
                        params: vec![],
                        body: expand,
                    },
                ],
            },
        }
    }

    fn call() -> Node {
        let span = Span::default();
        Node::functional_call("m", vec![Node::fixnum(7, span)], None, span)
    }

    #[test]
    fn arguments_are_read_from_the_call() {
        let span = Span::default();
        let body = Node::call(Node::field("call", span), "argument", vec![Node::fixnum(0, span)], None, span);
        let result = Interpreter::new(&unit(body), &mut Echo).run(&call()).unwrap();
        assert_eq!(result, Node::fixnum(7, span));
    }

    #[test]
    fn arithmetic_results_become_literals() {
        let span = Span::default();
        let count = Node::call(Node::field("call", span), "argument_count", vec![], None, span);
        let body = Node::call(count, "*", vec![Node::fixnum(6, span)], None, span);
        let result = Interpreter::new(&unit(body), &mut Echo).run(&call()).unwrap();
        assert_eq!(result, Node::fixnum(6, span));
    }

    #[test]
    fn quote_goes_through_the_transformer() {
        let span = Span::default();
        let arg = Node::call(Node::field("call", span), "argument", vec![Node::fixnum(0, span)], None, span);
        let body = Node::call(
            Node::field("mirah", span),
            "quote",
            vec![Node::string("`$0`", span), Node::string("label", span), arg],
            None,
            span,
        );
        let result = Interpreter::new(&unit(body), &mut Echo).run(&call()).unwrap();
        assert_eq!(result, Node::string("`$0`/1", span));
    }

    #[test]
    fn missing_arguments_fail_the_expansion() {
        let span = Span::default();
        let body = Node::call(Node::field("call", span), "argument", vec![Node::fixnum(3, span)], None, span);
        let err = Interpreter::new(&unit(body), &mut Echo).run(&call()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ExpansionFailed { .. }));
    }

    #[test]
    fn negating_the_smallest_integer_fails_the_expansion() {
        let span = Span::default();
        let lowest = Node::call(
            Node::call(Node::fixnum(0, span), "-", vec![Node::fixnum(i64::MAX, span)], None, span),
            "-",
            vec![Node::fixnum(1, span)],
            None,
            span,
        );
        let assign = Node::new(
            NodeKind::LocalAssign {
                name: "x".into(),
                value: Box::new(lowest),
            },
            span,
        );
        let negate = Node::call(Node::local("x", span), "-@", vec![], None, span);
        let body = Node::body(vec![assign, negate], span);

        let err = Interpreter::new(&unit(body), &mut Echo).run(&call()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ExpansionFailed { .. }));
        assert!(err.to_string().contains("integer overflow"));
    }

    #[test]
    fn logic_short_circuits() {
        let span = Span::default();
        let fail = Node::new(NodeKind::Error("boom".into()), span);
        let body = Node::call(Node::new(NodeKind::Bool(false), span), "&&", vec![fail], None, span);
        let result = Interpreter::new(&unit(body), &mut Echo).run(&call()).unwrap();
        assert_eq!(result, Node::new(NodeKind::Bool(false), span));
    }
}
