//! Static typing and call-site macro expansion.
//!
//! The typer walks a transformed tree, assigns a [`TypeRef`] to every
//! expression and resolves each call. A call that names a macro of the
//! receiver's type is expanded in place: the compiled macro runs, its result
//! replaces the call, and the replacement is transformed and typed in turn.
//!
//! Macro definitions of a body are registered before the body is typed, so a
//! call may use a macro defined further down. Such a call builds the
//! definition on demand.

use tracing::debug;

use crate::ast::printer::print;
use crate::ast::{Node, NodeKind, Span};
use crate::compiler::{ExpansionStep, Scope, Session, Transformer};
use crate::errors::{to_source_span, ErrorKind, ErrorReporting, KilnError};
use crate::macros::{MacroEntry, MacroOrchestrator, MacroState};
use crate::types::{MethodInfo, TypeRef, MACRO_EXTENSION};

/// Maximum nesting of macro expansions at one call site.
pub const MAX_EXPANSION_DEPTH: usize = 64;

/// Methods every type answers to.
const UNIVERSAL_METHODS: &[&str] = &["==", "!=", "!", "&&", "||", "to_s", "nil?", "class"];

pub struct Typer<'s> {
    session: &'s mut Session,
    errors: Vec<KilnError>,
    depth: usize,
}

impl<'s> Typer<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            errors: Vec::new(),
            depth: 0,
        }
    }

    /// Finishes typing. In strict mode the first error fails the whole
    /// resolution; otherwise every error is returned for reporting.
    pub fn resolve(self, strict: bool) -> Result<Vec<KilnError>, KilnError> {
        if strict {
            match self.errors.into_iter().next() {
                Some(first) => Err(first),
                None => Ok(Vec::new()),
            }
        } else {
            Ok(self.errors)
        }
    }

    fn report(&mut self, kind: ErrorKind, span: Span) -> TypeRef {
        let error = self
            .session
            .diagnostics("typer")
            .report(kind, to_source_span(span));
        self.errors.push(error);
        TypeRef::Any
    }

    pub fn infer(&mut self, node: &mut Node, scope: &mut Scope) -> TypeRef {
        let span = node.span;
        match &mut node.kind {
            NodeKind::Fixnum(_) => TypeRef::Int,
            NodeKind::Float(_) => TypeRef::Float,
            NodeKind::Str(_) => TypeRef::Str,
            NodeKind::Bool(_) => TypeRef::Bool,
            NodeKind::Nil => TypeRef::Nil,
            NodeKind::SelfRef => scope.self_type.clone(),

            NodeKind::Local(name) => {
                if let Some(local) = scope.locals.get(name.as_str()) {
                    return local.clone();
                }
                // Not a local: a zero-argument call on self.
                let name = name.clone();
                *node = Node::functional_call(name, Vec::new(), None, span);
                self.infer(node, scope)
            }
            NodeKind::LocalAssign { name, value } => {
                let value_type = self.infer(value, scope);
                scope.locals.insert(name.clone(), value_type.clone());
                value_type
            }
            NodeKind::Field(_) => TypeRef::Any,
            NodeKind::FieldAssign { value, .. } => self.infer(value, scope),
            NodeKind::Constant(name) => {
                let name = name.clone();
                self.constant(&name, span)
            }

            NodeKind::Call { .. } => self.infer_call(node, scope),
            NodeKind::FunctionalCall { .. } => self.infer_functional(node, scope),

            NodeKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.infer(condition, scope);
                let then_type = self.infer(then_branch, scope);
                match else_branch {
                    Some(else_branch) => {
                        let else_type = self.infer(else_branch, scope);
                        if else_type == then_type {
                            then_type
                        } else {
                            TypeRef::Any
                        }
                    }
                    None => then_type,
                }
            }
            NodeKind::Body(items) => {
                self.prescan(items, scope);
                let mut last = TypeRef::Nil;
                for item in items.iter_mut() {
                    last = self.infer(item, scope);
                }
                last
            }
            NodeKind::Block { params, body, .. } => {
                let params = params.iter().map(|p| (p.clone(), TypeRef::Any));
                let mut inner = scope.nested(params, true);
                self.infer(body, &mut inner);
                TypeRef::Block
            }
            NodeKind::BlockArgument { name, .. } => {
                let message = format!("block argument '&{}' outside a macro definition", name);
                self.report(ErrorKind::Syntax { message }, span)
            }

            NodeKind::ClassDefinition {
                name,
                superclass,
                body,
            } => {
                let persistent = superclass.as_deref() != Some(MACRO_EXTENSION);
                // Reopening a type compiled earlier extends its descriptor.
                if persistent && !self.session.types.contains(name) {
                    if let Err(error) = self.session.import_type(name) {
                        self.errors.push(error.reanchor(span, &self.session.source));
                    }
                }
                self.session
                    .types
                    .ensure_user_type(name, superclass.as_deref(), persistent);
                let mut inner = scope.class(TypeRef::from_name(name));
                self.infer(body, &mut inner);
                TypeRef::Nil
            }
            NodeKind::MethodDefinition(method) => {
                let params: Vec<(String, TypeRef)> = method
                    .params
                    .iter()
                    .map(|p| (p.name.clone(), param_type(p)))
                    .collect();
                for param in method.params.iter_mut() {
                    if let Some(default) = &mut param.default {
                        self.infer(default, scope);
                    }
                }
                let mut inner = scope.nested(params.clone(), false);
                let body_type = self.infer(&mut method.body, &mut inner);
                let returns = method
                    .returns
                    .as_deref()
                    .map(TypeRef::from_name)
                    .unwrap_or(body_type);
                let info = MethodInfo {
                    name: method.name.clone(),
                    params: params.into_iter().map(|(_, t)| t).collect(),
                    returns,
                };
                self.define_method(&scope.self_type, info);
                TypeRef::Nil
            }
            NodeKind::MacroDefinition { .. } => self.infer_definition(node, scope),

            NodeKind::Quote(body) => {
                self.infer_holes(body, scope);
                TypeRef::Node
            }
            NodeKind::Unquote(inner) => {
                let hole = format!("`{}`", print(inner));
                self.report(ErrorKind::TemplateUsage { hole }, span)
            }
            NodeKind::Noop => TypeRef::Void,
            NodeKind::Error(_) => TypeRef::Any,
        }
    }

    /// Registers the macro definitions and method signatures of a body.
    fn prescan(&mut self, items: &mut [Node], scope: &Scope) {
        let Some(owner) = scope.self_type.owner_name().map(str::to_string) else {
            return;
        };
        for item in items.iter_mut() {
            let span = item.span;
            match &mut item.kind {
                NodeKind::MacroDefinition { spec, id: id @ None } => {
                    let source = self.session.source.clone();
                    *id = Some(self.session.definitions.register((**spec).clone(), &owner, span, source));
                }
                NodeKind::MethodDefinition(method) => {
                    let info = MethodInfo {
                        name: method.name.clone(),
                        params: method.params.iter().map(param_type).collect(),
                        returns: method
                            .returns
                            .as_deref()
                            .map(TypeRef::from_name)
                            .unwrap_or(TypeRef::Any),
                    };
                    self.define_method(&scope.self_type, info);
                }
                _ => {}
            }
        }
    }

    fn define_method(&mut self, self_type: &TypeRef, info: MethodInfo) {
        if let Some(owner) = self_type
            .owner_name()
            .and_then(|name| self.session.types.get_mut(name))
        {
            owner.define_method(info);
        }
    }

    fn constant(&mut self, name: &str, span: Span) -> TypeRef {
        if self.session.types.contains(name) {
            return TypeRef::Meta(name.to_string());
        }
        match self.session.import_type(name) {
            Ok(true) => TypeRef::Meta(name.to_string()),
            Ok(false) => self.report(
                ErrorKind::UndefinedName {
                    name: name.to_string(),
                    context: "constant".into(),
                },
                span,
            ),
            Err(error) => {
                self.errors.push(error.reanchor(span, &self.session.source));
                TypeRef::Any
            }
        }
    }

    // ========================================================================
    // CALLS
    // ========================================================================

    fn infer_call(&mut self, node: &mut Node, scope: &mut Scope) -> TypeRef {
        let span = node.span;
        let NodeKind::Call {
            target,
            name,
            args,
            block,
        } = &mut node.kind
        else {
            return TypeRef::Any;
        };
        let receiver = self.infer(target, scope);
        let name = name.clone();
        let (argc, has_block) = (args.len(), block.is_some());

        if let Some(owner) = receiver.owner_name() {
            match self.find_macro(&[owner.to_string()], &name, argc, has_block, span) {
                Ok(Some(entry)) => return self.expand(node, entry, scope),
                Ok(None) => {}
                Err(error) => {
                    self.errors.push(error);
                    return TypeRef::Any;
                }
            }
        }

        if let NodeKind::Call { args, block, .. } = &mut node.kind {
            self.infer_arguments(args, block.as_deref_mut(), scope);
        }
        self.method_type(&receiver, &name, span)
    }

    fn infer_functional(&mut self, node: &mut Node, scope: &mut Scope) -> TypeRef {
        let span = node.span;
        let NodeKind::FunctionalCall { name, args, block } = &mut node.kind else {
            return TypeRef::Any;
        };
        let name = name.clone();
        let (argc, has_block) = (args.len(), block.is_some());

        match self.find_macro(&scope.macro_owners(), &name, argc, has_block, span) {
            Ok(Some(entry)) => return self.expand(node, entry, scope),
            Ok(None) => {}
            Err(error) => {
                self.errors.push(error);
                return TypeRef::Any;
            }
        }

        if let NodeKind::FunctionalCall { args, block, .. } = &mut node.kind {
            self.infer_arguments(args, block.as_deref_mut(), scope);
        }
        let owner = scope.self_type.owner_name().unwrap_or(&scope.script_type);
        if let Some(method) = self.session.types.lookup_method(owner, &name) {
            return method.returns;
        }
        if self.session.types.is_dynamic(owner) {
            return TypeRef::Any;
        }
        self.report(
            ErrorKind::UndefinedName {
                name,
                context: "local variable or method".into(),
            },
            span,
        )
    }

    fn infer_arguments(&mut self, args: &mut [Node], block: Option<&mut Node>, scope: &mut Scope) {
        for arg in args.iter_mut() {
            self.infer(arg, scope);
        }
        if let Some(block) = block {
            self.infer(block, scope);
        }
    }

    fn method_type(&mut self, receiver: &TypeRef, name: &str, span: Span) -> TypeRef {
        let Some(owner) = receiver.owner_name() else {
            return TypeRef::Any;
        };
        if name == "new" && matches!(receiver, TypeRef::Meta(_)) {
            return TypeRef::from_name(owner);
        }
        if let Some(method) = self.session.types.lookup_method(owner, name) {
            return method.returns;
        }
        if UNIVERSAL_METHODS.contains(&name) || self.session.types.is_dynamic(owner) {
            return TypeRef::Any;
        }
        self.report(
            ErrorKind::UndefinedName {
                name: name.to_string(),
                context: format!("method on {}", owner),
            },
            span,
        )
    }

    /// Finds the macro a call resolves to, building pending definitions of
    /// the same name first.
    fn find_macro(
        &mut self,
        owners: &[String],
        name: &str,
        argc: usize,
        has_block: bool,
        span: Span,
    ) -> Result<Option<MacroEntry>, KilnError> {
        let ctx = self.session.diagnostics("typer");
        for owner in owners {
            let pending: Vec<_> = self.session.definitions.pending(owner, name).collect();
            for (id, state) in pending {
                if state.is_building() {
                    return Err(ctx.report(
                        ErrorKind::MacroRequiredBeforeDefined {
                            macro_name: name.to_string(),
                        },
                        to_source_span(span),
                    ));
                }
                if state == MacroState::Unresolved {
                    // A failure is reported where the macro is defined.
                    let _ = MacroOrchestrator::new(self.session).infer(id);
                }
            }

            if let Some(entry) = self.session.types.lookup_macro(owner, name, argc, has_block) {
                return Ok(Some(entry));
            }
            let failed = self
                .session
                .definitions
                .pending(owner, name)
                .any(|(_, state)| state == MacroState::Failed);
            if failed {
                return Err(ctx.macro_not_found(name, owner, to_source_span(span)));
            }
        }
        Ok(None)
    }

    /// Replaces a macro call with its expansion.
    fn expand(&mut self, node: &mut Node, entry: MacroEntry, scope: &mut Scope) -> TypeRef {
        let call = node.clone();
        if self.depth >= MAX_EXPANSION_DEPTH {
            *node = Node::new(NodeKind::Error("expansion depth exceeded".into()), call.span);
            return self.report(
                ErrorKind::MacroCompile {
                    macro_name: entry.name,
                    reason: "expansion depth exceeded".into(),
                },
                call.span,
            );
        }

        self.session.sites.push(call.span);
        let result = entry.handle.expand(&mut *self.session, &call);
        self.session.sites.pop();

        let expanded = result.and_then(|mut expanded| {
            expanded.span = call.span;
            self.session.transform(expanded)
        });
        let mut expanded = match expanded {
            Ok(expanded) => expanded,
            Err(error) => {
                *node = Node::new(NodeKind::Error(error.to_string()), call.span);
                self.errors.push(error.reanchor(call.span, &self.session.source));
                return TypeRef::Any;
            }
        };
        debug!(
            macro_name = %entry.name,
            unit = entry.handle.unit_name(),
            depth = self.depth,
            "expanded macro call"
        );
        self.session.expansions.push(ExpansionStep {
            macro_name: entry.name.clone(),
            unit: entry.handle.unit_name().to_string(),
            depth: self.depth,
            call: print(&call),
            expansion: print(&expanded),
        });

        self.depth += 1;
        let expanded_type = self.infer(&mut expanded, scope);
        self.depth -= 1;
        *node = expanded;
        expanded_type
    }

    /// Builds the macro a definition node stands for and replaces the node
    /// with a no-op, or with an error marker if the build failed.
    fn infer_definition(&mut self, node: &mut Node, scope: &mut Scope) -> TypeRef {
        let span = node.span;
        let NodeKind::MacroDefinition { spec, id } = &mut node.kind else {
            return TypeRef::Any;
        };
        let id = match id {
            Some(id) => *id,
            None => {
                let owner = scope
                    .self_type
                    .owner_name()
                    .unwrap_or(&scope.script_type)
                    .to_string();
                let source = self.session.source.clone();
                self.session
                    .definitions
                    .register((**spec).clone(), &owner, span, source)
            }
        };

        match MacroOrchestrator::new(self.session).infer(id) {
            Ok(()) => {
                *node = Node::noop(span);
                TypeRef::Void
            }
            Err(error) => {
                *node = Node::new(NodeKind::Error(error.to_string()), span);
                self.errors.push(error);
                TypeRef::Any
            }
        }
    }

    /// Types the holes of a quoted body. Nested quotes are left alone.
    fn infer_holes(&mut self, node: &mut Node, scope: &mut Scope) {
        match &mut node.kind {
            NodeKind::Unquote(inner) => {
                self.infer(inner, scope);
            }
            NodeKind::Quote(_) => {}
            _ => {
                for child in node.children_mut() {
                    self.infer_holes(child, scope);
                }
            }
        }
    }
}

fn param_type(param: &crate::ast::Param) -> TypeRef {
    if param.block {
        return TypeRef::Block;
    }
    param
        .type_name
        .as_deref()
        .map(TypeRef::from_name)
        .unwrap_or(TypeRef::Any)
}
