//! Macro orchestration: from a definition to a registered, callable macro.
//!
//! Each definition moves through
//! `Unresolved -> BuildingExtension -> Compiling -> Loading -> Registering -> Resolved`,
//! or ends in `Failed`. [`MacroOrchestrator::infer`] drives one definition
//! through the whole pipeline:
//!
//! 1. allocate a unique unit name `<Owner>$Extension<N>`
//! 2. synthesize the extension unit and transform it
//! 3. type it with the owner as lexical owner and compile it
//! 4. load the unit back into the process
//! 5. register it on the owner (twice when the block is optional)
//! 6. record it in the owner's descriptor, or warn that it cannot be
//!
//! Inference is idempotent. A definition that is required while it is still
//! being built fails with "required before fully defined".

use tracing::{debug, info, warn};

use crate::ast::Span;
use crate::compiler::codegen::write_artifacts;
use crate::compiler::typer::Typer;
use crate::compiler::{Scope, Session, Transformer};
use crate::errors::{
    to_source_span, DiagnosticContext, ErrorKind, ErrorReporting, KilnError, SourceContext,
};
use crate::macros::{extension, MacroDefId, MacroHandle, MacroRecord, MacroSpec};
use std::sync::Arc;

/// Suffix of generated unit names; the session counter is appended.
pub const EXTENSION_SUFFIX: &str = "$Extension";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroState {
    Unresolved,
    BuildingExtension,
    Compiling,
    Loading,
    Registering,
    Resolved,
    Failed,
}

impl MacroState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }

    /// Somewhere between starting and finishing the pipeline.
    pub fn is_building(self) -> bool {
        !self.is_terminal() && self != Self::Unresolved
    }
}

/// A macro definition seen by the session.
#[derive(Debug, Clone)]
pub struct MacroDefinition {
    pub spec: MacroSpec,
    /// Name of the type the macro is defined on.
    pub owner: String,
    pub span: Span,
    pub source: SourceContext,
    pub state: MacroState,
    /// Fully-qualified name of the extension unit, once allocated.
    pub unit_name: Option<String>,
    pub failure: Option<KilnError>,
}

/// Arena of the session's macro definitions.
#[derive(Debug, Clone, Default)]
pub struct MacroDefinitions {
    entries: Vec<MacroDefinition>,
}

impl MacroDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: MacroSpec, owner: &str, span: Span, source: SourceContext) -> MacroDefId {
        let id = MacroDefId(self.entries.len());
        debug!(macro_name = %spec.name, owner, id = id.0, "registered macro definition");
        self.entries.push(MacroDefinition {
            spec,
            owner: owner.to_string(),
            span,
            source,
            state: MacroState::Unresolved,
            unit_name: None,
            failure: None,
        });
        id
    }

    pub fn get(&self, id: MacroDefId) -> Option<&MacroDefinition> {
        self.entries.get(id.0)
    }

    fn get_mut(&mut self, id: MacroDefId) -> Option<&mut MacroDefinition> {
        self.entries.get_mut(id.0)
    }

    pub fn state(&self, id: MacroDefId) -> Option<MacroState> {
        self.get(id).map(|d| d.state)
    }

    pub fn unit_name(&self, id: MacroDefId) -> Option<&str> {
        self.get(id).and_then(|d| d.unit_name.as_deref())
    }

    /// Definitions of `name` on `owner` that have not resolved.
    pub fn pending<'a>(&'a self, owner: &'a str, name: &'a str) -> impl Iterator<Item = (MacroDefId, MacroState)> + 'a {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, d)| d.owner == owner && d.spec.name == name && d.state != MacroState::Resolved)
            .map(|(index, d)| (MacroDefId(index), d.state))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MacroDefId, &MacroDefinition)> {
        self.entries.iter().enumerate().map(|(i, d)| (MacroDefId(i), d))
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Builds macro definitions of a session.
pub struct MacroOrchestrator<'s> {
    session: &'s mut Session,
}

impl<'s> MacroOrchestrator<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self { session }
    }

    /// Ensures definition `id` is built and registered.
    ///
    /// A resolved definition returns immediately; a failed one returns its
    /// original error. Every error carries the definition's position.
    pub fn infer(&mut self, id: MacroDefId) -> Result<(), KilnError> {
        let definition = self.session.definitions.get(id).cloned().ok_or_else(|| {
            DiagnosticContext::new(self.session.source.clone(), "macro").internal_error(
                &format!("unknown macro definition #{}", id.0),
                to_source_span(Span::default()),
            )
        })?;

        match definition.state {
            MacroState::Resolved => return Ok(()),
            MacroState::Failed => {
                return Err(definition
                    .failure
                    .clone()
                    .unwrap_or_else(|| self.reentrant(&definition)))
            }
            MacroState::Unresolved => {}
            _ => return Err(self.reentrant(&definition)),
        }

        match self.build(id, &definition) {
            Ok(()) => {
                self.transition(id, MacroState::Resolved);
                Ok(())
            }
            Err(error) => {
                let error = self.classify(error, id, &definition);
                self.transition(id, MacroState::Failed);
                if let Some(entry) = self.session.definitions.get_mut(id) {
                    entry.failure = Some(error.clone());
                }
                Err(error)
            }
        }
    }

    fn transition(&mut self, id: MacroDefId, state: MacroState) {
        if let Some(definition) = self.session.definitions.get_mut(id) {
            debug!(
                macro_name = %definition.spec.name,
                owner = %definition.owner,
                from = ?definition.state,
                to = ?state,
                "macro state"
            );
            definition.state = state;
        }
    }

    fn reentrant(&self, definition: &MacroDefinition) -> KilnError {
        DiagnosticContext::new(definition.source.clone(), "macro").report(
            ErrorKind::MacroRequiredBeforeDefined {
                macro_name: definition.spec.name.clone(),
            },
            to_source_span(definition.span),
        )
    }

    /// Re-anchors a pipeline failure at the definition.
    fn classify(&self, error: KilnError, id: MacroDefId, definition: &MacroDefinition) -> KilnError {
        match error.kind {
            ErrorKind::MacroRequiredBeforeDefined { .. } | ErrorKind::MacroLoad { .. } => {
                error.reanchor(definition.span, &definition.source)
            }
            _ => {
                let unit = self
                    .session
                    .definitions
                    .unit_name(id)
                    .unwrap_or("<unnamed>")
                    .to_string();
                DiagnosticContext::new(definition.source.clone(), "macro")
                    .report(
                        ErrorKind::MacroCompile {
                            macro_name: definition.spec.name.clone(),
                            reason: error.to_string(),
                        },
                        to_source_span(definition.span),
                    )
                    .with_help(format!("raised while building extension unit {}", unit))
            }
        }
    }

    fn build(&mut self, id: MacroDefId, definition: &MacroDefinition) -> Result<(), KilnError> {
        self.transition(id, MacroState::BuildingExtension);
        let name = self
            .session
            .fresh_name(&format!("{}{}", definition.owner, EXTENSION_SUFFIX));
        let fqn = format!("{}.{}", self.session.config.package, name);
        if let Some(entry) = self.session.definitions.get_mut(id) {
            entry.unit_name = Some(fqn.clone());
        }

        let unit = extension::synthesize(&fqn, &definition.spec, definition.span);
        if self.session.verbose() {
            info!(unit = %fqn, "extension unit\n{}", unit);
        }
        let mut unit = self.session.transform(unit)?;

        self.transition(id, MacroState::Compiling);
        let mut scope = Scope::extension(&fqn, &definition.owner, self.session.types.script_type());
        let mut typer = Typer::new(self.session);
        typer.infer(&mut unit, &mut scope);
        typer.resolve(true)?;

        let artifacts = self.session.codegen.compile(&unit, &self.session.templates)?;

        self.transition(id, MacroState::Loading);
        let handle = self.session.loader.load_unit(&fqn, &artifacts)?;

        self.transition(id, MacroState::Registering);
        self.register(definition, &fqn, handle)?;

        // Only units that loaded and registered reach the destination.
        if let Some(destination) = self.session.destination() {
            write_artifacts(destination, &artifacts)?;
        }
        Ok(())
    }

    fn register(
        &mut self,
        definition: &MacroDefinition,
        fqn: &str,
        handle: Arc<dyn MacroHandle>,
    ) -> Result<(), KilnError> {
        let spec = &definition.spec;
        let owner = &definition.owner;
        let signature = spec.signature();

        let owner_type = self.session.types.get_mut(owner).ok_or_else(|| {
            DiagnosticContext::new(definition.source.clone(), "macro").undefined_name(
                owner,
                "macro owner",
                to_source_span(definition.span),
            )
        })?;
        owner_type.add_compiled_macro(&spec.name, signature.clone(), handle.clone());
        if spec.has_optional_block() {
            owner_type.add_method(&spec.name, signature.clone(), handle);
        }
        info!(macro_name = %spec.name, owner = %owner, unit = fqn, signature = %signature, "registered macro");

        let persisted = match &mut owner_type.descriptor {
            Some(descriptor) => {
                descriptor.add_macro_record(MacroRecord {
                    name: spec.name.clone(),
                    signature: signature.clone(),
                    unit: fqn.to_string(),
                });
                if spec.has_optional_block() {
                    descriptor.add_macro_record(MacroRecord {
                        name: spec.name.clone(),
                        signature: signature.without_block(),
                        unit: fqn.to_string(),
                    });
                }
                true
            }
            None => false,
        };

        if !persisted {
            let warning = DiagnosticContext::new(definition.source.clone(), "macro").report(
                ErrorKind::MetadataUnavailable {
                    owner: owner.clone(),
                    macro_name: spec.name.clone(),
                },
                to_source_span(definition.span),
            );
            warn!(macro_name = %spec.name, owner = %owner, "{}", warning);
            self.session.warnings.push(warning);
        }
        Ok(())
    }
}
