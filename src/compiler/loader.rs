//! Reference unit loader.
//!
//! Loaded units live in a [`UnitNamespace`]. A namespace maps fully-qualified
//! unit names to verified images and never holds two different units under
//! one name. Loading an identical artifact again hands back the unit already
//! published.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::ast::Node;
use crate::compiler::codegen::{unit_path, ArtifactError, UnitArtifact, UnitImage};
use crate::compiler::interp::Interpreter;
use crate::compiler::{Artifacts, Transformer, UnitLoader};
use crate::errors::{
    unspanned, DiagnosticContext, ErrorKind, ErrorReporting, KilnError, SourceContext,
};
use crate::macros::MacroHandle;

static GLOBAL_NAMESPACE: Lazy<Arc<UnitNamespace>> = Lazy::new(|| Arc::new(UnitNamespace::new()));

/// A verified unit image ready to run.
#[derive(Debug)]
pub struct LoadedUnit {
    pub name: String,
    pub checksum: String,
    pub image: UnitImage,
}

impl LoadedUnit {
    fn from_artifact(artifact: UnitArtifact) -> Self {
        Self {
            name: artifact.image.name.clone(),
            checksum: artifact.checksum,
            image: artifact.image,
        }
    }
}

impl MacroHandle for LoadedUnit {
    fn unit_name(&self) -> &str {
        &self.name
    }

    fn expand(&self, transformer: &mut dyn Transformer, call: &Node) -> Result<Node, KilnError> {
        Interpreter::new(self, transformer).run(call)
    }
}

/// Units loaded so far, by name.
#[derive(Debug, Default)]
pub struct UnitNamespace {
    units: Mutex<HashMap<String, Arc<LoadedUnit>>>,
}

impl UnitNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// The namespace shared by the whole process.
    pub fn global() -> Arc<UnitNamespace> {
        GLOBAL_NAMESPACE.clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedUnit>> {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Publishes `units` atomically. A unit whose name is taken by an
    /// identical unit resolves to the existing one; a different unit under a
    /// taken name rejects the whole batch.
    pub fn publish_all(&self, units: Vec<LoadedUnit>) -> Result<Vec<Arc<LoadedUnit>>, ArtifactError> {
        let mut published = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conflict) = units.iter().find(|unit| {
            published
                .get(&unit.name)
                .is_some_and(|existing| existing.checksum != unit.checksum)
        }) {
            return Err(ArtifactError::Conflict(conflict.name.clone()));
        }

        Ok(units
            .into_iter()
            .map(|unit| {
                published
                    .entry(unit.name.clone())
                    .or_insert_with(|| {
                        debug!(unit = %unit.name, "published unit");
                        Arc::new(unit)
                    })
                    .clone()
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.units.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loads JSON unit artifacts into a namespace.
#[derive(Debug, Clone)]
pub struct ReferenceLoader {
    namespace: Arc<UnitNamespace>,
    classpath: Vec<PathBuf>,
}

impl ReferenceLoader {
    /// Loader with a namespace of its own.
    pub fn new(classpath: Vec<PathBuf>) -> Self {
        Self::with_namespace(Arc::new(UnitNamespace::new()), classpath)
    }

    pub fn with_namespace(namespace: Arc<UnitNamespace>, classpath: Vec<PathBuf>) -> Self {
        Self {
            namespace,
            classpath,
        }
    }

    pub fn namespace(&self) -> &Arc<UnitNamespace> {
        &self.namespace
    }

    fn error(&self, unit: &str, reason: impl ToString) -> KilnError {
        DiagnosticContext::new(SourceContext::fallback(unit), "load").report(
            ErrorKind::MacroLoad {
                unit: unit.to_string(),
                reason: reason.to_string(),
            },
            unspanned(),
        )
    }

    fn decode(&self, expected: &str, bytes: &[u8]) -> Result<LoadedUnit, KilnError> {
        let artifact = UnitArtifact::decode(bytes).map_err(|e| self.error(expected, e))?;
        if artifact.image.name != expected {
            let mismatch = ArtifactError::NameMismatch {
                expected: expected.to_string(),
                found: artifact.image.name.clone(),
            };
            return Err(self.error(expected, mismatch));
        }
        Ok(LoadedUnit::from_artifact(artifact))
    }

    fn publish(&self, fqn: &str, units: Vec<LoadedUnit>) -> Result<Arc<dyn MacroHandle>, KilnError> {
        let published = self
            .namespace
            .publish_all(units)
            .map_err(|e| self.error(fqn, e))?;
        published
            .into_iter()
            .find(|unit| unit.name == fqn)
            .map(|unit| unit as Arc<dyn MacroHandle>)
            .ok_or_else(|| self.error(fqn, "no artifact for this unit"))
    }
}

impl UnitLoader for ReferenceLoader {
    fn load_unit(&self, fqn: &str, artifacts: &Artifacts) -> Result<Arc<dyn MacroHandle>, KilnError> {
        if !artifacts.contains_key(fqn) {
            return Err(self.error(fqn, "no artifact for this unit"));
        }
        let units = artifacts
            .iter()
            .map(|(name, bytes)| self.decode(name, bytes))
            .collect::<Result<Vec<_>, _>>()?;
        self.publish(fqn, units)
    }

    fn resolve_unit(&self, fqn: &str) -> Result<Arc<dyn MacroHandle>, KilnError> {
        if let Some(unit) = self.namespace.get(fqn) {
            return Ok(unit);
        }
        for root in &self.classpath {
            let path = unit_path(root, fqn);
            if !path.is_file() {
                continue;
            }
            let bytes = std::fs::read(&path)
                .map_err(|e| self.error(fqn, format!("{}: {}", path.display(), e)))?;
            debug!(unit = fqn, path = %path.display(), "loading unit from classpath");
            let unit = self.decode(fqn, &bytes)?;
            return self.publish(fqn, vec![unit]);
        }
        Err(self.error(fqn, "unit not found on the classpath"))
    }

    fn contains_unit(&self, fqn: &str) -> bool {
        self.namespace.get(fqn).is_some()
            || self.classpath.iter().any(|root| unit_path(root, fqn).is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;
    use crate::compiler::codegen::{write_artifacts, MethodImage};

    fn artifacts(name: &str, value: i64) -> Artifacts {
        let image = UnitImage {
            name: name.into(),
            superclass: Some("MacroExtension".into()),
            methods: vec![MethodImage {
                name: "expand".into(),
                params: vec![],
                body: Node::fixnum(value, Span::default()),
            }],
        };
        let bytes = UnitArtifact::seal(image).unwrap().encode().unwrap();
        Artifacts::from([(name.to_string(), bytes)])
    }

    #[test]
    fn identical_units_are_shared() {
        let loader = ReferenceLoader::new(Vec::new());
        let first = loader.load_unit("a.B$Extension1", &artifacts("a.B$Extension1", 1)).unwrap();
        let second = loader.load_unit("a.B$Extension1", &artifacts("a.B$Extension1", 1)).unwrap();
        assert_eq!(first.unit_name(), second.unit_name());
        assert_eq!(loader.namespace().len(), 1);
    }

    #[test]
    fn conflicting_units_fail_to_load() {
        let namespace = Arc::new(UnitNamespace::new());
        let one = ReferenceLoader::with_namespace(namespace.clone(), Vec::new());
        let two = ReferenceLoader::with_namespace(namespace, Vec::new());
        one.load_unit("a.B$Extension1", &artifacts("a.B$Extension1", 1)).unwrap();
        let err = two
            .load_unit("a.B$Extension1", &artifacts("a.B$Extension1", 2))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MacroLoad { .. }));
        assert!(err.to_string().contains("already loaded"));
    }

    #[test]
    fn missing_units_fail_to_load() {
        let loader = ReferenceLoader::new(Vec::new());
        let err = loader
            .load_unit("a.Other", &artifacts("a.B$Extension1", 1))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MacroLoad { .. }));
        assert!(loader.namespace().is_empty());
        assert!(loader.resolve_unit("a.Nowhere").is_err());
    }

    #[test]
    fn units_resolve_from_the_classpath() {
        let dir = tempfile::tempdir().unwrap();
        write_artifacts(dir.path(), &artifacts("a.B$Extension1", 1)).unwrap();
        let loader = ReferenceLoader::new(vec![dir.path().to_path_buf()]);
        let unit = loader.resolve_unit("a.B$Extension1").unwrap();
        assert_eq!(unit.unit_name(), "a.B$Extension1");
    }

    #[test]
    fn taken_names_include_loaded_and_classpath_units() {
        let dir = tempfile::tempdir().unwrap();
        write_artifacts(dir.path(), &artifacts("a.B$Extension1", 1)).unwrap();
        let loader = ReferenceLoader::new(vec![dir.path().to_path_buf()]);
        loader.load_unit("a.C$Extension1", &artifacts("a.C$Extension1", 2)).unwrap();

        assert!(loader.contains_unit("a.B$Extension1"));
        assert!(loader.contains_unit("a.C$Extension1"));
        assert!(!loader.contains_unit("a.B$Extension2"));
    }
}
