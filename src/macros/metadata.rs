//! Persistent macro metadata.
//!
//! A type that can be written out carries a [`TypeDescriptor`]. Each macro
//! registered on the type adds a [`MacroRecord`] naming the macro, its encoded
//! signature and the unit that implements it. A later session that only has
//! the compiled output reads the descriptor back and rebuilds one macro-table
//! entry per record by resolving the unit through the loader.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::compiler::UnitLoader;
use crate::errors::{config_error, io_error, KilnError};
use crate::macros::MacroHandle;
use crate::types::TypeRef;

/// File extension of serialized type descriptors.
pub const DESCRIPTOR_EXTENSION: &str = "kdesc";

// ============================================================================
// SIGNATURES
// ============================================================================

/// Kind of one macro parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Required,
    Optional,
    Block,
}

impl ParamKind {
    fn code(self) -> char {
        match self {
            Self::Required => 'R',
            Self::Optional => 'O',
            Self::Block => 'B',
        }
    }
}

/// Parameter kinds plus return kind, encoded as `(<R|O|B>*)N`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MacroSignature {
    pub params: Vec<ParamKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed macro signature '{0}'")]
pub struct SignatureError(pub String);

impl MacroSignature {
    pub fn new(params: Vec<ParamKind>) -> Self {
        Self { params }
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.params.len() + 3);
        out.push('(');
        out.extend(self.params.iter().map(|p| p.code()));
        out.push_str(")N");
        out
    }

    pub fn decode(text: &str) -> Result<Self, SignatureError> {
        let inner = text
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(")N"))
            .ok_or_else(|| SignatureError(text.to_string()))?;
        let params = inner
            .chars()
            .map(|c| match c {
                'R' => Ok(ParamKind::Required),
                'O' => Ok(ParamKind::Optional),
                'B' => Ok(ParamKind::Block),
                _ => Err(SignatureError(text.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if params.iter().rev().skip(1).any(|p| *p == ParamKind::Block) {
            return Err(SignatureError(text.to_string()));
        }
        Ok(Self { params })
    }

    pub fn required(&self) -> usize {
        self.params.iter().filter(|p| **p == ParamKind::Required).count()
    }

    /// Number of non-block parameters.
    pub fn positional(&self) -> usize {
        self.params.iter().filter(|p| **p != ParamKind::Block).count()
    }

    pub fn has_block(&self) -> bool {
        self.params.last() == Some(&ParamKind::Block)
    }

    /// The same signature with its trailing block removed.
    pub fn without_block(&self) -> Self {
        let mut params = self.params.clone();
        if self.has_block() {
            params.pop();
        }
        Self { params }
    }

    pub fn argument_types(&self) -> Vec<TypeRef> {
        self.params
            .iter()
            .map(|p| match p {
                ParamKind::Block => TypeRef::Block,
                _ => TypeRef::Any,
            })
            .collect()
    }
}

impl fmt::Display for MacroSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<MacroSignature> for String {
    fn from(signature: MacroSignature) -> Self {
        signature.encode()
    }
}

impl TryFrom<String> for MacroSignature {
    type Error = SignatureError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::decode(&text)
    }
}

// ============================================================================
// DESCRIPTORS
// ============================================================================

/// Persistent record of one registered macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroRecord {
    pub name: String,
    pub signature: MacroSignature,
    /// Fully-qualified name of the implementing unit.
    pub unit: String,
}

/// Persistent record of one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRecord {
    pub name: String,
    pub params: Vec<String>,
    pub returns: String,
}

/// Compiled description of a type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    #[serde(default)]
    pub superclass: Option<String>,
    #[serde(default)]
    pub methods: Vec<MethodRecord>,
    #[serde(default)]
    pub macros: Vec<MacroRecord>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, superclass: Option<String>) -> Self {
        Self {
            name: name.into(),
            superclass,
            ..Self::default()
        }
    }

    /// Records `record`. A record with the same name and signature is
    /// pointed at the new unit, so a redefinition wins as it does in the
    /// macro table. Returns whether the descriptor changed.
    pub fn add_macro_record(&mut self, record: MacroRecord) -> bool {
        match self
            .macros
            .iter_mut()
            .find(|r| r.name == record.name && r.signature == record.signature)
        {
            Some(existing) if existing.unit == record.unit => false,
            Some(existing) => {
                existing.unit = record.unit;
                true
            }
            None => {
                self.macros.push(record);
                true
            }
        }
    }

    pub fn add_method_record(&mut self, record: MethodRecord) {
        match self.methods.iter_mut().find(|m| m.name == record.name) {
            Some(existing) => *existing = record,
            None => self.methods.push(record),
        }
    }
}

// ============================================================================
// DESCRIPTOR STORE
// ============================================================================

/// Reads and writes descriptors as `<root>/<Type>.kdesc` JSON files.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    root: PathBuf,
}

impl DescriptorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, type_name: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", type_name, DESCRIPTOR_EXTENSION))
    }

    pub fn write(&self, descriptor: &TypeDescriptor) -> Result<PathBuf, KilnError> {
        std::fs::create_dir_all(&self.root).map_err(|e| io_error(&self.root, &e))?;
        let path = self.path_for(&descriptor.name);
        let json = serde_json::to_vec_pretty(descriptor)
            .map_err(|e| config_error(format!("cannot encode descriptor: {}", e)))?;
        std::fs::write(&path, json).map_err(|e| io_error(&path, &e))?;
        debug!(path = %path.display(), macros = descriptor.macros.len(), "wrote type descriptor");
        Ok(path)
    }

    pub fn read(&self, type_name: &str) -> Result<Option<TypeDescriptor>, KilnError> {
        let path = self.path_for(type_name);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| io_error(&path, &e))?;
        let descriptor = serde_json::from_slice(&bytes).map_err(|e| {
            config_error(format!("malformed descriptor '{}': {}", path.display(), e))
        })?;
        Ok(Some(descriptor))
    }

    /// First descriptor for `type_name` found along `classpath`.
    pub fn find(classpath: &[PathBuf], type_name: &str) -> Result<Option<TypeDescriptor>, KilnError> {
        for root in classpath {
            if let Some(descriptor) = Self::new(root).read(type_name)? {
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Rebuilds a handle for every macro record of `descriptor`.
pub fn reconstruct(
    descriptor: &TypeDescriptor,
    loader: &dyn UnitLoader,
) -> Result<Vec<(MacroRecord, Arc<dyn MacroHandle>)>, KilnError> {
    descriptor
        .macros
        .iter()
        .map(|record| {
            let handle = loader.resolve_unit(&record.unit)?;
            Ok((record.clone(), handle))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_encode_kinds_in_order() {
        let signature = MacroSignature::new(vec![
            ParamKind::Required,
            ParamKind::Optional,
            ParamKind::Block,
        ]);
        assert_eq!(signature.encode(), "(ROB)N");
        assert_eq!(MacroSignature::decode("(ROB)N").unwrap(), signature);
        assert_eq!(signature.without_block().encode(), "(RO)N");
        assert_eq!(signature.required(), 1);
        assert_eq!(signature.positional(), 2);
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        assert!(MacroSignature::decode("RR").is_err());
        assert!(MacroSignature::decode("(RX)N").is_err());
        assert!(MacroSignature::decode("(BR)N").is_err());
    }

    #[test]
    fn records_are_additive_and_idempotent() {
        let mut descriptor = TypeDescriptor::new("Script", None);
        let record = MacroRecord {
            name: "greet".into(),
            signature: MacroSignature::new(vec![ParamKind::Required]),
            unit: "kiln.macros.Script$Extension1".into(),
        };
        assert!(descriptor.add_macro_record(record.clone()));
        assert!(!descriptor.add_macro_record(record));
        assert!(descriptor.add_macro_record(MacroRecord {
            name: "shout".into(),
            signature: MacroSignature::new(vec![ParamKind::Required]),
            unit: "kiln.macros.Script$Extension2".into(),
        }));
        assert_eq!(descriptor.macros.len(), 2);
    }

    #[test]
    fn redefinitions_repoint_the_record() {
        let mut descriptor = TypeDescriptor::new("Script", None);
        let signature = MacroSignature::new(vec![ParamKind::Required]);
        descriptor.add_macro_record(MacroRecord {
            name: "greet".into(),
            signature: signature.clone(),
            unit: "kiln.macros.Script$Extension1".into(),
        });
        assert!(descriptor.add_macro_record(MacroRecord {
            name: "greet".into(),
            signature,
            unit: "kiln.macros.Script$Extension2".into(),
        }));
        assert_eq!(descriptor.macros.len(), 1);
        assert_eq!(descriptor.macros[0].unit, "kiln.macros.Script$Extension2");
    }

    #[test]
    fn descriptor_json_uses_encoded_signatures() {
        let mut descriptor = TypeDescriptor::new("Script", None);
        descriptor.add_macro_record(MacroRecord {
            name: "m".into(),
            signature: MacroSignature::new(vec![ParamKind::Block]),
            unit: "u".into(),
        });
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("\"(B)N\""));
        let back: TypeDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }
}
