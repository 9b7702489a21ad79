//! Reference code generator.
//!
//! Every class of a unit becomes one artifact: a JSON [`UnitArtifact`]
//! holding the class image and a SHA-256 checksum of it. Quotes are lowered
//! to `@mirah.quote("<template text>", "<label>", holes...)`: the quoted body
//! is printed in template mode inside an extraction scope, which replaces each
//! hole by an ordinal placeholder and captures the hole expression as an
//! argument evaluated when the macro runs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::ast::printer::print_template;
use crate::ast::{Node, NodeKind};
use crate::compiler::{Artifacts, CodeGenerator};
use crate::errors::{io_error, DiagnosticContext, ErrorKind, ErrorReporting, KilnError, SourceContext};
use crate::template::TemplateEngine;

pub const ARTIFACT_FORMAT: &str = "kiln-unit/1";

/// File extension of unit artifacts.
pub const UNIT_EXTENSION: &str = "kunit";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodImage {
    pub name: String,
    pub params: Vec<String>,
    pub body: Node,
}

/// Executable image of one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitImage {
    pub name: String,
    pub superclass: Option<String>,
    pub methods: Vec<MethodImage>,
}

impl UnitImage {
    pub fn method(&self, name: &str) -> Option<&MethodImage> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitArtifact {
    pub format: String,
    pub checksum: String,
    pub image: UnitImage,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact is not valid: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported artifact format '{0}'")]
    UnsupportedFormat(String),
    #[error("checksum mismatch: recorded {recorded}, computed {computed}")]
    ChecksumMismatch { recorded: String, computed: String },
    #[error("a different unit named '{0}' is already loaded")]
    Conflict(String),
    #[error("artifact for '{expected}' contains unit '{found}'")]
    NameMismatch { expected: String, found: String },
}

fn digest(image: &UnitImage) -> Result<String, ArtifactError> {
    let bytes = serde_json::to_vec(image)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

impl UnitArtifact {
    pub fn seal(image: UnitImage) -> Result<Self, ArtifactError> {
        Ok(Self {
            format: ARTIFACT_FORMAT.to_string(),
            checksum: digest(&image)?,
            image,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decodes and verifies an artifact.
    pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let artifact: Self = serde_json::from_slice(bytes)?;
        artifact.verify()?;
        Ok(artifact)
    }

    pub fn verify(&self) -> Result<(), ArtifactError> {
        if self.format != ARTIFACT_FORMAT {
            return Err(ArtifactError::UnsupportedFormat(self.format.clone()));
        }
        let computed = digest(&self.image)?;
        if computed != self.checksum {
            return Err(ArtifactError::ChecksumMismatch {
                recorded: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }
}

/// `<root>/<fqn with '.' replaced by '/'>.kunit`
pub fn unit_path(root: &Path, fqn: &str) -> PathBuf {
    root.join(format!("{}.{}", fqn.replace('.', "/"), UNIT_EXTENSION))
}

/// Writes every artifact under `root`.
pub fn write_artifacts(root: &Path, artifacts: &Artifacts) -> Result<Vec<PathBuf>, KilnError> {
    artifacts
        .iter()
        .map(|(name, bytes)| {
            let path = unit_path(root, name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_error(parent, &e))?;
            }
            std::fs::write(&path, bytes).map_err(|e| io_error(&path, &e))?;
            debug!(unit = %name, path = %path.display(), "wrote unit artifact");
            Ok(path)
        })
        .collect()
}

// ============================================================================
// LOWERING
// ============================================================================

/// Lowers classes to checksummed JSON images.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceCodegen;

impl ReferenceCodegen {
    pub fn new() -> Self {
        Self
    }

    fn error(&self, unit: &str, reason: String) -> KilnError {
        DiagnosticContext::new(SourceContext::fallback(unit), "codegen").report(
            ErrorKind::MacroCompile {
                macro_name: unit.to_string(),
                reason,
            },
            crate::errors::unspanned(),
        )
    }

    fn lower_class(
        &self,
        name: &str,
        superclass: Option<&str>,
        body: &Node,
        templates: &TemplateEngine<Node>,
    ) -> Result<UnitImage, KilnError> {
        let mut methods = Vec::new();
        for member in body.statements() {
            match &member.kind {
                NodeKind::MethodDefinition(method) => {
                    let label = format!("{}#{}", name, method.name);
                    methods.push(MethodImage {
                        name: method.name.clone(),
                        params: method.params.iter().map(|p| p.name.clone()).collect(),
                        body: lower(&method.body, &label, templates)?,
                    });
                }
                NodeKind::Noop => {}
                _ => {
                    return Err(self.error(
                        name,
                        format!("unexpected {} in class body", member.describe()),
                    ))
                }
            }
        }
        Ok(UnitImage {
            name: name.to_string(),
            superclass: superclass.map(str::to_string),
            methods,
        })
    }
}

impl CodeGenerator for ReferenceCodegen {
    fn compile(&self, unit: &Node, templates: &TemplateEngine<Node>) -> Result<Artifacts, KilnError> {
        let mut artifacts = Artifacts::new();
        for statement in unit.statements() {
            let NodeKind::ClassDefinition {
                name,
                superclass,
                body,
            } = &statement.kind
            else {
                continue;
            };
            let image = self.lower_class(name, superclass.as_deref(), body, templates)?;
            let bytes = UnitArtifact::seal(image)
                .and_then(|artifact| artifact.encode())
                .map_err(|e| self.error(name, e.to_string()))?;
            debug!(unit = %name, bytes = bytes.len(), "compiled unit");
            artifacts.insert(name.clone(), bytes);
        }
        if artifacts.is_empty() {
            return Err(self.error("<unit>", "no class to compile".into()));
        }
        Ok(artifacts)
    }
}

/// Rewrites every quote in `node` into a runtime `quote` call.
fn lower(node: &Node, label: &str, templates: &TemplateEngine<Node>) -> Result<Node, KilnError> {
    let mut lowered = node.clone();
    lower_in_place(&mut lowered, label, templates)?;
    Ok(lowered)
}

fn lower_in_place(node: &mut Node, label: &str, templates: &TemplateEngine<Node>) -> Result<(), KilnError> {
    if let NodeKind::Quote(body) = &node.kind {
        let (text, holes) = templates.extract_values(|| print_template(body, templates));
        let text = text.map_err(|e| {
            KilnError::from(e).reanchor(node.span, &SourceContext::fallback(label))
        })?;
        let span = node.span;
        let mut args = vec![Node::string(text, span), Node::string(label, span)];
        for hole in holes {
            args.push(lower(&hole, label, templates)?);
        }
        *node = Node::call(Node::field("mirah", span), "quote", args, None, span);
        return Ok(());
    }
    for child in node.children_mut() {
        lower_in_place(child, label, templates)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn image() -> UnitImage {
        UnitImage {
            name: "kiln.macros.Script$Extension1".into(),
            superclass: Some("MacroExtension".into()),
            methods: vec![MethodImage {
                name: "expand".into(),
                params: vec![],
                body: Node::fixnum(1, Span::default()),
            }],
        }
    }

    #[test]
    fn sealed_artifacts_verify() {
        let bytes = UnitArtifact::seal(image()).unwrap().encode().unwrap();
        let decoded = UnitArtifact::decode(&bytes).unwrap();
        assert_eq!(decoded.image, image());
    }

    #[test]
    fn tampered_images_fail_verification() {
        let mut artifact = UnitArtifact::seal(image()).unwrap();
        artifact.image.methods.clear();
        let bytes = artifact.encode().unwrap();
        assert!(matches!(
            UnitArtifact::decode(&bytes),
            Err(ArtifactError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let mut artifact = UnitArtifact::seal(image()).unwrap();
        artifact.format = "kiln-unit/0".into();
        let bytes = artifact.encode().unwrap();
        assert!(matches!(
            UnitArtifact::decode(&bytes),
            Err(ArtifactError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn unit_paths_follow_the_package() {
        let path = unit_path(Path::new("out"), "kiln.macros.Script$Extension1");
        assert_eq!(path, Path::new("out/kiln/macros/Script$Extension1.kunit"));
    }

    #[test]
    fn quotes_lower_to_runtime_calls() {
        let span = Span::default();
        let hole = Node::new(NodeKind::Unquote(Box::new(Node::local("a", span))), span);
        let quote = Node::new(
            NodeKind::Quote(Box::new(Node::body(
                vec![Node::call(hole, "+", vec![Node::fixnum(1, span)], None, span)],
                span,
            ))),
            span,
        );
        let templates = TemplateEngine::new();
        let lowered = lower(&quote, "Unit#expand", &templates).unwrap();

        assert_eq!(lowered.call_name(), Some("quote"));
        let args = lowered.call_args();
        assert_eq!(args[0], Node::string("(`$0` + 1)", span));
        assert_eq!(args[1], Node::string("Unit#expand", span));
        assert_eq!(args[2], Node::local("a", span));
        assert_eq!(templates.depth(), 0);
    }
}
