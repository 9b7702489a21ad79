//! Static types known to a compilation session.
//!
//! Every type that can own macros is an [`OwnerType`] in the session's
//! [`TypeRegistry`]. Built-in types are dynamic: calls to methods they do not
//! declare are accepted and yield [`TypeRef::Any`]. Types defined in source
//! (and the script type) are checked strictly and carry a [`TypeDescriptor`]
//! that is written out with the compiled program.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::macros::metadata::MethodRecord;
use crate::macros::{EntryKind, MacroEntry, MacroHandle, MacroSignature, MacroTable, TypeDescriptor};

/// Name of the root type.
pub const OBJECT: &str = "Object";

/// Superclass of every synthesized extension unit.
pub const MACRO_EXTENSION: &str = "MacroExtension";

/// A static type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Unknown or untyped; accepts any method.
    Any,
    Void,
    Int,
    Float,
    Str,
    Bool,
    Nil,
    /// A syntax tree value.
    Node,
    Block,
    /// An instance of the named type.
    Named(String),
    /// The named type itself, as a value.
    Meta(String),
}

impl TypeRef {
    /// Type for a name written in source (`Int`, `String`, `Greeter`).
    pub fn from_name(name: &str) -> Self {
        match name {
            "Any" => Self::Any,
            "Void" => Self::Void,
            "Int" => Self::Int,
            "Float" => Self::Float,
            "String" => Self::Str,
            "Bool" => Self::Bool,
            "Nil" => Self::Nil,
            "Node" => Self::Node,
            "Block" => Self::Block,
            other => Self::Named(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Any => "Any",
            Self::Void => "Void",
            Self::Int => "Int",
            Self::Float => "Float",
            Self::Str => "String",
            Self::Bool => "Bool",
            Self::Nil => "Nil",
            Self::Node => "Node",
            Self::Block => "Block",
            Self::Named(name) | Self::Meta(name) => name,
        }
    }

    /// The registry entry whose methods and macros apply to values of this type.
    pub fn owner_name(&self) -> Option<&str> {
        match self {
            Self::Any | Self::Void => None,
            other => Some(other.name()),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(name) => write!(f, "{}.class", name),
            other => f.write_str(other.name()),
        }
    }
}

/// Signature of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub name: String,
    pub params: Vec<TypeRef>,
    pub returns: TypeRef,
}

impl MethodInfo {
    fn record(&self) -> MethodRecord {
        MethodRecord {
            name: self.name.clone(),
            params: self.params.iter().map(|p| p.name().to_string()).collect(),
            returns: self.returns.name().to_string(),
        }
    }
}

// ============================================================================
// OWNER TYPES
// ============================================================================

/// A type with methods and a macro table.
#[derive(Debug, Clone)]
pub struct OwnerType {
    pub name: String,
    pub superclass: Option<String>,
    pub methods: BTreeMap<String, MethodInfo>,
    pub macros: MacroTable,
    /// Present for types that are written out with the program.
    pub descriptor: Option<TypeDescriptor>,
    pub builtin: bool,
}

impl OwnerType {
    fn builtin(name: &str, superclass: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            superclass: superclass.map(str::to_string),
            methods: BTreeMap::new(),
            macros: MacroTable::new(),
            descriptor: None,
            builtin: true,
        }
    }

    fn user(name: &str, superclass: Option<&str>, persistent: bool) -> Self {
        let superclass = superclass.unwrap_or(OBJECT).to_string();
        Self {
            name: name.to_string(),
            descriptor: persistent.then(|| TypeDescriptor::new(name, Some(superclass.clone()))),
            superclass: Some(superclass),
            methods: BTreeMap::new(),
            macros: MacroTable::new(),
            builtin: false,
        }
    }

    /// Registers a compiled macro under its full signature.
    pub fn add_compiled_macro(
        &mut self,
        name: &str,
        signature: MacroSignature,
        handle: Arc<dyn MacroHandle>,
    ) -> bool {
        self.macros.add(MacroEntry {
            name: name.to_string(),
            argument_types: signature.argument_types(),
            signature,
            handle,
            kind: EntryKind::Macro,
        })
    }

    /// Registers the without-block overload of a macro whose block is optional.
    pub fn add_method(
        &mut self,
        name: &str,
        signature: MacroSignature,
        handle: Arc<dyn MacroHandle>,
    ) -> bool {
        let signature = signature.without_block();
        self.macros.add(MacroEntry {
            name: name.to_string(),
            argument_types: signature.argument_types(),
            signature,
            handle,
            kind: EntryKind::BlocklessOverload,
        })
    }

    /// Declares an ordinary method, recording it in the descriptor if any.
    pub fn define_method(&mut self, method: MethodInfo) {
        if let Some(descriptor) = &mut self.descriptor {
            descriptor.add_method_record(method.record());
        }
        self.methods.insert(method.name.clone(), method);
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// All types of a session, keyed by name.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: BTreeMap<String, OwnerType>,
    script_type: String,
}

impl TypeRegistry {
    /// Registry with the built-in types and an empty script type.
    pub fn new(script_type: &str) -> Self {
        let mut registry = Self {
            types: BTreeMap::new(),
            script_type: script_type.to_string(),
        };
        registry.insert(OwnerType::builtin(OBJECT, None));
        for name in ["Int", "Float", "String", "Bool", "Nil", "Node", "Block", "Compiler"] {
            registry.insert(OwnerType::builtin(name, Some(OBJECT)));
        }
        registry.insert(OwnerType::builtin(MACRO_EXTENSION, Some(OBJECT)));

        let mut stream = OwnerType::builtin("PrintStream", Some(OBJECT));
        for name in ["println", "print"] {
            stream.methods.insert(
                name.to_string(),
                MethodInfo {
                    name: name.to_string(),
                    params: vec![TypeRef::Any],
                    returns: TypeRef::Void,
                },
            );
        }
        registry.insert(stream);

        let mut system = OwnerType::builtin("System", Some(OBJECT));
        system.methods.insert(
            "out".to_string(),
            MethodInfo {
                name: "out".to_string(),
                params: Vec::new(),
                returns: TypeRef::Named("PrintStream".into()),
            },
        );
        registry.insert(system);

        registry.insert(OwnerType::user(script_type, None, true));
        registry
    }

    fn insert(&mut self, owner: OwnerType) {
        self.types.insert(owner.name.clone(), owner);
    }

    pub fn script_type(&self) -> &str {
        &self.script_type
    }

    pub fn get(&self, name: &str) -> Option<&OwnerType> {
        self.types.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut OwnerType> {
        self.types.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Opens `name` for definitions, creating it if it does not exist yet.
    /// Reopening keeps the existing type and its superclass.
    pub fn ensure_user_type(&mut self, name: &str, superclass: Option<&str>, persistent: bool) -> &mut OwnerType {
        self.types
            .entry(name.to_string())
            .or_insert_with(|| OwnerType::user(name, superclass, persistent))
    }

    /// Adds a type read back from a descriptor.
    pub fn install(&mut self, owner: OwnerType) {
        self.insert(owner);
    }

    /// `name` followed by its superclasses.
    fn ancestors<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a OwnerType> + 'a {
        let mut next = self.types.get(name);
        let mut seen = 0usize;
        std::iter::from_fn(move || {
            let current = next.take()?;
            seen += 1;
            // Guard against superclass cycles from malformed descriptors.
            if seen <= self.types.len() {
                next = current.superclass.as_deref().and_then(|s| self.types.get(s));
            }
            Some(current)
        })
    }

    /// Macro entry matching the call shape on `owner` or one of its superclasses.
    pub fn lookup_macro(&self, owner: &str, name: &str, argc: usize, has_block: bool) -> Option<MacroEntry> {
        self.ancestors(owner)
            .find_map(|t| t.macros.resolve(name, argc, has_block))
            .cloned()
    }

    pub fn lookup_method(&self, owner: &str, name: &str) -> Option<MethodInfo> {
        self.ancestors(owner).find_map(|t| t.methods.get(name)).cloned()
    }

    /// Whether unknown methods on `owner` are accepted.
    pub fn is_dynamic(&self, owner: &str) -> bool {
        !self.types.contains_key(owner)
            || self.ancestors(owner).any(|t| t.builtin && t.name != OBJECT)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OwnerType> {
        self.types.values()
    }

    /// Types that are written out with the program.
    pub fn descriptors(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values().filter_map(|t| t.descriptor.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_dynamic_and_user_types_are_not() {
        let mut types = TypeRegistry::new("Script");
        types.ensure_user_type("Greeter", None, true);
        types.ensure_user_type("Script$Extension1", Some(MACRO_EXTENSION), false);

        assert!(types.is_dynamic("Int"));
        assert!(!types.is_dynamic("Script"));
        assert!(!types.is_dynamic("Greeter"));
        assert!(types.is_dynamic("Script$Extension1"));
    }

    #[test]
    fn only_user_types_carry_descriptors() {
        let mut types = TypeRegistry::new("Script");
        types.ensure_user_type("Greeter", None, true);
        let names: Vec<_> = types.descriptors().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Greeter", "Script"]);
        assert!(types.get("Int").unwrap().descriptor.is_none());
    }

    #[test]
    fn methods_are_inherited() {
        let mut types = TypeRegistry::new("Script");
        types.ensure_user_type("Base", None, true).define_method(MethodInfo {
            name: "hello".into(),
            params: vec![],
            returns: TypeRef::Str,
        });
        types.ensure_user_type("Child", Some("Base"), true);
        assert_eq!(types.lookup_method("Child", "hello").unwrap().returns, TypeRef::Str);
        assert!(types.lookup_method("Child", "missing").is_none());
    }
}
