//! Kiln: a self-hosting macro expansion core.
//!
//! Macros are written in the language they extend. Each definition is
//! compiled into a standalone extension unit, loaded back into the running
//! compiler and registered on its owner type, so later calls expand by running
//! compiled code. Definitions are recorded in type descriptors and come back
//! in later sessions through the classpath.

pub mod ast;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod logging;
pub mod macros;
pub mod syntax;
pub mod template;
pub mod types;

pub use ast::{Node, NodeKind, Span};
pub use compiler::{Compilation, ExpansionStep, Session, Transformer};
pub use config::SessionConfig;
pub use errors::{ErrorKind, KilnError};
pub use template::TemplateEngine;
