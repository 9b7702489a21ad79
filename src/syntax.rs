//! Syntax module for the Kiln language.
//!
//! The grammar lives in `syntax/grammar.pest`; [`parser`] turns it into
//! [`Node`](crate::ast::Node) trees.

pub mod parser;

pub use parser::{collapse, parse, parse_with, ParseOptions};
