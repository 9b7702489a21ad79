//! Defines the command-line arguments and subcommands for the Kiln CLI.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// The main CLI argument structure.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Compiles macros into compiler extensions and expands their calls."
)]
pub struct KilnArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every subcommand; they override `kiln.yaml`.
#[derive(Debug, Args)]
pub struct SessionArgs {
    /// Configuration file. Defaults to `kiln.yaml` in the working directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory searched for types and units compiled earlier (repeatable).
    #[arg(long = "classpath", short = 'c', global = true)]
    pub classpath: Vec<PathBuf>,

    /// Package prefix of generated extension units.
    #[arg(long, global = true)]
    pub package: Option<String>,

    /// Log every synthesized extension unit.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// An enumeration of all available CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the fully macro-expanded program.
    Expand {
        /// The path to the Kiln source file to expand.
        #[arg(required = true)]
        file: PathBuf,

        /// Show every compiled macro expansion as a diff.
        #[arg(long)]
        trace: bool,
    },
    /// List the macros a source file defines or imports.
    Macros {
        /// The path to the Kiln source file.
        #[arg(required = true)]
        file: PathBuf,
    },
    /// Compile sources, writing units and type descriptors.
    Compile {
        /// A source file, or a directory searched for `.kiln` files.
        #[arg(required = true)]
        path: PathBuf,

        /// Output directory. Defaults to the configured destination.
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
    /// Show the syntax tree of a source file.
    Ast {
        /// The path to the Kiln source file to parse.
        #[arg(required = true)]
        file: PathBuf,
    },
}
