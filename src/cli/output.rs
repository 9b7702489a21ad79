//! Handles all user-facing output for the CLI.
//!
//! Colors go through `termcolor` so they are dropped when stdout is not a
//! terminal. Diagnostics are rendered by miette on stderr.

use difference::{Changeset, Difference};
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::compiler::ExpansionStep;
use crate::errors::{print_error, KilnError};
use crate::macros::EntryKind;
use crate::types::TypeRegistry;

// ============================================================================
// CORE OUTPUT FUNCTIONS
// ============================================================================

/// Prints each expansion as a diff from the call to its replacement.
pub fn print_trace(trace: &[ExpansionStep]) {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);
    if trace.is_empty() {
        println!("(no compiled macro calls)");
        return;
    }

    for (i, step) in trace.iter().enumerate() {
        let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)).set_bold(true));
        let _ = writeln!(
            stdout,
            "--- Step {}: {}{} ({}) ---",
            i + 1,
            "  ".repeat(step.depth),
            step.macro_name,
            step.unit
        );
        let _ = stdout.reset();
        let changeset = Changeset::new(&step.call, &step.expansion, "\n");
        print_diff(&mut stdout, &changeset.diffs);
        let _ = writeln!(stdout);
    }
}

/// Lists every macro registered on a user type, or on the script type.
pub fn print_macros(types: &TypeRegistry) {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);
    let mut found = false;

    for owner in types.iter().filter(|t| !t.builtin && !t.macros.is_empty()) {
        found = true;
        let _ = stdout.set_color(ColorSpec::new().set_bold(true));
        let _ = writeln!(stdout, "{}", owner.name);
        let _ = stdout.reset();
        for entry in owner.macros.iter() {
            let note = match entry.kind {
                EntryKind::Macro => "",
                EntryKind::BlocklessOverload => " (blockless overload)",
            };
            let _ = writeln!(
                stdout,
                "  {}{} -> {}{}",
                entry.name,
                entry.signature,
                entry.handle.unit_name(),
                note
            );
        }
    }

    if !found {
        println!("  No macros found.");
    }
}

/// Prints warnings with miette, after a short colored banner.
pub fn print_warnings(warnings: &[KilnError]) {
    if warnings.is_empty() {
        return;
    }
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)).set_bold(true));
    let _ = writeln!(stderr, "{} warning(s)", warnings.len());
    let _ = stderr.reset();
    for warning in warnings {
        print_error(warning.clone());
    }
}

/// Prints every error, then a red summary line.
pub fn print_errors(errors: &[KilnError]) {
    for error in errors {
        print_error(error.clone());
    }
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
    let _ = writeln!(stderr, "{} error(s)", errors.len());
    let _ = stderr.reset();
}

pub fn print_written(paths: &[std::path::PathBuf]) {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);
    for path in paths {
        let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Green)));
        let _ = write!(stdout, "  wrote ");
        let _ = stdout.reset();
        let _ = writeln!(stdout, "{}", path.display());
    }
}

// ============================================================================
// PRIVATE HELPERS
// ============================================================================

fn print_diff(stdout: &mut StandardStream, diffs: &[Difference]) {
    for diff in diffs {
        let (prefix, color, text) = match diff {
            Difference::Same(x) => (' ', None, x),
            Difference::Add(x) => ('+', Some(Color::Green), x),
            Difference::Rem(x) => ('-', Some(Color::Red), x),
        };
        for line in text.lines() {
            let _ = stdout.set_color(ColorSpec::new().set_fg(color));
            let _ = writeln!(stdout, "{}{}", prefix, line);
        }
        let _ = stdout.reset();
    }
}
