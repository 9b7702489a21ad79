//! Bootstrap macros that expand without building an extension unit.

mod common;

use std::sync::atomic::Ordering;

use common::{compile, compile_ok, counted_session, expr, session, statements};
use kiln::errors::DiagnosticContext;
use kiln::{ErrorKind, Node, NodeKind};

#[test]
fn puts_lowers_to_println_without_compiling() {
    let (mut session, count) = counted_session();
    let compilation = compile_ok(&mut session, "puts(\"hi\")\n");

    let expanded = statements(&compilation)[0];
    assert_eq!(*expanded, expr("System.out.println(\"hi\")"));
    let NodeKind::Call { target, args, .. } = &expanded.kind else {
        panic!("expected a call");
    };
    assert_eq!(target.call_name(), Some("out"));
    assert_eq!(args[0], Node::string("hi", args[0].span));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn print_and_command_forms_expand_too() {
    let mut session = session();
    let compilation = compile_ok(&mut session, "print \"a\", 1\nputs\n");
    let results = statements(&compilation);
    assert_eq!(*results[0], expr("System.out.print(\"a\", 1)"));
    assert_eq!(*results[1], expr("System.out.println()"));
}

#[test]
fn puts_rejects_a_block() {
    let mut session = session();
    let compilation = compile(&mut session, "puts(1) { 2 }\n");
    assert!(matches!(
        compilation.errors[0].kind,
        ErrorKind::ExpansionFailed { .. }
    ));
}

#[test]
fn defmacro_is_an_alias_of_macro() {
    let mut session = session();
    let compilation = compile_ok(
        &mut session,
        "defmacro one() do\n  quote { 1 }\nend\none()\n",
    );
    assert_eq!(*statements(&compilation)[0], expr("1"));
}

#[test]
fn puts_inside_a_macro_body_runs_at_expansion_time() {
    let mut session = session();
    let compilation = compile_ok(
        &mut session,
        "macro def noisy(x)\n  puts \"expanding\"\n  x\nend\nnoisy(42)\n",
    );
    assert_eq!(*statements(&compilation)[0], expr("42"));
}

#[test]
fn puts_inside_a_quote_expands_at_the_call_site() {
    let mut session = session();
    let compilation = compile_ok(
        &mut session,
        "macro def say(x)\n  quote { puts `x` }\nend\nsay(\"hi\")\n",
    );
    assert_eq!(*statements(&compilation)[0], expr("System.out.println(\"hi\")"));
}

#[test]
fn inline_registry_can_be_extended() {
    fn answer(_: &DiagnosticContext, call: &Node) -> Result<Node, kiln::KilnError> {
        Ok(Node::fixnum(42, call.span))
    }

    let mut session = session();
    assert!(session.inline_macros().contains("puts"));
    session.inline_macros_mut().register("answer", answer);
    let compilation = compile_ok(&mut session, "answer()\n");
    assert_eq!(*statements(&compilation)[0], expr("42"));
}
