//! Macro definitions: building, registering and expanding compiled macros.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{compile, compile_ok, counted_session, expr, session, shared_session, statements};
use kiln::compiler::loader::UnitNamespace;
use kiln::macros::{EntryKind, MacroOrchestrator, MacroState};
use kiln::types::TypeRef;
use kiln::{ErrorKind, NodeKind, Span};

const MAX: &str = "macro def max(a, b)\n  quote { `a` > `b` ? `a` : `b` }\nend\n";

// ============================================================================
// REGISTRATION
// ============================================================================

#[test]
fn greet_registers_one_required_untyped_argument() {
    let mut session = session();
    let compilation = compile_ok(&mut session, "macro def greet(name); \"Hello \" + name; end\n");
    assert!(statements(&compilation).is_empty());

    let script = session.types().get("Script").unwrap();
    let entries: Vec<_> = script.macros.named("greet").collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "greet");
    assert_eq!(entries[0].signature.encode(), "(R)N");
    assert_eq!(entries[0].argument_types, vec![TypeRef::Any]);
    assert_eq!(entries[0].kind, EntryKind::Macro);
}

#[test]
fn greet_runs_its_body_at_expansion_time() {
    let mut session = session();
    let compilation = compile_ok(
        &mut session,
        "macro def greet(name); \"Hello \" + name; end\ngreet(\"Bob\")\n",
    );
    let result = statements(&compilation)[0];
    match &result.kind {
        NodeKind::Str(text) => assert!(text.starts_with("Hello "), "got {text}"),
        other => panic!("expected a string literal, got {other:?}"),
    }
}

#[test]
fn definitions_are_replaced_by_noops() {
    let mut session = session();
    let compilation = compile_ok(&mut session, MAX);
    assert!(matches!(compilation.program.statements()[0].kind, NodeKind::Noop));
    let (_, definition) = session.definitions().iter().next().unwrap();
    assert_eq!(definition.state, MacroState::Resolved);
    assert_eq!(definition.owner, "Script");
}

// ============================================================================
// EXPANSION
// ============================================================================

#[test]
fn max_expands_to_a_conditional_at_the_call_site() {
    let mut session = session();
    let source = format!("{MAX}max(1, 2)\n");
    let compilation = compile_ok(&mut session, &source);

    let expanded = statements(&compilation)[0];
    assert_eq!(*expanded, expr("1 > 2 ? 1 : 2"));

    let start = source.find("max(1, 2)").unwrap();
    assert_eq!(expanded.span, Span::new(start, start + "max(1, 2)".len()));
    assert_eq!(compilation.expansions.len(), 1);
    assert_eq!(compilation.expansions[0].macro_name, "max");
}

#[test]
fn injected_arguments_keep_their_own_spans() {
    let mut session = session();
    let source = format!("{MAX}max(1, 2)\n");
    let compilation = compile_ok(&mut session, &source);

    let NodeKind::If { then_branch, .. } = &statements(&compilation)[0].kind else {
        panic!("expected a conditional");
    };
    let one = source.rfind("1,").unwrap();
    assert_eq!(then_branch.span, Span::new(one, one + 1));
}

#[test]
fn max_on_a_numeric_type_resolves_through_the_receiver() {
    let mut session = session();
    let source = "class Int\n  macro def max(a, b)\n    quote { `a` > `b` ? `a` : `b` }\n  end\nend\nx = 5\nx.max(1, 2)\n";
    let compilation = compile_ok(&mut session, source);

    let expanded = *statements(&compilation).last().unwrap();
    assert_eq!(*expanded, expr("1 > 2 ? 1 : 2"));
    let start = source.find("x.max").unwrap();
    assert_eq!(expanded.span, Span::new(start, start + "x.max(1, 2)".len()));
    assert!(session.types().get("Int").unwrap().macros.contains("max"));
}

#[test]
fn optional_arguments_use_their_defaults() {
    let mut session = session();
    let compilation = compile_ok(
        &mut session,
        "macro def add(a, b = 10)\n  quote { `a` + `b` }\nend\nadd(1)\nadd(1, 2)\n",
    );
    let results = statements(&compilation);
    assert_eq!(*results[0], expr("1 + 10"));
    assert_eq!(*results[1], expr("1 + 2"));

    let script = session.types().get("Script").unwrap();
    assert_eq!(script.macros.named("add").next().unwrap().signature.encode(), "(RO)N");
}

#[test]
fn macros_may_be_used_before_their_definition() {
    let mut session = session();
    let compilation = compile_ok(&mut session, &format!("max(3, 4)\n{MAX}"));
    assert_eq!(*statements(&compilation)[0], expr("3 > 4 ? 3 : 4"));
}

#[test]
fn runaway_expansion_is_cut_off() {
    let mut session = session();
    let compilation = compile(
        &mut session,
        "macro def forever(); quote { forever() }; end\nforever()\n",
    );
    let error = compilation.errors.first().expect("an error");
    assert!(matches!(error.kind, ErrorKind::MacroCompile { .. }));
    assert!(error.to_string().contains("expansion depth exceeded"));
}

// ============================================================================
// BLOCK-OPTIONAL MACROS
// ============================================================================

#[test]
fn optional_block_registers_two_entries() {
    let mut session = session();
    let compilation = compile_ok(
        &mut session,
        "macro maybe(x, &blk = nil) do\n  quote { `x` }\nend\nmaybe(5)\nmaybe(6) { 7 }\n",
    );

    let script = session.types().get("Script").unwrap();
    let entries: Vec<_> = script.macros.named("maybe").collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].signature.encode(), "(RB)N");
    assert_eq!(entries[0].kind, EntryKind::Macro);
    assert_eq!(entries[1].signature.encode(), "(R)N");
    assert_eq!(entries[1].kind, EntryKind::BlocklessOverload);
    assert_eq!(entries[0].handle.unit_name(), entries[1].handle.unit_name());

    assert_eq!(script.macros.resolve("maybe", 1, false).unwrap().kind, EntryKind::BlocklessOverload);
    assert_eq!(script.macros.resolve("maybe", 1, true).unwrap().kind, EntryKind::Macro);

    let results = statements(&compilation);
    assert_eq!(*results[0], expr("5"));
    assert_eq!(*results[1], expr("6"));
}

// ============================================================================
// ORCHESTRATION
// ============================================================================

#[test]
fn unit_names_are_unique_per_owner() {
    let mut session = session();
    compile_ok(
        &mut session,
        "macro def one(); quote { 1 }; end\nmacro def two(); quote { 2 }; end\n",
    );
    let names: Vec<_> = session
        .definitions()
        .iter()
        .filter_map(|(_, d)| d.unit_name.clone())
        .collect();
    assert_eq!(
        names,
        vec!["kiln.macros.Script$Extension1", "kiln.macros.Script$Extension2"]
    );
}

#[test]
fn inference_is_idempotent() {
    let (mut session, count) = counted_session();
    compile_ok(&mut session, "macro def one(); quote { 1 }; end\none()\none()\n");
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let (id, _) = session.definitions().iter().next().unwrap();
    MacroOrchestrator::new(&mut session).infer(id).unwrap();
    MacroOrchestrator::new(&mut session).infer(id).unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(session.types().get("Script").unwrap().macros.len(), 1);
    assert_eq!(session.definitions().len(), 1);
}

// ============================================================================
// FAILURES
// ============================================================================

#[test]
fn self_reference_is_required_before_defined() {
    let mut session = session();
    let compilation = compile(&mut session, "macro def rec(x)\n  rec(x)\nend\n");

    let error = compilation.errors.first().expect("an error");
    assert!(matches!(
        &error.kind,
        ErrorKind::MacroRequiredBeforeDefined { macro_name } if macro_name == "rec"
    ));
    assert!(error.to_string().contains("required before fully defined"));
    assert_eq!(error.span().start, 0);

    let (id, _) = session.definitions().iter().next().unwrap();
    assert_eq!(session.definitions().state(id), Some(MacroState::Failed));
    assert!(matches!(compilation.program.statements()[0].kind, NodeKind::Error(_)));
}

#[test]
fn compile_errors_point_at_the_definition() {
    let mut session = session();
    let source = "x = 1\nmacro def bad(x)\n  Missing.new\nend\n";
    let compilation = compile(&mut session, source);

    assert_eq!(compilation.errors.len(), 1);
    let error = &compilation.errors[0];
    assert!(matches!(error.kind, ErrorKind::MacroCompile { .. }));
    assert!(error.to_string().contains("Missing"));
    assert_eq!(error.span().start, source.find("macro").unwrap());
    assert!(error
        .diagnostic_info
        .help
        .as_deref()
        .is_some_and(|help| help.contains("Script$Extension1")));
}

#[test]
fn invalid_definitions_are_rejected_before_building() {
    let (mut session, count) = counted_session();
    let cases = [
        "macro def dup(a, a); quote { 1 }; end\n",
        "macro def late(a = 1, b); quote { 1 }; end\n",
        "macro def blk(&b, a); quote { 1 }; end\n",
        "macro late(&b = nil, a) do\n  quote { 1 }\nend\n",
    ];
    for case in cases {
        let compilation = compile(&mut session, case);
        let error = compilation.errors.first().unwrap_or_else(|| panic!("no error for {case}"));
        assert!(
            matches!(error.kind, ErrorKind::InvalidMacroDefinition { .. }),
            "{case}: {error}"
        );
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_definitions_leave_other_macros_intact() {
    let mut session = session();
    let compilation = compile(
        &mut session,
        &format!("{MAX}macro def bad(x); Missing.new; end\nmax(1, 2)\nbad(1)\n"),
    );
    assert_eq!(*statements(&compilation)[1], expr("1 > 2 ? 1 : 2"));
    assert!(compilation
        .errors
        .iter()
        .any(|e| matches!(e.kind, ErrorKind::MacroNotFound { .. })));
}

#[test]
fn sessions_sharing_a_namespace_pick_free_unit_names() {
    let namespace = Arc::new(UnitNamespace::new());
    compile_ok(&mut shared_session(namespace.clone()), "macro def m(); quote { 1 }; end\n");

    let mut second = shared_session(namespace.clone());
    let compilation = compile_ok(&mut second, "macro def m(); quote { 2 }; end\nm()\n");
    assert_eq!(*statements(&compilation)[0], expr("2"));
    let unit = second
        .definitions()
        .iter()
        .next()
        .and_then(|(_, d)| d.unit_name.clone());
    assert_eq!(unit.as_deref(), Some("kiln.macros.Script$Extension2"));
    assert_eq!(namespace.len(), 2);
}

#[test]
fn overflowing_macro_bodies_fail_instead_of_crashing() {
    let mut session = session();
    let compilation = compile(
        &mut session,
        "macro def m(a)\n  x = 0 - 9223372036854775807 - 1\n  -x\nend\nm(1)\n",
    );
    let error = compilation.errors.first().expect("an error");
    assert!(matches!(error.kind, ErrorKind::ExpansionFailed { .. }));
    assert!(error.to_string().contains("integer overflow"));
}

#[test]
fn macros_on_builtin_types_warn_about_metadata() {
    let mut session = session();
    let compilation = compile_ok(&mut session, "class Int\n  macro def twice(a); quote { `a` * 2 }; end\nend\n");
    assert_eq!(compilation.warnings.len(), 1);
    let warning = &compilation.warnings[0];
    assert!(warning.kind.is_warning());
    assert!(matches!(
        &warning.kind,
        ErrorKind::MetadataUnavailable { owner, macro_name } if owner == "Int" && macro_name == "twice"
    ));
    assert_eq!(session.warnings().len(), 1);
}
