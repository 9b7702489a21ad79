//! Macro metadata: descriptors written by one session and read by the next.

mod common;

use std::sync::Arc;

use common::{
    compile, compile_ok, expr, reading_session, round_trip_session, statements, writing_session,
};
use kiln::compiler::codegen::{unit_path, ReferenceCodegen};
use kiln::compiler::{Artifacts, UnitLoader};
use kiln::errors::{unspanned, DiagnosticContext, ErrorReporting, KilnError, SourceContext};
use kiln::macros::metadata::{DescriptorStore, MacroRecord, MacroSignature, ParamKind};
use kiln::macros::{EntryKind, MacroHandle};
use kiln::{ErrorKind, Session, SessionConfig};

const GREETER: &str = "class Greeter\n  macro def hello(name)\n    quote { \"Hello, \" + `name` }\n  end\n  macro wrap(x, &blk = nil) do\n    quote { `x` }\n  end\nend\n";

#[test]
fn descriptors_record_every_registration() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = writing_session(dir.path());
    compile_ok(&mut session, GREETER);

    let descriptor = DescriptorStore::new(dir.path())
        .read("Greeter")
        .unwrap()
        .expect("Greeter descriptor");
    assert_eq!(descriptor.name, "Greeter");
    assert_eq!(descriptor.superclass.as_deref(), Some("Object"));

    let records: Vec<_> = descriptor
        .macros
        .iter()
        .map(|r| (r.name.as_str(), r.signature.encode()))
        .collect();
    assert_eq!(
        records,
        vec![
            ("hello", "(R)N".to_string()),
            ("wrap", "(RB)N".to_string()),
            ("wrap", "(R)N".to_string()),
        ]
    );
    assert_eq!(descriptor.macros[1].unit, descriptor.macros[2].unit);
    for record in &descriptor.macros {
        assert!(unit_path(dir.path(), &record.unit).is_file(), "{}", record.unit);
    }
}

#[test]
fn later_sessions_reconstruct_macros_from_the_classpath() {
    let dir = tempfile::tempdir().unwrap();
    compile_ok(&mut writing_session(dir.path()), GREETER);

    let mut session = reading_session(dir.path());
    let compilation = compile_ok(
        &mut session,
        "Greeter.hello(\"Bob\")\nGreeter.wrap(1)\nGreeter.wrap(2) { 3 }\n",
    );
    let results = statements(&compilation);
    assert_eq!(*results[0], expr("\"Hello, \" + \"Bob\""));
    assert_eq!(*results[1], expr("1"));
    assert_eq!(*results[2], expr("2"));

    let greeter = session.types().get("Greeter").unwrap();
    let kinds: Vec<_> = greeter.macros.named("wrap").map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EntryKind::Macro, EntryKind::BlocklessOverload]);
    assert!(session.definitions().is_empty());
}

#[test]
fn script_macros_are_recorded_on_the_script_type() {
    let dir = tempfile::tempdir().unwrap();
    compile_ok(
        &mut writing_session(dir.path()),
        "macro def twice(x)\n  quote { `x` * 2 }\nend\n",
    );
    let descriptor = DescriptorStore::new(dir.path()).read("Script").unwrap().unwrap();
    assert_eq!(descriptor.macros.len(), 1);
    assert_eq!(descriptor.macros[0].unit, "kiln.macros.Script$Extension1");
}

#[test]
fn missing_units_fail_to_load() {
    let dir = tempfile::tempdir().unwrap();
    compile_ok(&mut writing_session(dir.path()), GREETER);
    let descriptor = DescriptorStore::new(dir.path()).read("Greeter").unwrap().unwrap();
    std::fs::remove_file(unit_path(dir.path(), &descriptor.macros[0].unit)).unwrap();

    let mut session = reading_session(dir.path());
    let compilation = compile(&mut session, "Greeter.hello(\"Bob\")\n");
    assert!(matches!(compilation.errors[0].kind, ErrorKind::MacroLoad { .. }));
}

#[test]
fn records_are_idempotent_and_encoded_compactly() {
    let signature = MacroSignature::new(vec![ParamKind::Required, ParamKind::Block]);
    let record = MacroRecord {
        name: "each".into(),
        signature: signature.clone(),
        unit: "kiln.macros.Script$Extension1".into(),
    };
    let mut descriptor = kiln::macros::TypeDescriptor::new("Script", Some("Object".into()));
    assert!(descriptor.add_macro_record(record.clone()));
    assert!(!descriptor.add_macro_record(record));
    assert_eq!(descriptor.macros.len(), 1);

    let json = serde_json::to_value(&descriptor).unwrap();
    assert_eq!(json["macros"][0]["signature"], "(RB)N");
}

// ============================================================================
// SESSIONS READING AND WRITING ONE DIRECTORY
// ============================================================================

const BYE: &str = "class Greeter\n  macro def bye(x)\n    quote { `x` }\n  end\nend\n";

fn macro_units(dir: &std::path::Path, type_name: &str) -> Vec<(String, String)> {
    DescriptorStore::new(dir)
        .read(type_name)
        .unwrap()
        .expect("descriptor")
        .macros
        .into_iter()
        .map(|r| (r.name, r.unit))
        .collect()
}

#[test]
fn imported_types_get_unit_names_that_are_not_taken() {
    let dir = tempfile::tempdir().unwrap();
    compile_ok(&mut writing_session(dir.path()), GREETER);

    let source = format!("Greeter.hello(\"Bob\")\n{BYE}Greeter.bye(1)\n");
    let compilation = compile_ok(&mut round_trip_session(dir.path()), &source);
    assert_eq!(*statements(&compilation)[0], expr("\"Hello, \" + \"Bob\""));
    assert_eq!(**statements(&compilation).last().unwrap(), expr("1"));

    let units = macro_units(dir.path(), "Greeter");
    assert_eq!(units[0], ("hello".into(), "kiln.macros.Greeter$Extension1".into()));
    assert_eq!(units[3], ("bye".into(), "kiln.macros.Greeter$Extension3".into()));

    let mut later = reading_session(dir.path());
    let compilation = compile_ok(&mut later, "Greeter.hello(\"Bob\")\nGreeter.bye(2)\n");
    let results = statements(&compilation);
    assert_eq!(*results[0], expr("\"Hello, \" + \"Bob\""));
    assert_eq!(*results[1], expr("2"));
}

#[test]
fn reopened_classpath_types_keep_their_macros() {
    let dir = tempfile::tempdir().unwrap();
    compile_ok(&mut writing_session(dir.path()), GREETER);

    let mut session = round_trip_session(dir.path());
    let compilation = compile_ok(&mut session, &format!("{BYE}Greeter.hello(\"Bob\")\n"));
    assert_eq!(
        **statements(&compilation).last().unwrap(),
        expr("\"Hello, \" + \"Bob\"")
    );
    assert!(session.types().get("Greeter").unwrap().macros.contains("wrap"));

    let names: Vec<_> = macro_units(dir.path(), "Greeter")
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["hello", "wrap", "wrap", "bye"]);

    let compilation = compile_ok(
        &mut reading_session(dir.path()),
        "Greeter.hello(\"Ann\")\nGreeter.bye(3)\n",
    );
    let results = statements(&compilation);
    assert_eq!(*results[0], expr("\"Hello, \" + \"Ann\""));
    assert_eq!(*results[1], expr("3"));
}

/// Loader that refuses every unit.
#[derive(Debug)]
struct RejectingLoader;

impl RejectingLoader {
    fn error(&self, fqn: &str) -> KilnError {
        DiagnosticContext::new(SourceContext::fallback(fqn), "load").report(
            ErrorKind::MacroLoad {
                unit: fqn.to_string(),
                reason: "verification failed".into(),
            },
            unspanned(),
        )
    }
}

impl UnitLoader for RejectingLoader {
    fn load_unit(&self, fqn: &str, _artifacts: &Artifacts) -> Result<Arc<dyn MacroHandle>, KilnError> {
        Err(self.error(fqn))
    }

    fn resolve_unit(&self, fqn: &str) -> Result<Arc<dyn MacroHandle>, KilnError> {
        Err(self.error(fqn))
    }

    fn contains_unit(&self, _fqn: &str) -> bool {
        false
    }
}

#[test]
fn failed_definitions_leave_no_artifact_behind() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        destination: Some(dir.path().to_path_buf()),
        ..SessionConfig::default()
    };
    let mut session = Session::with_backend(
        config,
        Box::new(ReferenceCodegen::new()),
        Box::new(RejectingLoader),
    );
    let compilation = compile(&mut session, "macro def m(); quote { 1 }; end\n");

    assert!(matches!(compilation.errors[0].kind, ErrorKind::MacroLoad { .. }));
    assert!(!unit_path(dir.path(), "kiln.macros.Script$Extension1").exists());
    assert!(macro_units(dir.path(), "Script").is_empty());
}
