mod common;

use std::sync::Arc;

use common::{arithmetic, engine, shared};
use stepwise::error::Diagnostic;
use stepwise::transpile::{HostCompiler, LoadedUnit, TypeNameMapper, VALUE_TYPE};
use stepwise::{Backend, CompileError, EngineError, TypeRef, parse_program};

struct Rejecting;

impl HostCompiler for Rejecting {
    fn compile(&self, _source: &str) -> Result<Arc<dyn LoadedUnit>, Vec<Diagnostic>> {
        Err(vec![
            Diagnostic {
                line: 4,
                column: 9,
                message: "mismatched types".into(),
            },
            Diagnostic {
                line: 7,
                column: 1,
                message: "unused variable".into(),
            },
        ])
    }
}

#[test]
fn host_diagnostics_are_aggregated() {
    let engine = engine(Backend::Transpiled).with_host_compiler(Rejecting);
    let err = engine
        .run_json(r#"{"steps":[{"func":"add","args":[1,2]}]}"#, shared(arithmetic()))
        .expect_err("rejected");
    let EngineError::Compile(CompileError::Diagnostics(diagnostics)) = &err else {
        panic!("expected diagnostics, got {:?}", err);
    };
    assert_eq!(diagnostics.len(), 2);
    assert_eq!(
        err.to_string(),
        "Compile error: Host compilation failed:\n  4:9: mismatched types\n  7:1: unused variable"
    );
}

#[test]
fn emitted_source_matches_the_program_shape() {
    let program = parse_program(
        r#"{"steps":[{"func":"mul","args":[3,4]},{"func":"make_order","args":[{"label":"widget","total":{"ref":0}}]}]}"#,
    )
    .expect("parse");
    let source = engine(Backend::Transpiled)
        .transpile(&program, &arithmetic())
        .expect("transpile");

    assert!(source.starts_with(&format!(
        "// Generated by stepwise from program {}.\n",
        program.fingerprint()
    )));
    assert!(source.contains("use stepwise::transpile::prelude::*;"));
    assert!(source.contains(
        "fn object_0(api: &dyn ApiSurface, step_0: &f64) -> Result<Value, RuntimeError> {\n    let mut object = Object::new();\n    object.insert(\"label\".to_string(), Value::String(\"widget\".to_string()));\n    object.insert(\"total\".to_string(), Value::from(step_0.clone()));\n    Ok(Value::Object(object))\n}\n"
    ));
    assert!(source.contains(
        "    let step_1: Value = invoke(api, loc(1, &[]), \"make_order\", vec![object_0(api, &step_0)?])?;\n"
    ));
}

/// Keeps every local untyped
struct Untyped;

impl TypeNameMapper for Untyped {
    fn host_type(&self, _ty: &TypeRef) -> String {
        VALUE_TYPE.to_string()
    }
}

#[test]
fn custom_mapper_changes_local_types_not_results() {
    let json = r#"{"steps":[{"func":"mul","args":[3,4]},{"func":"sum","args":[{"ref":0},1]}]}"#;
    let typed = engine(Backend::Transpiled);
    let untyped = engine(Backend::Transpiled).with_type_mapper(Untyped);

    let program = typed.parse(json).expect("parse");
    let source = untyped.transpile(&program, &arithmetic()).expect("transpile");
    assert!(!source.contains("cast::<"));

    let a = typed.run_json(json, shared(arithmetic())).expect("typed run");
    let b = untyped.run_json(json, shared(arithmetic())).expect("untyped run");
    assert_eq!(a, b);
}
