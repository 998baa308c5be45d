mod common;

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

use common::{BACKENDS, arithmetic_with_log, engine, shared};
use stepwise::{CompiledProgram, Engine, Program, TranspiledProgram, Value, parse_program};

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn programs_and_executables_cross_threads() {
    assert_send_sync::<Program>();
    assert_send_sync::<CompiledProgram>();
    assert_send_sync::<TranspiledProgram>();
    assert_send_sync::<Engine>();
}

#[test]
fn one_program_runs_on_every_backend_at_once() {
    let program = parse_program(
        r#"{"steps":[{"func":"mul","args":[3,5]},{"func":"mul","args":[2,7]},{"func":"add","args":[{"ref":0},{"ref":1}]}]}"#,
    )
    .expect("parse");
    let program = &program;

    let logs: Vec<Arc<Mutex<Vec<String>>>> =
        BACKENDS.iter().map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    thread::scope(|scope| {
        for (backend, log) in BACKENDS.into_iter().zip(&logs) {
            let api = shared(arithmetic_with_log(log.clone()));
            scope.spawn(move || {
                let engine = engine(backend);
                for _ in 0..25 {
                    let value = engine.execute(program, api.clone()).expect("run");
                    assert_eq!(value, Value::Number(29.0), "{}", backend);
                }
            });
        }
    });

    for (backend, log) in BACKENDS.into_iter().zip(&logs) {
        let calls = log.lock();
        assert_eq!(calls.len(), 75, "{}", backend);
        assert!(
            calls
                .chunks(3)
                .all(|chunk| chunk == ["mul", "mul", "add"]),
            "{}",
            backend
        );
    }
}
