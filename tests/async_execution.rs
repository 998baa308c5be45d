use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use stepwise::{
    ApiSurface, Backend, CancelToken, Engine, EngineConfig, EngineError, FunctionSignature,
    FunctionTable, RuntimeError, TranspileError, UnsupportedFeatureError, Value,
};

type Log = Arc<Mutex<Vec<String>>>;

fn surface(log: Log, token: CancelToken) -> Arc<dyn ApiSurface> {
    let fetch_log = log.clone();
    let add_log = log.clone();
    let stop_token = token.clone();
    Arc::new(
        FunctionTable::builder()
            .async_function(
                FunctionSignature::new("fetch")
                    .param("millis", "number")
                    .returns("number"),
                move |args| {
                    let log = fetch_log.clone();
                    async move {
                        let millis = args[0].as_f64().unwrap_or_default();
                        log.lock().push("fetch:start".into());
                        tokio::time::sleep(Duration::from_millis(millis as u64)).await;
                        log.lock().push("fetch:end".into());
                        Ok(Value::Number(millis))
                    }
                },
            )
            .function(
                FunctionSignature::new("add")
                    .param("a", "number")
                    .param("b", "number")
                    .returns("number"),
                move |args| {
                    add_log.lock().push("add".into());
                    Ok(Value::Number(
                        args[0].as_f64().unwrap_or_default() + args[1].as_f64().unwrap_or_default(),
                    ))
                },
            )
            .function(FunctionSignature::new("stop").returns("number"), move |_| {
                stop_token.cancel();
                Ok(Value::Number(0.0))
            })
            .cancellation(token)
            .build(),
    )
}

fn engine(backend: Backend) -> Engine {
    Engine::new(EngineConfig {
        backend,
        ..EngineConfig::default()
    })
}

#[tokio::test]
async fn async_calls_finish_before_the_next_step() {
    for backend in [Backend::Interpreter, Backend::Compiled] {
        let log: Log = Arc::default();
        let api = surface(log.clone(), CancelToken::new());
        let program = engine(backend)
            .parse(r#"{"steps":[{"func":"fetch","args":[5]},{"func":"add","args":[{"ref":0},1]}]}"#)
            .expect("parse");
        let value = engine(backend)
            .execute_async(&program, api)
            .await
            .expect("run");
        assert_eq!(value, Value::Number(6.0), "{}", backend);
        assert_eq!(*log.lock(), vec!["fetch:start", "fetch:end", "add"], "{}", backend);
    }
}

#[test]
fn cancellation_during_a_call_aborts_that_step() {
    for backend in [Backend::Interpreter, Backend::Compiled, Backend::Transpiled] {
        let log: Log = Arc::default();
        let api = surface(log.clone(), CancelToken::new());
        let result = engine(backend)
            .run_json(
                r#"{"steps":[{"func":"stop"},{"func":"add","args":[1,2]}]}"#,
                api,
            );
        assert!(
            matches!(
                result,
                Err(EngineError::Runtime(RuntimeError::Cancelled { step: 0 }))
            ),
            "{}: {:?}",
            backend,
            result
        );
        assert!(log.lock().is_empty(), "{}: later step ran", backend);
    }
}

#[test]
fn cancelled_token_stops_before_the_first_step() {
    for backend in [Backend::Interpreter, Backend::Compiled, Backend::Transpiled] {
        let token = CancelToken::new();
        token.cancel();
        let log: Log = Arc::default();
        let result = engine(backend).run_json(
            r#"{"steps":[{"func":"add","args":[1,2]}]}"#,
            surface(log.clone(), token),
        );
        assert!(matches!(
            result,
            Err(EngineError::Runtime(RuntimeError::Cancelled { step: 0 }))
        ));
        assert!(log.lock().is_empty());
    }
}

#[tokio::test]
async fn external_cancellation_interrupts_a_pending_call() {
    let token = CancelToken::new();
    let log: Log = Arc::default();
    let api = surface(log.clone(), token.clone());
    let engine = engine(Backend::Interpreter);
    let program = engine
        .parse(r#"{"steps":[{"func":"add","args":[1,1]},{"func":"fetch","args":[50]},{"func":"add","args":[1,2]}]}"#)
        .expect("parse");

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    });
    let result = engine.execute_async(&program, api).await;
    canceller.await.expect("canceller");

    assert!(matches!(
        result,
        Err(EngineError::Runtime(RuntimeError::Cancelled { step: 1 }))
    ));
    assert_eq!(*log.lock(), vec!["add", "fetch:start", "fetch:end"]);
}

#[test]
fn transpiler_rejects_async_functions() {
    let api = surface(Arc::default(), CancelToken::new());
    let result = engine(Backend::Transpiled).run_json(
        r#"{"steps":[{"func":"add","args":[1,2]},{"func":"fetch","args":[1]}]}"#,
        api,
    );
    match result {
        Err(EngineError::Transpile(TranspileError::Unsupported(
            UnsupportedFeatureError::AsyncCall { step, name },
        ))) => {
            assert_eq!(step, 1);
            assert_eq!(name, "fetch");
        }
        other => panic!("expected unsupported feature, got {:?}", other),
    }
}
