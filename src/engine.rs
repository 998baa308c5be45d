//! Engine facade
//!
//! [`Engine`] owns the execution policy: which backend runs a program,
//! whether it is validated first, and how validation errors are reported.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::api::{ApiDescriptor, ApiSurface};
use crate::compiler;
use crate::error::{EngineError, Result};
use crate::interpreter;
use crate::program::{Program, parse_program};
use crate::transpile::loader::DEFAULT_CACHE_CAPACITY;
use crate::transpile::{self, HostCompiler, RustTypeMapper, SourceLoader, TypeNameMapper};
use crate::validator::{validate, validate_all};
use crate::value::Value;

/// Execution strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Tree-walking interpreter
    #[default]
    Interpreter,
    /// Lowered instruction list
    Compiled,
    /// Generated source loaded through a host compiler
    Transpiled,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Interpreter => "interpreter",
            Backend::Compiled => "compiled",
            Backend::Transpiled => "transpiled",
        })
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        match text {
            "interpreter" => Ok(Backend::Interpreter),
            "compiled" => Ok(Backend::Compiled),
            "transpiled" => Ok(Backend::Transpiled),
            other => Err(format!(
                "unknown backend '{}' (expected interpreter, compiled or transpiled)",
                other
            )),
        }
    }
}

/// Configuration for the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend used by [`Engine::execute`]
    pub backend: Backend,

    /// Validate programs before running them
    pub validate: bool,

    /// Report every validation error instead of the first
    pub collect_all_diagnostics: bool,

    /// Reject programs with more steps than this
    pub max_steps: Option<usize>,

    /// Loaded transpiled units kept by the built-in loader (0 disables caching)
    pub loader_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Interpreter,
            validate: true,
            collect_all_diagnostics: false,
            max_steps: None,
            loader_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("invalid engine config {}", path.display()))
    }

    /// Parse a JSON config document; missing fields take their defaults
    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Parses, checks and runs programs according to an [`EngineConfig`]
pub struct Engine {
    config: EngineConfig,
    mapper: Arc<dyn TypeNameMapper>,
    host: Arc<dyn HostCompiler>,
}

impl Engine {
    /// Create an engine using [`RustTypeMapper`] and [`SourceLoader`] for the
    /// transpiled backend
    pub fn new(config: EngineConfig) -> Self {
        let host = SourceLoader::with_capacity(config.loader_cache_capacity);
        Self {
            config,
            mapper: Arc::new(RustTypeMapper),
            host: Arc::new(host),
        }
    }

    /// Replace the type name mapper used for transpilation
    pub fn with_type_mapper(mut self, mapper: impl TypeNameMapper + 'static) -> Self {
        self.mapper = Arc::new(mapper);
        self
    }

    /// Replace the host compiler used for transpiled programs
    pub fn with_host_compiler(mut self, host: impl HostCompiler + 'static) -> Self {
        self.host = Arc::new(host);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parse a program document and apply the step limit
    pub fn parse(&self, json: &str) -> Result<Program> {
        let program = parse_program(json)?;
        self.check_limits(&program)?;
        Ok(program)
    }

    /// Validate `program` against `api` using the configured reporting mode
    pub fn check(&self, program: &Program, api: &dyn ApiDescriptor) -> Result<()> {
        self.check_limits(program)?;
        if self.config.collect_all_diagnostics {
            validate_all(program, api).map_err(EngineError::ValidationReport)
        } else {
            validate(program, api).map_err(EngineError::from)
        }
    }

    /// Run `program` on the configured backend, blocking on async calls
    pub fn execute(&self, program: &Program, api: Arc<dyn ApiSurface>) -> Result<Value> {
        futures::executor::block_on(self.execute_async(program, api))
    }

    /// Run `program` on the configured backend
    ///
    /// The transpiled backend runs synchronously and rejects asynchronous
    /// functions before loading.
    pub async fn execute_async(&self, program: &Program, api: Arc<dyn ApiSurface>) -> Result<Value> {
        if self.config.validate {
            self.check(program, &api)?;
        } else {
            self.check_limits(program)?;
        }

        tracing::debug!(
            backend = %self.config.backend,
            steps = program.len(),
            "executing program"
        );
        let value = match self.config.backend {
            Backend::Interpreter => interpreter::run_async(program, api.as_ref()).await?,
            Backend::Compiled => compiler::compile(program, api)?.invoke_async().await?,
            Backend::Transpiled => {
                transpile::load(program, api, self.mapper.as_ref(), self.host.as_ref())?
                    .invoke()?
            }
        };
        Ok(value)
    }

    /// Parse and run a program document
    pub fn run_json(&self, json: &str, api: Arc<dyn ApiSurface>) -> Result<Value> {
        let program = self.parse(json)?;
        self.execute(&program, api)
    }

    /// Emit host source for `program` with the configured mapper
    pub fn transpile(&self, program: &Program, api: &dyn ApiDescriptor) -> Result<String> {
        if self.config.validate {
            self.check(program, api)?;
        }
        Ok(transpile::transpile(program, api, self.mapper.as_ref())?)
    }

    fn check_limits(&self, program: &Program) -> Result<()> {
        match self.config.max_steps {
            Some(limit) if program.len() > limit => Err(EngineError::TooManySteps {
                limit,
                actual: program.len(),
            }),
            _ => Ok(()),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FunctionSignature, FunctionTable};
    use crate::error::ValidationError;

    fn surface() -> Arc<dyn ApiSurface> {
        Arc::new(
            FunctionTable::builder()
                .function(
                    FunctionSignature::new("inc").param("x", "number").returns("number"),
                    |args| Ok(Value::Number(args[0].as_f64().unwrap_or_default() + 1.0)),
                )
                .build(),
        )
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = EngineConfig::from_json_str(r#"{"backend":"compiled"}"#).expect("config");
        assert_eq!(config.backend, Backend::Compiled);
        assert!(config.validate);
        assert!(!config.collect_all_diagnostics);
        assert_eq!(config.max_steps, None);
        assert_eq!(config.loader_cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn backend_names_round_trip() {
        for backend in [Backend::Interpreter, Backend::Compiled, Backend::Transpiled] {
            assert_eq!(backend.to_string().parse::<Backend>(), Ok(backend));
        }
        assert!("jit".parse::<Backend>().is_err());
    }

    #[test]
    fn every_backend_runs_the_same_program() {
        let json = r#"{"steps":[{"func":"inc","args":[1]},{"func":"inc","args":[{"ref":0}]}]}"#;
        for backend in [Backend::Interpreter, Backend::Compiled, Backend::Transpiled] {
            let engine = Engine::new(EngineConfig {
                backend,
                ..EngineConfig::default()
            });
            assert_eq!(
                engine.run_json(json, surface()).expect("run"),
                Value::Number(3.0),
                "{}",
                backend
            );
        }
    }

    #[test]
    fn collects_all_validation_errors_when_configured() {
        let engine = Engine::new(EngineConfig {
            collect_all_diagnostics: true,
            ..EngineConfig::default()
        });
        let program = engine
            .parse(r#"{"steps":[{"func":"a"},{"func":"b"}]}"#)
            .expect("parse");
        match engine.execute(&program, surface()) {
            Err(EngineError::ValidationReport(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected report, got {:?}", other),
        }

        let fail_fast = Engine::default();
        assert!(matches!(
            fail_fast.execute(&program, surface()),
            Err(EngineError::Validation(ValidationError::FunctionNotFound { .. }))
        ));
    }

    #[test]
    fn step_limit_is_enforced_at_parse_time() {
        let engine = Engine::new(EngineConfig {
            max_steps: Some(1),
            ..EngineConfig::default()
        });
        assert!(matches!(
            engine.parse(r#"{"steps":[{"func":"inc","args":[1]},{"func":"inc","args":[2]}]}"#),
            Err(EngineError::TooManySteps {
                limit: 1,
                actual: 2
            })
        ));
    }
}
