//! Stepwise CLI - check, run and transpile step programs
//!
//! Programs run against a small built-in surface of arithmetic and string
//! functions.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stepwise::{
    ApiSurface, Backend, CallError, Engine, EngineConfig, FunctionSignature, FunctionTable, Value,
};

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Parse, validate and execute JSON step programs", long_about = None)]
struct Cli {
    /// Engine config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend override
    #[arg(short, long)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a program without running it
    Check {
        /// Program file
        program: PathBuf,
    },

    /// Run a program and print its result
    Run {
        /// Program file
        program: PathBuf,
    },

    /// Print the generated Rust source for a program
    Transpile {
        /// Program file
        program: PathBuf,
    },

    /// List the functions of the built-in surface
    Functions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    let engine = Engine::new(config);
    let surface = demo_surface();

    match cli.command {
        Commands::Check { program } => {
            let program = engine.parse(&read(&program)?)?;
            engine.check(&program, &surface)?;
            println!("ok: {} step(s), fingerprint {}", program.len(), program.fingerprint());
        }

        Commands::Run { program } => {
            let program = engine.parse(&read(&program)?)?;
            let api: Arc<dyn ApiSurface> = Arc::new(surface);
            let value = engine.execute_async(&program, api).await?;
            println!("{}", value);
        }

        Commands::Transpile { program } => {
            let program = engine.parse(&read(&program)?)?;
            print!("{}", engine.transpile(&program, &surface)?);
        }

        Commands::Functions => {
            for signature in surface.signatures() {
                let params: Vec<String> = signature
                    .params
                    .iter()
                    .map(|param| format!("{}: {}", param.name, param.ty))
                    .collect();
                println!(
                    "{}{}({}) -> {}",
                    if signature.is_async { "async " } else { "" },
                    signature.name,
                    params.join(", "),
                    signature.returns
                );
            }
        }
    }

    Ok(())
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn number(args: &[Value], index: usize) -> Result<f64, CallError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| CallError::InvalidArgument {
            index,
            message: "expected a number".into(),
        })
}

fn binary(name: &str) -> FunctionSignature {
    FunctionSignature::new(name)
        .param("a", "number")
        .param("b", "number")
        .returns("number")
}

fn demo_surface() -> FunctionTable {
    FunctionTable::builder()
        .function(binary("add"), |args| Ok(Value::Number(number(args, 0)? + number(args, 1)?)))
        .function(binary("sub"), |args| Ok(Value::Number(number(args, 0)? - number(args, 1)?)))
        .function(binary("mul"), |args| Ok(Value::Number(number(args, 0)? * number(args, 1)?)))
        .function(binary("div"), |args| {
            let divisor = number(args, 1)?;
            if divisor == 0.0 {
                return Err(CallError::failed("division by zero"));
            }
            Ok(Value::Number(number(args, 0)? / divisor))
        })
        .function(
            FunctionSignature::new("sum").param("values", "number[]").returns("number"),
            |args| {
                let values = args.first().and_then(Value::as_array).unwrap_or_default();
                Ok(Value::Number(values.iter().filter_map(Value::as_f64).sum()))
            },
        )
        .function(
            FunctionSignature::new("concat").param("parts", "string[]").returns("string"),
            |args| {
                let parts = args.first().and_then(Value::as_array).unwrap_or_default();
                Ok(Value::String(parts.iter().filter_map(Value::as_str).collect()))
            },
        )
        .function(
            FunctionSignature::new("upper").param("text", "string").returns("string"),
            |args| {
                let text = args.first().and_then(Value::as_str).unwrap_or_default();
                Ok(Value::String(text.to_uppercase()))
            },
        )
        .function(
            FunctionSignature::new("length").param("text", "string").returns("number"),
            |args| {
                let text = args.first().and_then(Value::as_str).unwrap_or_default();
                Ok(Value::Number(text.chars().count() as f64))
            },
        )
        .async_function(
            FunctionSignature::new("delay")
                .param("millis", "number")
                .param("value", "any")
                .returns("any"),
            |args| async move {
                let millis = number(&args, 0)?;
                tokio::time::sleep(Duration::from_millis(millis.max(0.0) as u64)).await;
                Ok(args.get(1).cloned().unwrap_or_default())
            },
        )
        .build()
}
