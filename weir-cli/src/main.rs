//! CLI front-end for the `weir` streaming pipeline engine.
//!
//! Reads a YAML pipeline file describing engine knobs, an input/output file
//! pair, and a named processor chain, then drives the engine to completion
//! on `Ctrl+C`.
use std::fs;
use std::process;

use clap::{Args, Parser};
use tracing::{error, info};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

mod pipeline;

use pipeline::PipelineFile;

#[derive(Parser)]
#[command(name = "weir")]
#[command(bin_name = "weir")]
enum WeirCli {
    /// Validate a pipeline file without running it.
    Lint(LintArgs),
    /// Run a pipeline file to completion (until `Ctrl+C`).
    Run(RunArgs),
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct LintArgs {
    #[arg(short, long)]
    config: Vec<String>,
}

#[derive(clap::ValueEnum, Clone, Default, Debug)]
enum LogLevel {
    Info,
    Debug,
    Trace,
    Error,
    #[default]
    None,
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct RunArgs {
    #[arg(short, long)]
    config: String,
    #[arg(short, long, value_enum, default_value = "none")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() {
    match WeirCli::parse() {
        WeirCli::Lint(args) => lint(args),
        WeirCli::Run(args) => run(args).await,
    }
}

fn lint(args: LintArgs) {
    let mut failures: Vec<String> = Vec::new();
    for path in args.config {
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                failures.push(format!("failed to read {path}: {err}"));
                continue;
            }
        };

        let file = match PipelineFile::parse(&raw) {
            Ok(file) => file,
            Err(err) => {
                failures.push(format!("failed to parse {path}: {err}"));
                continue;
            }
        };

        if let Err(err) = file.build_processors() {
            failures.push(format!("failed to build processors for {path}: {err}"));
        }
    }

    if failures.is_empty() {
        println!("configuration is valid");
        process::exit(0);
    }

    for failure in &failures {
        eprintln!("{failure}");
    }
    process::exit(1);
}

async fn run(args: RunArgs) {
    setup_subscriber(args.log_level);

    let raw = match fs::read_to_string(&args.config) {
        Ok(raw) => raw,
        Err(err) => {
            error!(error = %err, config = %args.config, "failed to read pipeline file");
            process::exit(1);
        }
    };

    let file = match PipelineFile::parse(&raw) {
        Ok(file) => file,
        Err(err) => {
            error!(error = %err, "failed to parse pipeline file");
            process::exit(1);
        }
    };

    let engine = match file.into_engine().await {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "failed to construct engine");
            process::exit(1);
        }
    };

    let handle = engine.spawn();
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("received interrupt, shutting down");
    handle.cancel();

    if let Err(err) = handle.join().await {
        error!(error = %err, "pipeline ended with an error");
        process::exit(1);
    }

    info!("pipeline shut down cleanly");
    process::exit(0);
}

fn setup_subscriber(arg_log_level: LogLevel) {
    let log_level = match arg_log_level {
        LogLevel::Debug => Some(LevelFilter::DEBUG),
        LogLevel::Error => Some(LevelFilter::ERROR),
        LogLevel::Info => Some(LevelFilter::INFO),
        LogLevel::Trace => Some(LevelFilter::TRACE),
        LogLevel::None => None,
    };

    if let Some(level) = log_level {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::OFF.into())
            .from_env()
            .unwrap()
            .add_directive(format!("weir={level}").parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).compact().init();
    }
}
