mod backoff;
mod client;
mod config;
mod correlation;
mod error;
mod health;
mod sandbox;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::RunnerClient;
use crate::config::Config;
use crate::correlation::CorrelationId;
use crate::health::HealthAggregator;
use crate::sandbox::{ExecuteRequest, ExecutionService};
use crate::server::{RunnerApi, ServerState};

/// Default configuration file for `serve`.
const DEFAULT_CONFIG_PATH: &str = "config/runner.toml";

/// Fallback runner address for `run-tests`.
const DEFAULT_RUNNER_URL: &str = "http://localhost:8080";

/// Command sent by `run-tests`.
const RUN_TESTS_COMMAND: &[&str] = &["pytest"];

fn print_help() {
    println!(
        "\
sandbox-runner v{}

A policy-gated command runner with dependency readiness checks.

USAGE:
    sandbox-runner [serve] [CONFIG_PATH]
    sandbox-runner run-tests [--path DIR] [--url URL] [CONFIG_PATH]

COMMANDS:
    serve        Start the HTTP API (default)
    run-tests    Run pytest in DIR on a remote runner and print the result

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]

OPTIONS:
    --path DIR       Project directory for run-tests [default: current directory]
    --url URL        Runner base URL for run-tests [default: $RUNNER_URL or {DEFAULT_RUNNER_URL}]
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} or
    ${{VAR_NAME:-default}} syntax.

    RUST_LOG         Log level filter for tracing
                     (e.g. debug, sandbox_runner=debug,warn)
    LOG_FORMAT       Set to \"json\" for JSON log lines
    ALLOWED_ROOT     Directory tree commands may run in
    RUNNER_URL       Runner base URL used by run-tests

EXAMPLES:
    sandbox-runner                                  # uses {DEFAULT_CONFIG_PATH}
    sandbox-runner serve /etc/runner/runner.toml    # custom config path
    sandbox-runner run-tests --path /tmp/project    # remote pytest run
    RUST_LOG=debug sandbox-runner                   # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

enum Mode {
    Serve {
        config_path: Option<String>,
    },
    RunTests {
        path: Option<PathBuf>,
        url: Option<String>,
        config_path: Option<String>,
    },
}

fn parse_args(args: &[String]) -> Result<Mode> {
    let mut args = args.iter();
    let mut run_tests = false;
    let mut path = None;
    let mut url = None;
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "serve" if !run_tests && config_path.is_none() => {}
            "run-tests" if config_path.is_none() => run_tests = true,
            "--path" if run_tests => {
                let value = args.next().ok_or_else(|| anyhow!("--path needs a value"))?;
                path = Some(PathBuf::from(value));
            }
            "--url" if run_tests => {
                let value = args.next().ok_or_else(|| anyhow!("--url needs a value"))?;
                url = Some(value.clone());
            }
            other if other.starts_with('-') => return Err(anyhow!("Unknown option: {other}")),
            other if config_path.is_none() => config_path = Some(other.to_string()),
            other => return Err(anyhow!("Unexpected argument: {other}")),
        }
    }

    Ok(if run_tests {
        Mode::RunTests {
            path,
            url,
            config_path,
        }
    } else {
        Mode::Serve { config_path }
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandbox_runner=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Handle --help / --version before anything else
    for arg in &args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sandbox-runner v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "--help" | "-h" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            _ => {}
        }
    }

    init_logging();

    let result = match parse_args(&args) {
        Ok(Mode::Serve { config_path }) => serve(config_path).await.map(|_| 0),
        Ok(Mode::RunTests {
            path,
            url,
            config_path,
        }) => run_tests(path, url, config_path).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => ExitCode::from(process_exit_code(code)),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Remote exit codes outside 0..=255 are reported as plain failure.
fn process_exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

/// An explicit path must load; a missing default file means defaults.
fn load_config(config_path: Option<String>) -> Result<Config> {
    let path = config_path
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    if config_path.is_none() && !std::path::Path::new(&path).exists() {
        info!("No configuration at {path}, using defaults");
        return Ok(Config::default());
    }
    info!("Loading configuration from {path}");
    Config::load(&path).map_err(|e| anyhow!("Cannot load {path}: {e}"))
}

async fn serve(config_path: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;

    let service = ExecutionService::from_config(&config.sandbox)?;
    info!("Allowed root: {}", service.policy().allowed_root().display());
    info!(
        "Allowed executables: {}",
        config.sandbox.allowed_executables.join(", ")
    );
    info!(
        "Default timeout: {}s, max concurrent executions: {}",
        config.sandbox.default_timeout_secs, config.sandbox.max_concurrent
    );

    let health = HealthAggregator::from_config(&config.health)?;
    let names: Vec<&str> = health.dependency_names().collect();
    if names.is_empty() {
        info!("Dependencies: none configured");
    } else {
        info!("Dependencies: {}", names.join(", "));
    }

    if config.health.validate_on_startup {
        info!("Validating dependencies before startup...");
        let readiness = health.check_readiness().await;
        health::log_readiness(&readiness);
        if !readiness.ready {
            return Err(anyhow!("Startup validation failed: required dependencies unavailable"));
        }
    }

    let state = ServerState {
        service: Arc::new(service),
        health: Arc::new(health),
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, exiting");
    };

    RunnerApi::serve(state, &config.server.bind_address(), shutdown).await
}

/// Runs pytest remotely and mirrors its output; returns the remote exit code.
async fn run_tests(
    path: Option<PathBuf>,
    url: Option<String>,
    config_path: Option<String>,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let project = match path {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    let project = std::path::absolute(&project)?;

    let url = url
        .or_else(|| std::env::var("RUNNER_URL").ok().filter(|u| !u.is_empty()))
        .unwrap_or_else(|| DEFAULT_RUNNER_URL.to_string());
    let client = RunnerClient::from_config(&url, &config.retry)?;

    let command = RUN_TESTS_COMMAND.iter().map(|s| s.to_string()).collect();
    let request = ExecuteRequest::new(project, command);
    let correlation_id = CorrelationId::new();

    if let Err(e) = client.health(correlation_id.clone()).await {
        eprintln!("Error: cannot connect to {url}");
        eprintln!("{e}");
        return Ok(1);
    }

    info!(%correlation_id, "Running tests via {url}");
    match client.execute(&request, correlation_id).await {
        Ok(result) => {
            if !result.stdout.is_empty() {
                println!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprintln!("{}", result.stderr);
            }
            println!("{}", result.summary());
            Ok(if result.timed_out() { 1 } else { result.exit_code })
        }
        Err(e) if e.is_dependency_unavailable() => {
            eprintln!("Error: runner unavailable at {url}: {e}");
            Ok(1)
        }
        Err(e) => {
            match e.code() {
                Some(code) => eprintln!("Error [{code}]: {e}"),
                None => eprintln!("Error: {e}"),
            }
            Ok(1)
        }
    }
}
