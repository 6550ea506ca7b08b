//! kata-runner: a parallel BDD test runner for HTTP services.
//!
//! Feature files in a Gherkin dialect are executed against live services
//! through an embedded script engine. The CLI is a thin shell: it resolves
//! features, builds a Suite, runs it and maps the outcome to an exit code.

mod bridge;
mod cache;
mod config;
mod driver;
mod errors;
mod feature;
mod http;
mod listener;
mod locks;
mod matching;
mod perf;
mod resource;
mod results;
mod runtime;
mod script;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};

use listener::{NdjsonListener, SummaryListener};
use runtime::suite::{Suite, SuiteOptions};
use telemetry::TelemetryOptions;

#[derive(Parser)]
#[command(name = "kata")]
#[command(about = "Parallel BDD test runner for HTTP services", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs feature files or directories of them.
    Run {
        /// Feature files or directories; a file may carry `:line` filters.
        #[arg(required = true)]
        paths: Vec<String>,

        /// Tag selector, e.g. `@smoke,~@wip` or `@env=dev`.
        #[arg(short, long)]
        tags: Option<String>,

        /// Parallel scenario workers.
        #[arg(short = 'T', long, default_value = "1")]
        threads: usize,

        /// Value surfaced as `karate.env`, selects karate-config-<env>.js.
        #[arg(short, long)]
        env: Option<String>,

        /// Report output directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory holding the karate-config scripts (defaults to the
        /// working directory).
        #[arg(long)]
        configdir: Option<PathBuf>,

        /// Parse and select without executing steps.
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Export traces to an OTLP collector.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// OTLP collector endpoint (falls back to
        /// OTEL_EXPORTER_OTLP_ENDPOINT, then localhost).
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Only errors on stderr; for CI.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Debug-level logging.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            paths,
            tags,
            threads,
            env,
            output,
            configdir,
            dry_run,
            otel,
            otel_endpoint,
            silent,
            verbose,
        } => {
            let log_level = if silent {
                Level::ERROR
            } else if verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            let otlp_endpoint = if otel {
                otel_endpoint
                    .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok())
                    .or_else(|| Some("http://localhost:4317".to_string()))
            } else {
                None
            };
            if let Err(e) = telemetry::init(&TelemetryOptions {
                log_level,
                otlp_endpoint,
            }) {
                eprintln!("warning: telemetry init failed: {}", e);
            }

            let code = run(paths, tags, threads, env, output, configdir, dry_run).await;
            telemetry::shutdown();
            std::process::exit(code);
        }
    }
}

async fn run(
    paths: Vec<String>,
    tags: Option<String>,
    threads: usize,
    env: Option<String>,
    output: Option<PathBuf>,
    configdir: Option<PathBuf>,
    dry_run: bool,
) -> i32 {
    let suite_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let output_dir = output.unwrap_or_else(|| PathBuf::from("target/karate-reports"));
    let options = SuiteOptions {
        paths,
        env,
        tag_selector: tags,
        thread_count: threads,
        suite_root,
        config_dir: configdir,
        output_dir: output_dir.clone(),
        build_dir: PathBuf::from("target"),
        dry_run,
    };

    let mut suite = match Suite::new(options) {
        Ok(suite) => suite,
        Err(e) => {
            error!(error = %e, "failed to build suite");
            return 2;
        }
    };
    match NdjsonListener::create(&output_dir) {
        Ok(listener) => suite.add_listener(Arc::new(listener)),
        Err(e) => warn!(error = %e, "ndjson output disabled"),
    }
    match SummaryListener::create(&output_dir) {
        Ok(listener) => suite.add_listener(Arc::new(listener)),
        Err(e) => warn!(error = %e, "summary output disabled"),
    }

    let result = suite.run().await;
    info!(
        features_passed = result.features_passed(),
        features_failed = result.features_failed(),
        scenarios_passed = result.scenarios_passed(),
        scenarios_failed = result.scenarios_failed(),
        duration_millis = result.duration_millis(),
        "done"
    );
    for feature in &result.feature_results {
        if let Some(message) = feature.first_error_message() {
            error!("{}", message);
        }
    }
    result.exit_code()
}
