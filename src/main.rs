use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use barrage::cli::validate::{load_workload, run_validate};
use barrage::cli::{Cli, Commands};
use barrage::engine::control::StopReason;
use barrage::engine::http_client::HttpClient;
use barrage::stats::MetricsRecorder;
use barrage::Engine;

/// Exit code when one or more thresholds failed.
const THRESHOLD_FAILURE_EXIT: i32 = 99;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn run(
    workload: Option<String>,
    config: Option<&Path>,
    base_url: Option<String>,
    seed: Option<u64>,
    json: bool,
    export_json: Option<&Path>,
) -> Result<i32> {
    let (workload, config) = load_workload(workload.as_deref(), config)?;
    let mut options = config.run_options(base_url.as_deref())?;
    if seed.is_some() {
        options.seed = seed;
    }

    let max_workers = workload.stages.iter().map(|s| s.target).max().unwrap_or(0);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;

    let _guard = runtime.enter();
    let client = HttpClient::with_pool_and_workers(
        HttpClient::pool_size_for_workers(max_workers),
        max_workers,
        options.request_timeout,
    )?;
    let engine = Engine::new(Arc::new(client));

    let summary = runtime.block_on(async move {
        let control = engine.control();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, ramping down");
                control.stop(StopReason::Interrupted);
            }
        });

        info!(
            shards = MetricsRecorder::shards_for_workers(max_workers),
            workers = num_cpus::get(),
            "runtime ready"
        );
        engine.run(workload, &options).await
    })?;

    if json {
        println!("{}", summary.to_json());
    } else {
        println!("{}", summary.metrics.to_json());
        for result in &summary.verdict.thresholds {
            println!(
                "  {} {}: {} (actual {:.4})",
                if result.passed { "✓" } else { "✗" },
                result.metric,
                result.predicate,
                result.actual
            );
        }
        println!(
            "{} after {:.1}s ({:?})",
            if summary.passed { "PASSED" } else { "FAILED" },
            summary.elapsed_ms as f64 / 1000.0,
            summary.stop_reason
        );
    }
    if let Some(path) = export_json {
        std::fs::write(path, summary.to_json())?;
        info!(path = %path.display(), "summary exported");
    }

    Ok(if summary.passed { 0 } else { THRESHOLD_FAILURE_EXIT })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            workload,
            config,
            base_url,
            seed,
            json,
            export_json,
        } => {
            let code = match run(workload, config.as_deref(), base_url, seed, json, export_json.as_deref()) {
                Ok(code) => code,
                Err(e) => {
                    error!(error = %format!("{:#}", e), "load test aborted");
                    return Err(e);
                }
            };
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Validate { workload, config } => run_validate(workload.as_deref(), config.as_deref()),
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(barrage::cli::config::Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "barrage", &mut std::io::stdout());
            Ok(())
        }
    }
}
