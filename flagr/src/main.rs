mod config;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError, MetricsConfig};
use evaluator::{EvalContext, EvalError, FlagRef, build_cache};
use hyper::body::Bytes;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "flagr", about = "Feature flag evaluation service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the admin listener and keep the evaluation cache refreshed.
    Run(ConfigArgs),
    /// Load the flags once and write them in the json_file source format.
    Export {
        #[command(flatten)]
        config: ConfigArgs,
        /// Defaults to stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Load the flags once and evaluate a single flag for one entity.
    Eval {
        #[command(flatten)]
        config: ConfigArgs,
        /// Flag id or key.
        #[arg(long)]
        flag: String,
        #[arg(long)]
        entity_id: String,
        #[arg(long)]
        entity_type: Option<String>,
        /// Entity context as a JSON object.
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        debug: bool,
    },
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Startup(#[from] evaluator::ConfigurationError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        CliCommand::Run(args) => &args.config,
        CliCommand::Export { config, .. } | CliCommand::Eval { config, .. } => &config.config,
    };
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err}", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    let _sentry = init_logging(config.sentry_dsn());
    if let Some(metrics) = &config.metrics
        && let Err(err) = init_metrics(metrics)
    {
        tracing::error!(error = %err, "metrics disabled");
    }

    let result = match cli.command {
        CliCommand::Run(_) => run(config).await,
        CliCommand::Export { output, .. } => export(config, output.as_deref()).await,
        CliCommand::Eval {
            flag,
            entity_id,
            entity_type,
            context,
            debug,
            ..
        } => {
            let mut eval_context = EvalContext::new(entity_id).with_debug(debug);
            if let Some(entity_type) = entity_type {
                eval_context.entity_type = entity_type;
            }
            eval(config, &flag, eval_context, context.as_deref()).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "flagr exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so `export` and `eval` can write their output to stdout.
fn init_logging(sentry_dsn: Option<&str>) -> Option<sentry::ClientInitGuard> {
    let guard = sentry_dsn.map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = guard
        .is_some()
        .then(|| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let host = config.statsd_host.as_str();
    let recorder = metrics_exporter_statsd::StatsdBuilder::from(host, config.statsd_port)
        .build(Some("flagr"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| CliError::Metrics("a metrics recorder is already installed".into()))?;
    shared::metrics_defs::describe_all(evaluator::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

async fn run(config: Config) -> Result<(), CliError> {
    let cache = build_cache(&config.eval_cache).await?;
    let refresh = cache.spawn_refresh_loop();

    let ready_cache = cache.clone();
    let export_cache = cache.clone();
    let admin: AdminService<_, _, io::Error> = AdminService::new(
        move || ready_cache.is_ready(),
        move || match serde_json::to_vec(&export_cache.export()) {
            Ok(body) => Some(Bytes::from(body)),
            Err(err) => {
                tracing::error!(error = %err, "could not serialize evaluation cache");
                None
            }
        },
    );

    let listener = &config.admin_listener;
    let served = run_http_service(&listener.host, listener.port, admin, shutdown_signal()).await;

    refresh.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "could not listen for the shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn export(config: Config, output: Option<&Path>) -> Result<(), CliError> {
    let cache = build_cache(&config.eval_cache).await?;
    let mut json = serde_json::to_vec_pretty(&cache.export())?;
    json.push(b'\n');

    match output {
        Some(path) => tokio::fs::write(path, &json).await?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&json).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

async fn eval(
    config: Config,
    flag: &str,
    mut context: EvalContext,
    entity_context: Option<&str>,
) -> Result<(), CliError> {
    if let Some(raw) = entity_context {
        context.entity_context = serde_json::from_str(raw)?;
    }
    match FlagRef::parse(flag) {
        FlagRef::Id(id) => context.flag_id = Some(id),
        FlagRef::Key(key) => context.flag_key = Some(key),
    }

    let cache = build_cache(&config.eval_cache).await?;
    let result = cache.evaluate(&context)?;

    let mut json = serde_json::to_vec_pretty(&result)?;
    json.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&json).await?;
    stdout.flush().await?;
    Ok(())
}
