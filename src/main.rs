//! Pipeline orchestrator - main entry point.
//!
//! Loads the TOML settings document, initializes logging and the database,
//! then runs the scheduler until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use ipa_orchestrator::api::{start_liveness_server, LivenessState};
use ipa_orchestrator::config::{
    Settings, CONFIG_ENV_VAR, CONTAINERIZED_ENV_VAR, HEALTHCHECK_PORT,
};
use ipa_orchestrator::db::DbPool;
use ipa_orchestrator::models::ExportTarget;
use ipa_orchestrator::pipeline::PipelineContext;
use ipa_orchestrator::scheduler::Scheduler;
use ipa_orchestrator::services::{GeoComputeClient, ObjectStore};

/// Resolve the settings path from `--toml <path>` or the environment.
fn settings_path_from_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(idx) = args.iter().position(|arg| arg == "--toml") {
        return args.get(idx + 1).map(PathBuf::from);
    }
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn is_containerized() -> bool {
    std::env::var(CONTAINERIZED_ENV_VAR)
        .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// File logging always; stdout logging too when containerized.
fn init_logging(settings: &Settings, containerized: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let log_file = &settings.logging.file;
    let directory = log_file.parent().unwrap_or(std::path::Path::new("."));
    let file_name = log_file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "ipa_orchestrator.log".to_string());
    let appender = tracing_appender::rolling::never(directory, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.logging.level.to_lowercase()));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);
    let stdout_layer = containerized.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    guard
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    let Some(settings_path) = settings_path_from_args() else {
        eprintln!(
            "Config error: {} env var or --toml argument required.",
            CONFIG_ENV_VAR
        );
        std::process::exit(1);
    };

    let settings = match Settings::load_from_toml(&settings_path) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    let containerized = is_containerized();
    let _log_guard = init_logging(&settings, containerized);

    info!("========================================");
    info!("  Snow pipeline orchestrator");
    info!("========================================");

    // The scheduler and every persisted timestamp honor the configured zone.
    // SAFETY: set before any thread reads the environment.
    unsafe { std::env::set_var("TZ", &settings.automation.timezone) };
    info!("Using timezone: {}", settings.automation.timezone);

    let db = match DbPool::connect(&settings.automation.db).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };
    info!("Database connection established");
    if let Err(e) = db.run_migrations().await {
        error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }
    info!("Database migrations complete");

    let tasks = match GeoComputeClient::from_credentials_file(&settings.google.credentials_file) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build compute-service client: {}", e);
            std::process::exit(1);
        }
    };

    let storage = match (
        settings.stats_export.export_target,
        settings.stats_export.storage_bucket.as_deref(),
    ) {
        (ExportTarget::Storage, Some(bucket)) => match ObjectStore::new(bucket).await {
            Ok(store) => Some(store),
            Err(e) => {
                // Degraded start: stats and website work will stay pending
                // until the store is reachable.
                warn!("Object store unavailable at startup: {}", e);
                None
            }
        },
        _ => None,
    };

    let ctx = Arc::new(PipelineContext::new(db, tasks, storage, settings.clone()));

    // Containerized deployments expose the liveness endpoint.
    let mut health_server = None;
    if containerized {
        let state = LivenessState::new(
            settings.automation.heartbeat.heartbeat_file.clone(),
            settings.automation.orchestration_job.interval_minutes,
        );
        match start_liveness_server(state, HEALTHCHECK_PORT) {
            Ok(server) => {
                info!("Liveness endpoint started on port {}", HEALTHCHECK_PORT);
                health_server = Some(tokio::spawn(server));
            }
            Err(e) => error!("Failed to start liveness endpoint: {}", e),
        }
    }

    let scheduler = match Scheduler::new(ctx) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Failed to build scheduler: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = scheduler.run().await {
        error!("Scheduler stopped with error: {}", e);
        std::process::exit(1);
    }

    if let Some(handle) = health_server {
        handle.abort();
    }
    info!("Shutdown complete");
    Ok(())
}
