//! Host monitor binary

use clap::Parser;
use pingwatch::server::{self, AppState};
use pingwatch::targets::load_targets;
use pingwatch::{
    AlertSink, Config, Engine, MonitorError, Notifier, Result, SystemProber, TimeSeriesStore,
    WebhookSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Ping a fixed set of hosts and alert when they go down")]
struct Args {
    /// File with one `hostname,address` pair per line
    #[arg(long, env = "TARGETS_FILE", default_value = "ips.txt")]
    targets: PathBuf,

    /// Address the dashboard listens on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:5000")]
    bind: String,
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    initialize_tracing();

    let args = Args::parse();
    info!("Starting pingwatch v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!("Monitor failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = Config::from_env()?;
    config.validate().map_err(MonitorError::Config)?;

    let targets = load_targets(&args.targets).await?;

    let capacity = config.effective_history_capacity();
    let store = match &config.history_file {
        Some(path) => match TimeSeriesStore::open(path, capacity).await {
            Ok(store) => store,
            Err(e) => {
                error!(
                    "History file {} unavailable, keeping history in memory only: {}",
                    path.display(),
                    e
                );
                TimeSeriesStore::in_memory(capacity)
            }
        },
        None => TimeSeriesStore::in_memory(capacity),
    };

    let sink: Option<Arc<dyn AlertSink>> = match &config.sink_url {
        Some(url) => Some(Arc::new(WebhookSink::new(url.clone(), config.notify_timeout)?)),
        None => None,
    };

    info!(
        "Configuration - targets: {}, poll: {:?}, grace: {:?}, tcp ports: {:?}, notifications: {}",
        targets.len(),
        config.poll_interval,
        config.grace_period,
        config.tcp_ports,
        if sink.is_some() { "enabled" } else { "disabled" }
    );

    let notifier = Notifier::spawn(sink);
    let prober = Arc::new(SystemProber::from_config(&config));
    let dashboard_refresh = config.dashboard_refresh;

    let engine = Engine::new(config, targets, prober, Arc::new(store), notifier);
    let reader = engine.reader();
    let mut engine_task = tokio::spawn(engine.run());

    let state = AppState {
        reader,
        dashboard_refresh,
    };

    tokio::select! {
        result = server::serve(state, &args.bind) => {
            result?;
            info!("HTTP server stopped");
        }
        joined = &mut engine_task => {
            if let Err(e) = joined {
                error!("Monitoring engine stopped unexpectedly: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    engine_task.abort();
    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
