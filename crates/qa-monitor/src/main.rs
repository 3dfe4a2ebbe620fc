use anyhow::{Context, Result};
use clap::Parser;
use qa_core::TestStatus;
use qa_telemetry::state::NotificationKind;
use qa_telemetry::{Listener, TelemetryConfig, TelemetryEngine, TestFilter};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Follows a QA telemetry stream and logs what the dashboard would show.
#[derive(Parser, Debug)]
#[command(name = "qa-monitor", version)]
struct Args {
    /// TOML file with telemetry settings.
    #[arg(long, env = "QA_PULSE_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long)]
    client_name: Option<String>,
    #[arg(long, default_value_t = false)]
    no_compression: bool,
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
    /// Seconds between summary lines; 0 disables them.
    #[arg(long, default_value_t = 30)]
    summary_interval: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn load_config(args: &Args) -> Result<TelemetryConfig> {
    let mut config = match &args.config {
        Some(path) => TelemetryConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TelemetryConfig::default(),
    };
    config
        .apply_env(|key| std::env::var(key).ok())
        .context("reading QA_PULSE_* environment")?;

    if let Some(url) = &args.url {
        config.url = url.clone();
    }
    if let Some(client_id) = &args.client_id {
        config.client_id = client_id.clone();
    }
    if let Some(client_name) = &args.client_name {
        config.client_name = client_name.clone();
    }
    if args.no_compression {
        config.supports_compression = false;
    }
    if let Some(attempts) = args.max_reconnect_attempts {
        config.max_reconnect_attempts = attempts;
    }
    config.validate().context("invalid telemetry settings")?;
    Ok(config)
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("QA_LOG") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging already initialized");
    }
}

fn dashboard_listener() -> Listener {
    Listener::named("qa-monitor")
        .on_connection_status(|status| {
            info!(event = "connection_status", status = %status);
        })
        .on_notifications(|notifications| {
            let Some(latest) = notifications.last() else {
                return;
            };
            match latest.kind {
                NotificationKind::Error => error!(event = "notification", message = %latest.message),
                NotificationKind::Warning => warn!(event = "notification", message = %latest.message),
                _ => info!(event = "notification", message = %latest.message),
            }
        })
        .on_agent_status_summary(|summary| {
            info!(
                event = "agents",
                total = summary.total,
                available = summary.available,
                busy = summary.busy,
                offline = summary.offline,
                error = summary.error,
                maintenance = summary.maintenance
            );
        })
        .on_queue_status(|queue| {
            if let Some(queue) = queue {
                info!(
                    event = "queue",
                    pending = queue.pending,
                    running = queue.running,
                    completed = queue.completed,
                    failed = queue.failed
                );
            }
        })
}

fn log_summary(engine: &TelemetryEngine) {
    let state = engine.state();
    let count = |status| engine.filter_tests(&TestFilter::status(status)).len();
    info!(
        event = "summary",
        connection = %state.connection_status,
        tests = state.tests.len(),
        running = count(TestStatus::Running),
        failed = count(TestStatus::Failed),
        agents = state.agents.len(),
        messages = state.stats.messages_received,
        reconnects = state.stats.reconnect_count,
        latency_ms = state.stats.latency_ms.unwrap_or_default()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    let config = load_config(&args)?;
    info!(
        event = "monitor_start",
        url = %config.url,
        client_id = %config.client_id
    );

    let engine = TelemetryEngine::new(config)?;
    engine.start_websocket()?;
    let _subscription = engine.subscribe(dashboard_listener());
    engine.connect().await?;

    let summary_every = Duration::from_secs(args.summary_interval);
    let mut summary = (!summary_every.is_zero()).then(|| {
        tokio::time::interval_at(tokio::time::Instant::now() + summary_every, summary_every)
    });
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = async {
                match summary.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => log_summary(&engine),
        }
    }

    info!(event = "monitor_stop");
    engine.shutdown().await;
    Ok(())
}
