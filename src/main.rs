use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use push_relay::config::{Config, LogFormat};
use push_relay::feedback::FeedbackItem;
use push_relay::feedback_agent::{FeedbackAgent, FeedbackAgentConfig};
use push_relay::ident::IdentCounter;
use push_relay::listener::Listener;
use push_relay::metrics;
use push_relay::notification::Notification;
use push_relay::push_agent::{PushAgent, PushAgentConfig};
use push_relay::queue::PersistentQueue;
use push_relay::tls::TlsDialer;
use rusqlite::Connection;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// `0` clean shutdown, `1` configuration error, `2` boot-time resource
/// failure (gateway unreachable, control socket cannot bind).
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_RESOURCE_FAILURE: i32 = 2;

fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env().context("loading configuration") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    init_logging(config.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            std::process::exit(EXIT_RESOURCE_FAILURE);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => std::process::exit(0),
        Err(BootFailure::Config(e)) => {
            error!(error = ?e, "configuration error");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
        Err(BootFailure::Resource(e)) => {
            error!(error = ?e, "boot-time resource failure");
            std::process::exit(EXIT_RESOURCE_FAILURE);
        }
    }
}

enum BootFailure {
    Config(anyhow::Error),
    Resource(anyhow::Error),
}

async fn run(config: Config) -> std::result::Result<(), BootFailure> {
    metrics::init(config.metrics_bind.as_deref())
        .context("starting metrics exporter")
        .map_err(BootFailure::Resource)?;

    info!(
        push_gateway = ?config.push_gateway,
        feedback_gateway = ?config.feedback_gateway,
        push_concurrency = config.push_concurrency,
        "starting push relay daemon"
    );

    let conn = Arc::new(Mutex::new(
        Connection::open(&config.sqlite_path)
            .context("opening sqlite store")
            .map_err(BootFailure::Resource)?,
    ));
    let push_queue = PersistentQueue::<Notification>::open(conn.clone(), "notifications")
        .context("opening notification queue")
        .map_err(BootFailure::Resource)?;
    let feedback_queue = PersistentQueue::<FeedbackItem>::open(conn.clone(), "feedback")
        .context("opening feedback queue")
        .map_err(BootFailure::Resource)?;
    let ident = IdentCounter::open(conn).context("opening id counter").map_err(BootFailure::Resource)?;

    info!(
        pending_notifications = push_queue.qsize().unwrap_or(-1),
        pending_feedback = feedback_queue.qsize().unwrap_or(-1),
        "recovered durable queues"
    );

    let dialer = Arc::new(
        TlsDialer::new(&config.cacerts_file, &config.cert_file, &config.key_file)
            .context("building TLS dialer")
            .map_err(BootFailure::Config)?,
    );

    // Probe both gateways before doing anything else: a misconfigured
    // endpoint or bad certificate should fail startup loudly rather than
    // surface later as a silent, endlessly retrying worker.
    dialer
        .dial(&config.push_gateway, Duration::ZERO, "startup probe of push gateway")
        .await
        .context("could not reach push gateway at startup")
        .map_err(BootFailure::Resource)?;
    let feedback_probe = dialer
        .dial(&config.feedback_gateway, Duration::ZERO, "startup probe of feedback gateway")
        .await
        .context("could not reach feedback gateway at startup")
        .map_err(BootFailure::Resource)?;
    info!("startup connectivity probes to both gateways succeeded");

    for worker_id in 0..config.push_concurrency {
        let agent = PushAgent::new(
            push_queue.clone(),
            feedback_queue.clone(),
            dialer.clone(),
            PushAgentConfig {
                gateway: config.push_gateway.clone(),
                max_notification_lag: config.push_max_notification_lag,
                max_error_wait: config.push_max_error_wait,
                token_format: config.device_token_format,
            },
        );
        tokio::spawn(async move {
            agent.run().await;
            warn!(worker_id, "push agent exited");
        });
    }

    let feedback_agent = FeedbackAgent::new(
        feedback_queue.clone(),
        dialer.clone(),
        FeedbackAgentConfig {
            gateway: config.feedback_gateway.clone(),
            frequency: config.feedback_frequency,
            token_format: config.device_token_format,
        },
        Some(feedback_probe),
    );
    tokio::spawn(async move {
        feedback_agent.run().await;
        warn!("feedback agent exited");
    });

    let zmq_ctx = zmq::Context::new();
    let listener = Listener::bind(&zmq_ctx, &config.control_bind, push_queue, feedback_queue, ident)
        .context("binding control socket")
        .map_err(BootFailure::Resource)?;

    // The listener owns no async state, so it runs as a blocking task; this
    // call only returns if the control socket itself dies, which ends the
    // process since there would be nothing left to accept work.
    tokio::task::spawn_blocking(move || listener.run())
        .await
        .context("control socket listener task panicked")
        .map_err(BootFailure::Resource)?;

    Ok(())
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "warn".to_string()
        }
    });

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(EnvFilter::new(&log_level))
            .with(fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(EnvFilter::new(&log_level))
            .with(fmt::layer())
            .init(),
    }
}
