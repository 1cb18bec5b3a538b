use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use bookend::engine::Policy;
use bookend::gateway::{CardGateway, LocalGateway};
use bookend::tenant::TenantManager;
use bookend::wire;

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_opt<T: FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

fn env_minutes(var: &str, default_minutes: i64) -> i64 {
    env_opt(var).unwrap_or(default_minutes) * 60_000
}

/// Runtime configuration, all sourced from `BOOKEND_*` environment variables.
struct Settings {
    bind: String,
    port: String,
    data_dir: String,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    policy: Policy,
}

impl Settings {
    fn from_env() -> Self {
        Settings {
            bind: env_or("BOOKEND_BIND", "0.0.0.0"),
            port: env_or("BOOKEND_PORT", "5433"),
            data_dir: env_or("BOOKEND_DATA_DIR", "./data"),
            password: env_or("BOOKEND_PASSWORD", "bookend"),
            max_connections: env_opt("BOOKEND_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: env_opt("BOOKEND_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: env_opt("BOOKEND_METRICS_PORT"),
            tls_cert: env_opt("BOOKEND_TLS_CERT"),
            tls_key: env_opt("BOOKEND_TLS_KEY"),
            policy: Policy {
                min_booking_ms: env_minutes("BOOKEND_MIN_BOOKING_MINUTES", 30),
                max_booking_ms: env_minutes("BOOKEND_MAX_BOOKING_MINUTES", 240),
                hold_window_ms: env_minutes("BOOKEND_HOLD_MINUTES", 15),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    bookend::observability::init(settings.metrics_port);

    let tls_acceptor =
        bookend::tls::load_tls_acceptor(settings.tls_cert.as_deref(), settings.tls_key.as_deref())?;
    std::fs::create_dir_all(&settings.data_dir)?;

    let gateway: Arc<dyn CardGateway> = Arc::new(LocalGateway);
    let tenant_manager = Arc::new(TenantManager::new(
        PathBuf::from(&settings.data_dir),
        settings.compact_threshold,
        settings.policy,
        gateway,
    ));
    let semaphore = Arc::new(Semaphore::new(settings.max_connections));

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("bookend listening on {addr}");
    info!("  data_dir: {}", settings.data_dir);
    info!(
        "  booking length: {}m..{}m, hold window: {}m",
        settings.policy.min_booking_ms / 60_000,
        settings.policy.max_booking_ms / 60_000,
        settings.policy.hold_window_ms / 60_000,
    );
    info!("  max_connections: {}", settings.max_connections);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    match settings.metrics_port {
        Some(p) => info!("  metrics: http://0.0.0.0:{p}/metrics"),
        None => info!("  metrics: disabled"),
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };
                // Rejected sockets drop here, closing them before the handshake
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    tracing::warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(bookend::observability::CONNECTIONS_REJECTED_TOTAL)
                        .increment(1);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(bookend::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(bookend::observability::CONNECTIONS_ACTIVE).increment(1.0);

                let tm = tenant_manager.clone();
                let password = settings.password.clone();
                let tls = tls_acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = wire::process_connection(socket, tm, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(bookend::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                    drop(permit);
                });
            }
        }
    }

    drain(&semaphore, settings.max_connections).await;
    info!("bookend stopped");
    Ok(())
}

/// Resolves when the process is told to stop (SIGTERM or ctrl-c).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Give in-flight connections up to ten seconds to finish after the accept
/// loop stops.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);

    loop {
        let open = max_connections - semaphore.available_permits();
        if open == 0 {
            info!("all connections drained");
            return;
        }
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!("drain timeout, {open} connections still open");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}
