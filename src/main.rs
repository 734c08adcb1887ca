use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use fleetbook::audit::{AuditSink, JsonlAuditLog, TracingAuditSink};
use fleetbook::config::Config;
use fleetbook::engine::Engine;
use fleetbook::notify::NotifyHub;
use fleetbook::registry::InMemoryRegistry;
use fleetbook::wire::{self, FleetFactory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    let Some(password) = config.password.clone() else {
        return Err("FLEETBOOK_PASSWORD must be set".into());
    };
    fleetbook::observability::init(config.metrics_port)?;

    let tls_acceptor = fleetbook::tls::acceptor_from_config(&config)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let registry = match &config.registry_path {
        Some(path) => InMemoryRegistry::load(path)?,
        None => InMemoryRegistry::new(),
    };
    let (vehicles, drivers, users) = registry.counts();
    info!(vehicles, drivers, users, "registry loaded");
    if users == 0 {
        tracing::warn!("registry has no users; every login will be refused");
    }
    let audit: Arc<dyn AuditSink> = match &config.audit_log {
        Some(path) => Arc::new(JsonlAuditLog::open(path).await?),
        None => Arc::new(TracingAuditSink),
    };
    let hub = Arc::new(NotifyHub::new());

    // Notices have no outbound channel yet; surface them in the log.
    let mut notices = hub.subscribe_all();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => tracing::debug!(kind = notice.kind(), ?notice, "notice"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("notice log lagged, {n} dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let engine = Arc::new(Engine::new(
        config.wal_path(),
        Arc::new(registry),
        audit,
        hub,
    )?);
    info!("replayed {} bookings", engine.booking_count());
    tokio::spawn(fleetbook::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    let factory = FleetFactory::new(engine.clone(), config.hours, password);
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("fleetbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  hours: {}-{}", config.hours.open_str(), config.hours.close_str());
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(fleetbook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(fleetbook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(fleetbook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(fleetbook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("fleetbook stopped");
    Ok(())
}
