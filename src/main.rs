use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use tavola::auth::Credentials;
use tavola::checkout::{CheckoutProvider, DisabledCheckout, HttpCheckoutProvider};
use tavola::config::Config;
use tavola::dispatch::{
    DisabledEmail, DisabledPush, Dispatcher, EmailProvider, HttpEmailProvider, HttpPushGateway, PushGateway,
};
use tavola::engine::Engine;
use tavola::notify::NotifyHub;
use tavola::{maintenance, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    tavola::observability::init(config.metrics_port)?;

    let tls_acceptor = tavola::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let timeout = config.http_timeout;
    let email: Arc<dyn EmailProvider> = match &config.email {
        Some(api) => Arc::new(HttpEmailProvider::new(api, timeout)?),
        None => Arc::new(DisabledEmail),
    };
    let push: Arc<dyn PushGateway> = match &config.push {
        Some(relay) => Arc::new(HttpPushGateway::new(relay, timeout)?),
        None => Arc::new(DisabledPush),
    };
    let checkout: Arc<dyn CheckoutProvider> = match &config.checkout {
        Some(api) => Arc::new(HttpCheckoutProvider::new(api, timeout)?),
        None => Arc::new(DisabledCheckout),
    };
    let dispatcher = Dispatcher::new(email, push, config.restaurant.clone()).with_deadline(timeout);

    let wal_path = PathBuf::from(&config.data_dir).join("tavola.wal");
    let engine = Arc::new(Engine::new(
        wal_path,
        Arc::new(NotifyHub::new()),
        config.policy.clone(),
        dispatcher,
        checkout,
    )?);
    tokio::spawn(maintenance::run_compactor(engine.clone(), config.compact_threshold));

    let credentials = Credentials {
        admin: config.admin_password.clone(),
        guest: config.guest_password.clone(),
    };
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("tavola listening on {addr}");
    config.log_summary();
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
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
                        metrics::counter!(tavola::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(tavola::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(tavola::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let credentials = credentials.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, credentials, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(tavola::observability::CONNECTIONS_ACTIVE).decrement(1.0);
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

    info!("tavola stopped");
    Ok(())
}
