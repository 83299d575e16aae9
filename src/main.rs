use minol_mqtt_bridge::{
    BridgeConfig, DiscoveryPublisher, HttpSessionProvider, MqttTransport, PortalDataFetcher,
    SyncCoordinator, Topics,
};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Handlers go in before anything slow so an early SIGTERM is not lost.
    let shutdown = listen_for_shutdown();

    let config = BridgeConfig::load()?;
    init_tracing(&config.log_level);

    info!("Starting Minol MQTT bridge");
    config.log_config();

    let transport = MqttTransport::connect(&config.mqtt_settings());
    let publisher = DiscoveryPublisher::new(
        transport,
        Topics::new(&config.discovery_prefix, &config.state_prefix),
    );

    let mut coordinator = SyncCoordinator::new(
        HttpSessionProvider::new(config.base_url()),
        PortalDataFetcher::new(config.base_url()),
        publisher,
        config.credentials(),
        config.sync_settings(),
    )
    .with_references(config.references());

    coordinator
        .run(async {
            let _ = shutdown.await;
        })
        .await;
    info!("Minol MQTT bridge stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("minol_mqtt_bridge={}", level.to_lowercase())));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Registers the SIGINT and SIGTERM handlers before returning; the receiver
/// resolves on the first signal.
#[cfg(unix)]
fn listen_for_shutdown() -> oneshot::Receiver<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = oneshot::channel();
    let interrupt = signal(SignalKind::interrupt());
    let terminate = signal(SignalKind::terminate());

    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for(interrupt, "SIGINT") => {},
            _ = wait_for(terminate, "SIGTERM") => {},
        }
        info!("Shutdown signal received");
        let _ = tx.send(());
    });
    rx
}

#[cfg(unix)]
async fn wait_for(handler: std::io::Result<tokio::signal::unix::Signal>, name: &str) {
    match handler {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            warn!(error = %e, signal = name, "Failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
fn listen_for_shutdown() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        let _ = tx.send(());
    });
    rx
}
