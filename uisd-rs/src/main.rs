/* uisd entrypoint: sets up tracing, loads the service config, binds the control socket,
 * spawns the path monitor, and runs the dispatcher loop. */
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use uisd::manager::UisManager;
use uisd::node::DevOpener;
use uisd::target::datagram_port_factory;
use uisd::{config, monitor, server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting uisd-rs version {}", env!("CARGO_PKG_VERSION"));

    let config = config::load();
    info!(
        "Watching {:?}, control socket at {:?}",
        config.device_dir, config.control_socket
    );

    std::fs::create_dir_all(&config.runtime_dir)
        .with_context(|| format!("Creating runtime dir {:?}", config.runtime_dir))?;
    let listener = server::bind_control_socket(&config.control_socket)
        .with_context(|| format!("Binding {:?}", config.control_socket))?;

    let (queue_tx, queue_rx) = tokio::sync::mpsc::unbounded_channel();

    let manager = UisManager::new(
        Box::new(DevOpener),
        datagram_port_factory(config.runtime_dir.clone()),
        queue_tx.clone(),
    );

    /* Spawn the path monitor for device discovery and hot-plug. */
    let _monitor = monitor::start(queue_tx.clone(), config.device_dir.clone());

    tokio::spawn(server::run_control_listener(listener, queue_tx));

    /* The dispatcher loop blocks until shutdown. */
    server::run_dispatcher(manager, queue_rx).await;

    Ok(())
}
