// Tether Linux: control link, dispatcher, file transfer daemon.

mod config;
mod dispatcher;
mod fs;
mod heartbeat;
mod link;
mod outbox;
mod session;
mod transfer;

use anyhow::Context;
use tether_core::connection::Connection;
use tether_core::identity::MacAddress;
use tether_core::storage::StorageManager;
use tether_core::{SessionCore, SessionIdentity};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::outbox::Outbox;
use crate::session::Session;
use crate::transfer::HttpTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("tether-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load().context("loading configuration")?;
    init_tracing(&cfg);

    let mac = resolve_mac(&cfg)?;
    let identity = SessionIdentity::derive(mac, &cfg.node_prefix, &cfg.server_url);
    info!(node = %identity.node_id(), endpoint = %identity.endpoint(), version = VERSION, "starting");

    let dir = fs::DirFs::open(&cfg.storage_dir)
        .with_context(|| format!("opening storage directory {}", cfg.storage_dir.display()))?;
    let storage = StorageManager::open(dir, cfg.storage_capacity, cfg.reclaim())
        .context("scanning storage")?;
    let transport = HttpTransport::new(cfg.connect_timeout()).context("building http client")?;
    let core = SessionCore::new(identity.clone(), storage, cfg.transfer_limits());

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(async move {
        let (outbox, outbound) = Outbox::channel(cfg.outbound_depth, cfg.send_timeout());
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let session = Session::new(
            identity,
            Connection::new(cfg.max_reconnect_attempts, cfg.backoff_policy()),
            outbox,
            core.mirror(),
            link_tx,
            cfg.heartbeat_interval(),
        );
        let (queue_tx, queue_rx) = mpsc::channel(cfg.queue_depth.max(1));
        let dispatcher = Dispatcher::new(session.clone(), queue_tx, cfg.enqueue_timeout());

        tokio::spawn(dispatcher::run_worker(
            core,
            queue_rx,
            session.clone(),
            transport,
            cfg.transfer_idle_timeout(),
        ));
        tokio::spawn(link::run(
            session.clone(),
            dispatcher,
            link_rx,
            outbound,
            cfg.connect_timeout(),
        ));
        session.start();

        shutdown_signal().await?;
        info!("shutting down");
        session.shutdown();
        Ok::<(), anyhow::Error>(())
    })
}

/// RUST_LOG wins; otherwise the configured level.
fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Configured MAC, else the interface's hardware address.
fn resolve_mac(cfg: &Config) -> anyhow::Result<MacAddress> {
    if let Some(mac) = &cfg.mac {
        return mac.parse::<MacAddress>().context("parsing configured mac");
    }
    let path = format!("/sys/class/net/{}/address", cfg.interface);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading hardware address of {}", cfg.interface))?;
    text.parse::<MacAddress>()
        .with_context(|| format!("parsing hardware address from {path}"))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
