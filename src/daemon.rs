//! Daemon wiring: configuration loading and the long-running task set.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{format_err, Context, Error};
use futures::FutureExt;
use hyper::service::{make_service_fn, service_fn};
use tokio::sync::{mpsc, watch};

use pulse_api_types::ThresholdConfig;
use pulse_config::{
    load_or_create_key, DataDir, NodeStore, SystemConfig, ThresholdStore,
};

use crate::alerts::notify::Dispatcher;
use crate::alerts::{AlertEngine, LogNotifier, Notifier};
use crate::discovery;
use crate::history::{MetricsHistory, DEFAULT_CAPACITY};
use crate::poll::{PollContext, Supervisor};
use crate::reload;
use crate::server::{self, AppContext};
use crate::state::StateHub;

/// Everything read from disk before the runtime starts. Failures here map
/// to the dedicated exit codes.
pub struct LoadedConfig {
    pub data_dir: DataDir,
    pub nodes: NodeStore,
    pub system: SystemConfig,
    pub thresholds: ThresholdConfig,
}

/// Load or initialize the persisted state.
///
/// A [`pulse_config::CryptoFailure`] anywhere in the chain means the
/// encryption key and the node store disagree; the caller exits with the
/// key-mismatch code rather than touching the stored configuration.
pub fn load(base: &Path) -> Result<LoadedConfig, Error> {
    let data_dir = DataDir::new(base)?;
    let key = load_or_create_key(&data_dir.encryption_key_path())?;
    let nodes = NodeStore::load(&data_dir.nodes_path(), key)?;
    let system = SystemConfig::load(&data_dir.system_path())?;
    let thresholds = ThresholdStore::new(&data_dir).load()?;
    Ok(LoadedConfig {
        data_dir,
        nodes,
        system,
        thresholds,
    })
}

/// Run the daemon until SIGINT/SIGTERM.
pub async fn run(config: LoadedConfig) -> Result<(), Error> {
    let LoadedConfig {
        data_dir,
        nodes,
        system,
        thresholds,
    } = config;

    let listen: SocketAddr = system
        .listen
        .parse()
        .map_err(|err| format_err!("invalid listen address '{}' - {}", system.listen, err))?;

    let hub = StateHub::new();
    let history = Arc::new(MetricsHistory::new(DEFAULT_CAPACITY));
    let thresholds = Arc::new(RwLock::new(thresholds));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // alert pipeline: engine (driven by the supervisor) -> queue -> drain
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    let (_dispatch_stats, dispatcher) =
        Dispatcher::spawn(notifiers, event_rx, shutdown_rx.clone());
    let engine = AlertEngine::new(thresholds.clone(), event_tx);

    // poll engine
    let ctx = Arc::new(PollContext::new(Duration::from_secs(
        system.poll_interval_secs.max(1),
    )));
    let node_list = nodes.nodes().to_vec();
    let supervisor = Supervisor::new(ctx, hub.clone(), history.clone(), engine);
    let (reload_tx, reload_rx) = reload::channel();
    let supervisor_task =
        tokio::spawn(supervisor.run(node_list, reload_rx, shutdown_rx.clone()));

    let app = Arc::new(AppContext {
        hub: hub.clone(),
        history,
        nodes: Arc::new(tokio::sync::Mutex::new(nodes)),
        thresholds,
        threshold_store: ThresholdStore::new(&data_dir),
        data_dir,
        system: system.clone(),
        reload: reload_tx,
    });

    // discovery, when a subnet is configured
    let discovery_task = system.discovery_subnet.clone().map(|subnet| {
        let excluded: discovery::ExcludedHosts = {
            let app = app.clone();
            Arc::new(move || app.configured_hosts())
        };
        tokio::spawn(discovery::run_scanner(
            hub.clone(),
            subnet,
            Duration::from_secs(system.discovery_interval_secs.max(10)),
            excluded,
            shutdown_rx.clone(),
        ))
    });

    // SIGINT/SIGTERM request an orderly shutdown
    {
        let shutdown_tx = shutdown_tx.clone();
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("unable to install SIGTERM handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("got SIGINT"),
                _ = term.recv() => log::info!("got SIGTERM"),
            }
            let _ = shutdown_tx.send(true);
        });
    }

    let make_service = make_service_fn(move |_conn| {
        let app = app.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                let app = app.clone();
                server::handle(app, req).map(Ok::<_, std::convert::Infallible>)
            }))
        }
    });

    let server = hyper::Server::try_bind(&listen)
        .with_context(|| format!("unable to bind {}", listen))?
        .serve(make_service)
        .with_graceful_shutdown(shutdown_future(shutdown_rx.clone()));

    log::info!("pulse listening on {}", listen);
    server.await.context("http server failed")?;

    // orderly teardown: workers first, then the notifier drain (5 s
    // deadline inside the dispatcher)
    let _ = shutdown_tx.send(true);
    let _ = supervisor_task.await;
    let _ = dispatcher.await;
    if let Some(task) = discovery_task {
        let _ = task.await;
    }
    log::info!("shutdown complete");
    Ok(())
}

async fn shutdown_future(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.changed().await;
}
