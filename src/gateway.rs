//! # Gateway Orchestration
//!
//! Owns every subsystem and the task set: the TinyBMS poller (or the
//! simulator), the CAN RX/keep-alive worker, the publisher scheduler, and
//! the persistence worker. Snapshot listeners run synchronously on the
//! poll task in registration order: integrator, CVL engine, then the
//! publisher, so the encoders always see limits and totals no older than
//! the snapshot.
//!
//! Teardown is cooperative: every task observes the shutdown flag between
//! iterations, gets up to a second to finish, and is aborted as a last
//! resort.

use crate::config::GatewayConfig;
use crate::energy::{
    restore_from_store, run_persistence_worker, EnergyIntegrator, JsonFileStore, KeyValueStore,
    PersistRequest,
};
use crate::error::Error;
use crate::model::live_data::LiveData;
use crate::model::simulator::{BmsSimulator, SimulatorConfig};
use crate::model::store::LiveDataStore;
use crate::tinybms::client::TinyBmsClient;
use crate::tinybms::serial::TinyBmsTransport;
use crate::victron::can::{CanBus, CanDriver};
use crate::victron::cvl::CvlEngine;
use crate::victron::events::EventBus;
use crate::victron::publisher::Publisher;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Grace period per task during shutdown.
const DEINIT_GRACE: Duration = Duration::from_secs(1);

/// Subsystems shared by the hardware and simulated variants.
struct Wiring {
    events: EventBus,
    store: LiveDataStore,
    integrator: Arc<EnergyIntegrator>,
    cvl: Arc<CvlEngine>,
    driver: Arc<CanDriver>,
    publisher: Arc<Publisher>,
    kv_store: Arc<dyn KeyValueStore>,
    persist_rx: mpsc::Receiver<PersistRequest>,
}

/// A running gateway and its task set.
pub struct Gateway {
    store: LiveDataStore,
    integrator: Arc<EnergyIntegrator>,
    cvl: Arc<CvlEngine>,
    driver: Arc<CanDriver>,
    events: EventBus,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Gateway {
    /// Wires the subsystems together and spawns the task set.
    ///
    /// The serial port and the CAN controller come from the caller so tests
    /// can hand in mocks.
    pub async fn start<P, B>(
        config: GatewayConfig,
        serial_port: P,
        can_bus: Arc<B>,
    ) -> Result<Gateway, Error>
    where
        P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: CanBus + 'static,
    {
        let wiring = assemble(&config, can_bus).await?;

        let transport = Arc::new(TinyBmsTransport::with_port(
            serial_port,
            config.serial.clone(),
        ));
        let client = Arc::new(TinyBmsClient::new(
            transport,
            wiring.store.clone(),
            config.poll.clone(),
        ));

        Self::launch(wiring, move |rx| {
            tokio::spawn(async move { client.run(rx).await })
        })
    }

    /// Like [`start`], but snapshots come from the built-in simulator
    /// instead of a serial TinyBMS. Useful on a bench with only the CAN
    /// side connected.
    pub async fn start_simulated<B>(
        config: GatewayConfig,
        can_bus: Arc<B>,
    ) -> Result<Gateway, Error>
    where
        B: CanBus + 'static,
    {
        let wiring = assemble(&config, can_bus).await?;
        let simulator = Arc::new(BmsSimulator::new(
            wiring.store.clone(),
            SimulatorConfig {
                cycle: config.poll.cycle,
                series_cell_count: config.cvl.series_cell_count,
                ..SimulatorConfig::default()
            },
        ));

        Self::launch(wiring, move |rx| {
            tokio::spawn(async move { simulator.run(rx).await })
        })
    }

    /// Spawns the common workers plus the snapshot source built by
    /// `spawn_source`.
    fn launch(
        wiring: Wiring,
        spawn_source: impl FnOnce(watch::Receiver<bool>) -> JoinHandle<()>,
    ) -> Result<Gateway, Error> {
        let Wiring {
            events,
            store,
            integrator,
            cvl,
            driver,
            publisher,
            kv_store,
            persist_rx,
        } = wiring;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push(("poller", spawn_source(shutdown_rx.clone())));
        {
            let driver = driver.clone();
            let rx = shutdown_rx.clone();
            tasks.push(("can-worker", tokio::spawn(async move { driver.run(rx).await })));
        }
        {
            let publisher = publisher.clone();
            let rx = shutdown_rx.clone();
            tasks.push((
                "publisher",
                tokio::spawn(async move { publisher.run(rx).await }),
            ));
        }
        {
            let integrator = integrator.clone();
            let rx = shutdown_rx;
            tasks.push((
                "persistence",
                tokio::spawn(async move {
                    run_persistence_worker(integrator, kv_store, persist_rx, rx).await
                }),
            ));
        }

        info!("gateway started with {} tasks", tasks.len());
        Ok(Gateway {
            store,
            integrator,
            cvl,
            driver,
            events,
            shutdown_tx,
            tasks,
        })
    }

    pub fn store(&self) -> &LiveDataStore {
        &self.store
    }

    pub fn integrator(&self) -> &Arc<EnergyIntegrator> {
        &self.integrator
    }

    pub fn cvl(&self) -> &Arc<CvlEngine> {
        &self.cvl
    }

    pub fn can_driver(&self) -> &Arc<CanDriver> {
        &self.driver
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Cooperative shutdown: raise the flag, give each task a bounded wait,
    /// abort whatever is left.
    pub async fn deinit(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, mut handle) in self.tasks {
            match timeout(DEINIT_GRACE, &mut handle).await {
                Ok(Ok(())) => info!("task '{name}' exited cleanly"),
                Ok(Err(e)) => warn!("task '{name}' ended abnormally: {e}"),
                Err(_) => {
                    warn!("task '{name}' ignored shutdown for {DEINIT_GRACE:?}, aborting");
                    handle.abort();
                }
            }
        }
        info!("gateway stopped");
    }
}

/// Builds every subsystem shared by both start variants and registers the
/// snapshot listeners in their load-bearing order.
async fn assemble<B>(config: &GatewayConfig, can_bus: Arc<B>) -> Result<Wiring, Error>
where
    B: CanBus + 'static,
{
    let events = EventBus::default();
    let store = LiveDataStore::new(config.poll.failure_threshold);

    // Energy accounting, seeded from the durable record.
    let (integrator, persist_rx) = EnergyIntegrator::new(config.energy.clone());
    let integrator = Arc::new(integrator);
    let kv_store: Arc<dyn KeyValueStore> =
        Arc::new(JsonFileStore::new(config.energy_store_path.clone()));
    restore_from_store(&integrator, kv_store.as_ref()).await;

    let cvl = Arc::new(CvlEngine::new(config.cvl.clone()));

    let driver = Arc::new(CanDriver::new(can_bus, config.can.clone(), events.clone()));
    driver.start()?;

    let publisher = Arc::new(Publisher::new(
        driver.clone(),
        cvl.clone(),
        integrator.clone(),
        events.clone(),
        config.publisher.clone(),
    ));

    // Totals and limits refresh before the encoders run.
    {
        let integrator = integrator.clone();
        store.subscribe(
            "energy-integrator",
            Arc::new(move |s: &LiveData| integrator.on_snapshot(s)),
        )?;
    }
    {
        let cvl = cvl.clone();
        store.subscribe("cvl-engine", Arc::new(move |s: &LiveData| cvl.on_snapshot(s)))?;
    }
    {
        let publisher = publisher.clone();
        store.subscribe(
            "victron-publisher",
            Arc::new(move |s: &LiveData| publisher.on_snapshot(s)),
        )?;
    }

    Ok(Wiring {
        events,
        store,
        integrator,
        cvl,
        driver,
        publisher,
        kv_store,
        persist_rx,
    })
}
