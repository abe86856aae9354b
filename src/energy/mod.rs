//! Energy accounting: V·I·Δt integration with crash-safe persistence.

pub mod integrator;
pub mod persistence;

pub use integrator::{EnergyConfig, EnergyIntegrator, EnergyState, PersistRequest};
pub use persistence::{JsonFileStore, KeyValueStore, KEY_CHARGED_WH, KEY_DISCHARGED_WH};

use log::{info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Seeds the integrator from the durable store. A missing or corrupt record
/// restores zeros.
pub async fn restore_from_store(
    integrator: &EnergyIntegrator,
    store: &dyn KeyValueStore,
) {
    let charged = match store.read_f64(KEY_CHARGED_WH).await {
        Ok(v) => v.unwrap_or(0.0),
        Err(e) => {
            warn!("restoring charged total failed: {e}");
            0.0
        }
    };
    let discharged = match store.read_f64(KEY_DISCHARGED_WH).await {
        Ok(v) => v.unwrap_or(0.0),
        Err(e) => {
            warn!("restoring discharged total failed: {e}");
            0.0
        }
    };
    if let Err(e) = integrator.restore(charged, discharged) {
        warn!("seeding energy totals failed: {e}");
    }
}

/// Persistence worker: drains persist requests and writes them to the
/// durable store. Only a successful write advances the integrator's
/// persisted watermark, so a failed write retries on the next trigger.
pub async fn run_persistence_worker(
    integrator: Arc<EnergyIntegrator>,
    store: Arc<dyn KeyValueStore>,
    mut requests: mpsc::Receiver<PersistRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let entries = [
            (KEY_CHARGED_WH, request.charged_wh),
            (KEY_DISCHARGED_WH, request.discharged_wh),
        ];
        match store.write_f64_batch(&entries).await {
            Ok(()) => {
                if let Err(e) = integrator.mark_persisted(&request) {
                    warn!("{e}");
                }
            }
            Err(e) => warn!("energy persist failed, in-memory totals kept: {e}"),
        }
    }
    info!("persistence worker exiting");
}
