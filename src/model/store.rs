//! # Live-Data Store
//!
//! Owns the latest [`LiveData`] snapshot, a bounded ring of condensed
//! samples, the connection status, and the listener registry. Snapshot
//! swaps are all-or-nothing: readers always copy a consistent snapshot,
//! never a half-updated one.

use crate::error::Error;
use crate::model::live_data::LiveData;
use crate::util::lock_with_budget;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Capacity of the condensed history ring.
pub const HISTORY_CAPACITY: usize = 512;

/// Budget for acquiring the store mutex.
const STORE_LOCK_BUDGET: Duration = Duration::from_millis(100);

/// Connection state towards the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Simulation,
}

/// One condensed history sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CondensedSample {
    pub timestamp_ms: u64,
    pub pack_voltage_v: f32,
    pub pack_current_a: f32,
    pub soc_percent: f32,
    pub soh_percent: f32,
    /// Mean of the fitted probes in 0.1 C; None when no probe is fitted.
    pub avg_temp_deci_c: Option<i16>,
}

/// Snapshot listener invoked synchronously after each successful poll.
pub type Listener = Arc<dyn Fn(&LiveData) + Send + Sync>;

struct StoreInner {
    latest: Option<LiveData>,
    history: VecDeque<CondensedSample>,
    status: ConnectionStatus,
    /// Registration-ordered; keyed by name so re-registering is idempotent.
    listeners: Vec<(&'static str, Listener)>,
    consecutive_failures: u32,
    /// Poll failures before the status degrades to Disconnected.
    failure_threshold: u32,
}

/// Shared handle to the live-data model.
#[derive(Clone)]
pub struct LiveDataStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl LiveDataStore {
    pub fn new(failure_threshold: u32) -> Self {
        LiveDataStore {
            inner: Arc::new(Mutex::new(StoreInner {
                latest: None,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                status: ConnectionStatus::Disconnected,
                listeners: Vec::new(),
                consecutive_failures: 0,
                failure_threshold: failure_threshold.max(1),
            })),
        }
    }

    /// Registers `listener` under `name`, replacing any previous listener of
    /// the same name in place (registration order is preserved).
    pub fn subscribe(&self, name: &'static str, listener: Listener) -> Result<(), Error> {
        let mut inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
        if let Some(slot) = inner.listeners.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = listener;
        } else {
            inner.listeners.push((name, listener));
        }
        Ok(())
    }

    /// Removes the listener registered under `name`, if any.
    pub fn unsubscribe(&self, name: &'static str) -> Result<(), Error> {
        let mut inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
        inner.listeners.retain(|(n, _)| *n != name);
        Ok(())
    }

    /// Publishes a new snapshot: swaps it in atomically, appends the
    /// condensed sample, marks the link Connected, then fans out to the
    /// listeners in registration order with the lock released.
    pub fn publish(&self, snapshot: LiveData) -> Result<(), Error> {
        let listeners: Vec<Listener> = {
            let mut inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
            let sample = CondensedSample {
                timestamp_ms: snapshot.timestamp_ms,
                pack_voltage_v: snapshot.pack_voltage_v,
                pack_current_a: snapshot.pack_current_a,
                soc_percent: snapshot.soc_percent,
                soh_percent: snapshot.soh_percent,
                avg_temp_deci_c: snapshot.average_temp_deci_c(),
            };
            if inner.history.len() == HISTORY_CAPACITY {
                inner.history.pop_front();
            }
            inner.history.push_back(sample);
            inner.consecutive_failures = 0;
            if inner.status != ConnectionStatus::Simulation {
                inner.status = ConnectionStatus::Connected;
            }
            inner.latest = Some(snapshot.clone());
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in listeners {
            listener(&snapshot);
        }
        Ok(())
    }

    /// Records a fully failed poll cycle; after the configured number of
    /// consecutive failures the status degrades to Disconnected. The latest
    /// snapshot is kept.
    pub fn record_poll_failure(&self) -> Result<ConnectionStatus, Error> {
        let mut inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.consecutive_failures >= inner.failure_threshold
            && matches!(
                inner.status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            )
        {
            warn!(
                "{} consecutive poll failures, marking BMS disconnected",
                inner.consecutive_failures
            );
            inner.status = ConnectionStatus::Disconnected;
        }
        Ok(inner.status)
    }

    /// Marks the link as connecting (startup, reconnect).
    pub fn set_connecting(&self) -> Result<(), Error> {
        let mut inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
        if inner.status == ConnectionStatus::Disconnected {
            inner.status = ConnectionStatus::Connecting;
        }
        Ok(())
    }

    /// Switches the model into simulation mode.
    pub fn set_simulation(&self) -> Result<(), Error> {
        let mut inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
        debug!("live-data model entering simulation mode");
        inner.status = ConnectionStatus::Simulation;
        Ok(())
    }

    /// Copies out the latest snapshot, if one has been published.
    pub fn latest(&self) -> Result<Option<LiveData>, Error> {
        let inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
        Ok(inner.latest.clone())
    }

    /// Copies out the condensed history, oldest first.
    pub fn history(&self) -> Result<Vec<CondensedSample>, Error> {
        let inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
        Ok(inner.history.iter().copied().collect())
    }

    pub fn connection_status(&self) -> Result<ConnectionStatus, Error> {
        let inner = lock_with_budget(&self.inner, STORE_LOCK_BUDGET, "live-data store")?;
        Ok(inner.status)
    }
}
