//! Live-data model: typed snapshots, bounded history, listener fan-out,
//! and the bench-time snapshot simulator.

pub mod live_data;
pub mod simulator;
pub mod store;

pub use live_data::{LiveData, OnlineStatus};
pub use simulator::{BmsSimulator, SimulatorConfig};
pub use store::{CondensedSample, ConnectionStatus, LiveDataStore};
