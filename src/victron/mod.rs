//! Victron CAN side: encoder table, CVL state machine, CAN driver,
//! publisher scheduler, and the outbound event bus.

pub mod alarms;
pub mod can;
pub mod can_mock;
pub mod cvl;
pub mod encoders;
pub mod events;
pub mod publisher;

pub use can::{CanBus, CanBusState, CanConfig, CanDriver, CanFrame, CanStats};
pub use cvl::{CvlConfig, CvlEngine, CvlRuntime, CvlState};
pub use encoders::{BatteryIdentity, EncoderContext, PublisherChannel, CHANNELS};
pub use events::{EventBus, GatewayEvent};
pub use publisher::{Publisher, PublisherConfig};
