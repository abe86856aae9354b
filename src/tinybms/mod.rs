//! TinyBMS serial protocol: frame codec, register catalogue, transport,
//! and the polling client.

pub mod client;
pub mod frame;
pub mod registers;
pub mod serial;
pub mod serial_mock;

pub use client::{PollConfig, TinyBmsClient};
pub use frame::{encode_read, encode_write, parse_reply, ReplyFrame, ReplyType};
pub use registers::{RegisterDescriptor, RegisterGroup, RegisterKind, RegisterValue};
pub use serial::{SerialConfig, TinyBmsTransport};
