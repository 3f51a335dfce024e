//! halbridge: run a hardware driver in another process and talk to it from the host.
//!
//! The host side ([`client::LocalBridge`]) forwards host messages over a socket pair
//! to the remote side ([`server::RemoteBridge`]), which hands them to a pluggable
//! [`handler::RemoteHandler`]. Handlers answer immediately or hold a request and
//! release it later; remote-originated events travel back on a separate notify path.

pub mod bridge;
pub mod client;
pub mod config;
pub mod devices;
pub mod error;
pub mod handler;
pub mod host;
pub mod logging;
pub mod server;
pub mod wire;

pub use bridge::protocol::{DeviceEvent, NotifyFrame, ReplyFrame, RequestFrame, TaggedEvent};
pub use client::{BridgeHandle, LocalBridge, Submission};
pub use config::{ClientConfig, ServerConfig};
pub use error::{BridgeError, ProtocolError, TransportError};
pub use handler::{BridgeContext, RemoteHandler};
pub use host::{HalMessage, HostBus, HostData, HostMessage, HostObject, HostValue};
pub use server::RemoteBridge;
pub use wire::{ErrorEntry, MessageId, ResponseEntry, WireMessage, to_wire};

/// halbridge version from Cargo.toml
pub const HALBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");
