//! # gopher
//!
//! An async gateway for XBee radio modules.
//!
//! gopher talks to an XBee module in API mode over a serial port, sends
//! unicast and broadcast frames (optionally waiting for the module's
//! delivery status), and keeps a durable SQLite log of every transmission it
//! receives.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Acknowledged sends correlated by frame id, with timeouts
//! - Listener callbacks for inbound data and delivery status
//! - Append-only transmission log with replay
//! - Helpers for `key=value` sensor payloads
//!
//! ## Quick Start
//!
//! ```no_run
//! use gopher::{Gateway, GatewayConfig, Readings, RemoteMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gopher::Error> {
//!     let config = GatewayConfig::new("/dev/ttyUSB0").log_url("sqlite:///xbee_log.db");
//!     let mut gateway = Gateway::start(config)?;
//!
//!     gateway.register_data_listener(|message: &RemoteMessage| {
//!         let readings = Readings::parse(message.text()?)?;
//!         println!("{}: {:?}", message.sender, readings);
//!         Ok(())
//!     });
//!     gateway.open_and_log().await?;
//!
//!     // Wait for the delivery status
//!     let outcome = gateway.send_unicast("0013A20040522BAA", b"ping", true).await?;
//!     println!("delivered: {outcome:?}");
//!
//!     gateway.send_broadcast(b"hello all").await?;
//!
//!     for message in gateway.replay_log().await? {
//!         println!("{} said {}", message.sender, message.text()?);
//!     }
//!
//!     gateway.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - API frame codec and frame types
//! - [`transport`] - Links and the [`RadioTransport`]
//! - [`event`] - Listener sets and the event channel
//! - [`store`] - SQLite transmission log
//! - [`gateway`] - High-level [`Gateway`]
//! - [`kv`] and [`types`] - Payload helpers and data structures

pub mod error;
pub mod event;
pub mod gateway;
pub mod kv;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use error::{Error, FrameError, Result};
pub use event::{Event, EventDispatcher, ListenerError, ListenerId, Subscription};
pub use gateway::{Gateway, GatewayConfig};
pub use kv::{extract, extract_value};
pub use store::{StoreConfig, TransmissionStore};
pub use transport::{LinkState, RadioTransport, SerialConfig, TransportConfig, list_ports};
pub use types::{
    Address16, Address64, DeliveryOutcome, DeliveryStatus, Environment, LocalDevice, Orientation,
    Readings, RemoteEndpoint, RemoteMessage, TransmissionRecord, TransmitOptions,
};
