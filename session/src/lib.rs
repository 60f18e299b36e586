//! Bootstrap and registration sessions for an LWM2M device.
//!
//! This crate drives the two CoAP-over-DTLS exchanges a device performs
//! against its management service: a bootstrap session that receives
//! operational credentials pushed by the bootstrap server and persists
//! them in a resource store, and a registration exchange that proves the
//! provisioned credentials work against the LWM2M server and immediately
//! deregisters.
//!
//! ## Sessions
//!
//! - **Bootstrap**: dial with the factory bootstrap certificate, announce
//!   the device with `POST /bs`, serve the server-initiated object writes
//!   under `/0`, `/1` and `/3`, wait for the finish signal, then reload
//!   and validate the delivered credentials from the store.
//! - **Register**: dial with the provisioned certificate, `POST /rd` with
//!   the object inventory, then `DELETE` the returned location.
//!
//! Both sessions share the transport in [`transport`]: a single DTLS
//! session multiplexed between outbound confirmable requests and a
//! handler set for requests the server initiates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod device;
pub mod error;
pub mod identity;
pub mod register;
pub mod transport;

pub use device::Device;
pub use error::SessionError;
pub use identity::{CoapUrl, Identity};
pub use transport::{CoapClient, InboundHandler, Router, TransportConfig};
