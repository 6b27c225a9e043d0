//! # sflowd - sFlow Export Daemon
//!
//! Samples traffic and interface counters on monitored interfaces, encodes
//! them as sFlow v5 datagrams and streams them to every configured collector
//! over UDP.
//!
//! ## Responsibilities
//! - Global, collector and interface configuration with admin-state gating
//! - One sampling task per running interface, one transmit task per running collector
//! - Aggregation of sample records into datagrams keyed by `(ifIndex, sequence)`
//! - Fan-out of each datagram to every registered collector
//! - Reference-counted retirement of datagrams once every recipient is done
//!
//! ## Data Flow
//! ```text
//! sampling tasks -> Aggregation -> Fan-out -> collector mailboxes -> UDP
//!                                     ^                |
//!                                     +---- receipts --+
//! ```

pub mod capture;
pub mod codec;
pub mod collector;
pub mod collector_tx;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod global;
pub mod hw;
pub mod intf;
pub mod intf_poller;
pub mod server;
pub mod tables;
pub mod types;

pub use config::SflowdConfig;
pub use error::{CodecError, SflowError, SflowResult};
pub use server::{ServerHandle, SflowServer};
pub use types::*;
