//! # Vehicle Bus
//!
//! Telemetry/control message bus for a simulated vehicle. Speed telemetry
//! comes in over UDP, is checked against a dynamically resolved speed limit,
//! raises debounced alerts, and is fused with lock history and configuration
//! into a periodic status summary. A framed TCP RPC surface changes the speed
//! limit or actuates the door lock.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use vehicle_bus::config_store::ConfigStore;
//! use vehicle_bus::store::MemoryStore;
//!
//! let config = ConfigStore::new(Arc::new(MemoryStore::new()));
//! config.set_rpc_limit(70).unwrap();
//! config.set_geo_context(Some("City"), Some(50)).unwrap();
//!
//! // Geofence beats RPC, RPC beats the default.
//! assert_eq!(config.effective_limit(80.0), 50.0);
//! ```
//!
//! ## Architecture
//!
//! - [`codec`] - UDP datagram and length-prefixed TCP framing
//! - [`protocol`] - Wire message types
//! - [`store`] - Plain-text record storage
//! - [`config_store`] - Config record and effective limit resolution
//! - [`rpc`] - Request/response service and client
//! - [`alert`] - Debounced speed alerting
//! - [`summary`] - Status aggregation and publishing
//! - [`behavior`] - Driver behavior scoring over the alert log
//! - [`geofence`] - Simulated zone changes
//! - [`publisher`] - Speed telemetry publisher
//! - [`settings`] - Resolved service settings

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod alert;
pub mod behavior;
pub mod codec;
pub mod config_store;
pub mod error;
pub mod geofence;
pub mod protocol;
pub mod publisher;
pub mod rpc;
pub mod settings;
pub mod store;
pub mod summary;

// Re-export main public types for convenience
pub use alert::AlertEngine;
pub use config_store::{ConfigRecord, ConfigStore};
pub use error::{BusError, Result};
pub use protocol::{BusMessage, RpcRequest, RpcResponse};
pub use rpc::{RpcClient, RpcService};
pub use summary::StatusAggregator;
