//! # Elixys Hardware Link
//!
//! Binary status/command link between the Elixys radiosynthesizer control
//! software and its hardware controller, plus a simulator that stands in for
//! the hardware.
//!
//! ## Features
//!
//! - **Schema-driven codec**: a declarative device description becomes exact
//!   little-endian layouts for status frames and command frames
//! - **Live state store**: snapshots rebuilt atomically from each status frame
//! - **Queue boundary**: the websocket transport only ever talks to two FIFO queues
//! - **Device commands**: addressable, parameterized, immutable command values
//! - **Hardware simulator**: command callbacks, actuator travel time, heater drift
//!
//! ## Quick Start
//!
//! ```rust
//! use elixys_hal::{build_schema, Codec, CommandTable, StateStore, SystemConfig};
//!
//! let config = SystemConfig::bundled().unwrap();
//! let schema = build_schema(&config).unwrap();
//!
//! // Build a valve command frame
//! let commands = CommandTable::new(&schema);
//! let frame = commands
//!     .lookup("Valves", "set_state0")
//!     .unwrap()
//!     .with_param(0xAAAAu32)
//!     .unwrap()
//!     .to_bytes();
//! assert_eq!(frame.len(), 12);
//!
//! // Feed a status frame into the store
//! let store = StateStore::new(Codec::new(schema));
//! let status = vec![0u8; store.codec().frame_len()];
//! store.update(&status).unwrap();
//! assert!(store.is_valid());
//! ```
//!
//! ## Architecture
//!
//! - [`format`] - Primitive format codes and typed values
//! - [`config`] - Device description and runtime settings
//! - [`schema`] - Validated, ordered layout of every subsystem
//! - [`codec`] - Status frame encode/decode and field layout
//! - [`state`] - Snapshots, the live store and the status updater
//! - [`commands`] - Command values and the command table
//! - [`queue`] - Outbound/inbound queues between transport and application
//! - [`server`] - Websocket transport server
//! - [`simulator`] - Hardware simulator
//! - [`controlbox`] - Serial control board client

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::return_self_not_must_use)]

pub mod codec;
pub mod commands;
pub mod config;
pub mod controlbox;
pub mod error;
pub mod format;
pub mod queue;
pub mod schema;
pub mod server;
pub mod simulator;
pub mod state;

// Re-export main public types for convenience
pub use codec::{Codec, FieldLayout};
pub use commands::{Command, CommandTable};
pub use config::SystemConfig;
pub use error::{HalError, HalResult};
pub use format::{FormatCode, Value};
pub use queue::{link, HardwareLink, InboundMessage, TransportQueues};
pub use schema::{build_schema, Schema};
pub use server::{ServerConfig, ServerEvent, ServerHandle, TransportServer};
pub use simulator::Simulator;
pub use state::{spawn_status_updater, StateAccess, StateSnapshot, StateStore};
