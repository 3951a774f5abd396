//! Shared wireless medium simulation.
//!
//! Stations contend for one access point over a single radio medium. Each
//! station is an independent actor; the access point is the only place where
//! signal strength, interference and corruption are computed.
//!
//! ## Module Organization
//!
//! - `types`: identifiers, events, replies and the channels that carry them
//! - `signal_calculations`: path-loss models and dB arithmetic
//! - `clock`: injectable time source for every simulated delay
//! - `station`: station actor (cadence, sense, transmit)
//! - `mac`: pluggable medium access policies
//! - `arbiter`: synchronous arbitration state of the access point
//! - `coordinator`: async event loop around the arbiter
//! - `network`: runner that places stations and spawns the tasks
//! - `error`: error taxonomy

pub mod arbiter;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod mac;
pub mod network;
pub mod signal_calculations;
pub mod station;
pub mod types;

pub use network::network_task;
