//! Redis MONITOR fan-out.
//!
//! A single MONITOR connection per Redis instance is shared by any number of
//! observers. The crate provides:
//!
//! - a parser turning raw MONITOR lines into structured events
//! - a per-instance hub that batches events and pushes them to observers
//! - a process-wide directory creating hubs on first subscribe and
//!   discarding them when the last observer leaves
//!
//! Connections speak RESP over TCP through Tokio.

pub mod config;
pub mod input;
pub mod monitor;
pub mod observability;
pub mod resp;
