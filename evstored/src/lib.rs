#![deny(clippy::as_conversions)]
//! A clustered event store node
//!
//! Every node keeps its log in a chunked append-only database. The
//! cluster elects a master that accepts writes and streams them to
//! replicas, committing once a quorum has them on disk.

mod bus;
pub mod checkpoint;
mod cluster;
mod controller;
pub mod db;
mod elections;
mod epoch;
mod forwarding;
mod gossip;
mod ioutil;
pub mod message;
mod node;
mod peer;
mod replication;
mod services;
mod task;
mod timer;

pub use evstored_api::{OperationResult, VNodeState};
pub use node::*;
