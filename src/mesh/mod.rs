//! Peer mesh networking using Chitchat.
//!
//! The mesh lets limiter instances share bucket counters without any external
//! storage: every node gossips its own contributions and totals are computed
//! locally from the replicated state.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError};
