//! Tessera: cluster activation, baseline topology & chunked partition rebalancing for a
//! partitioned data grid node.

pub mod affinity;
pub mod app;
pub mod cluster;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod database;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod rebalance;
pub mod storage;
pub mod transfer;
pub mod utils;

/// The consistent ID of a cluster node.
pub type NodeId = String;
