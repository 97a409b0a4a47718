//! Failover / dated-backup file replication.
//!
//! A remote source streams file records; the server reconciles them
//! against a failover mirror or a dated backup tree, pulls only the bytes
//! it cannot find locally and rotates old trees by retention.

pub mod activity;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod delta;
pub mod dirstack;
pub mod error;
pub mod fsops;
pub mod journal;
pub mod mtime_cache;
pub mod naming;
pub mod params;
pub mod protocol;
pub mod protocol_core;
pub mod reconcile;
pub mod record;
pub mod rotation;
pub mod rules;
pub mod server;
pub mod session;
pub mod transfer;
pub mod wire;
