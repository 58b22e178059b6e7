//! Portwarden - a fleet-node supervisor for proxy server processes
//!
//! This library manages a fixed range of ports on one host:
//! - Allocates the lowest free port to each named instance
//! - Spawns one backend process (e.g. shadowsocks `ssserver`) per instance
//! - Persists the port table to a JSON snapshot and restores it at startup
//! - Serves an HTTP control plane to create, inspect, list and delete instances
//! - Respawns backends that exit without being deleted

pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod instance;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod table;
