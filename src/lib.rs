//! fabric-ra - replica set reconfiguration for a stateful partition
//!
//! - `reliability`: epochs, roles and replica descriptions shared by all parts
//! - `ra`: the per-node reconfiguration agent state machine
//! - `fm`: failover manager rebuild from node reports
//! - `observability`: structured logging and counters
//! - `cli`: command-line entry points

pub mod cli;
pub mod fm;
pub mod observability;
pub mod ra;
pub mod reliability;
