//! Failover manager rebuild
//!
//! When FM loses its partition table it rebuilds every partition from what
//! the nodes report:
//! - `NodeCache` and `ServiceCache` are read-only inputs
//! - `InBuildFailoverUnit` accumulates reports for one partition
//! - `generate` yields the FM `FailoverUnit`, or nothing when the partition
//!   has to be placed from scratch
//!
//! Generation is pure: it mutates nothing and gives the same answer for any
//! order of reports.

mod errors;
mod failover_unit;
mod node_cache;
mod rebuild;
mod service_cache;

pub use errors::{RebuildError, RebuildResult};
pub use failover_unit::{FailoverUnit, FmReplica, ReplicaFlags};
pub use node_cache::{NodeCache, NodeInfo};
pub use rebuild::{InBuildFailoverUnit, NodeReport, DEFAULT_PRIMARY_EPOCH_INCREMENT};
pub use service_cache::ServiceCache;
