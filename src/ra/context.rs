//! Execution context
//!
//! Carried into every failover unit transition. Holds the clock reading,
//! configuration, the action queue the transition fills and the counters.

use chrono::{DateTime, Utc};

use crate::observability::MetricsRegistry;

use super::action_queue::StateMachineActionQueue;
use super::config::FailoverConfig;

pub struct ExecutionContext<'a> {
    pub now: DateTime<Utc>,
    pub config: &'a FailoverConfig,
    pub queue: &'a mut StateMachineActionQueue,
    pub metrics: &'a MetricsRegistry,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        now: DateTime<Utc>,
        config: &'a FailoverConfig,
        queue: &'a mut StateMachineActionQueue,
        metrics: &'a MetricsRegistry,
    ) -> Self {
        Self {
            now,
            config,
            queue,
            metrics,
        }
    }
}
