//! Service descriptions known to the failover manager

use std::collections::HashMap;

use crate::reliability::ServiceDescription;

use super::errors::{RebuildError, RebuildResult};

#[derive(Debug, Clone, Default)]
pub struct ServiceCache {
    services: HashMap<String, ServiceDescription>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service description.
    pub fn insert(&mut self, service: ServiceDescription) {
        self.services.insert(service.name.clone(), service);
    }

    pub fn get(&self, name: &str) -> RebuildResult<&ServiceDescription> {
        self.services
            .get(name)
            .ok_or_else(|| RebuildError::UnknownService(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_unknown_service() {
        let cache = ServiceCache::new();
        assert_eq!(
            cache.get("fabric:/missing").unwrap_err(),
            RebuildError::UnknownService("fabric:/missing".into())
        );
    }

    #[test]
    fn test_insert_replaces() {
        let mut cache = ServiceCache::new();
        cache.insert(ServiceDescription::stateful("svc", 3, 2, true));
        cache.insert(ServiceDescription::stateful("svc", 5, 3, true));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("svc").unwrap().target_replica_set_size, 5);
    }
}
