//! Process-local map of subscription name to running [`Poller`].

use crate::{JobwardenError, Result, worker::Poller};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// At most one poller per name. The lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    pollers: Mutex<HashMap<String, Arc<Poller>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn pollers(&self) -> MutexGuard<'_, HashMap<String, Arc<Poller>>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, poller: Arc<Poller>) -> Result<()> {
        let mut pollers = self.pollers();
        let name = poller.name().to_string();
        if pollers.contains_key(&name) {
            return Err(JobwardenError::AlreadySubscribed { name });
        }
        pollers.insert(name, poller);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<Arc<Poller>> {
        self.pollers()
            .remove(name)
            .ok_or_else(|| JobwardenError::NotSubscribed {
                name: name.to_string(),
            })
    }

    /// Removes and returns every registered poller.
    pub fn drain(&self) -> Vec<Arc<Poller>> {
        self.pollers().drain().map(|(_, poller)| poller).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pollers().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pollers().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pollers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{FetchFn, JobContext, JobHandler};

    fn poller(name: &str) -> Arc<Poller> {
        let fetch: FetchFn = Arc::new(|| Box::pin(async { Ok(Vec::new()) }));
        let handler: JobHandler = Arc::new(|_ctx: JobContext| Box::pin(async { Ok(()) }));
        Arc::new(Poller::new(name, fetch, handler))
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = SubscriptionRegistry::new();
        registry.register(poller("email")).unwrap();

        let err = registry.register(poller("email")).unwrap_err();
        assert!(matches!(err, JobwardenError::AlreadySubscribed { name } if name == "email"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_unknown_name() {
        let registry = SubscriptionRegistry::new();
        let err = registry.remove("missing").unwrap_err();
        assert!(matches!(err, JobwardenError::NotSubscribed { .. }));
    }

    #[test]
    fn test_drain_and_names() {
        let registry = SubscriptionRegistry::new();
        registry.register(poller("sms")).unwrap();
        registry.register(poller("email")).unwrap();
        assert_eq!(registry.names(), vec!["email", "sms"]);
        assert!(registry.contains("sms"));

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        registry.register(poller("email")).unwrap();
    }
}
