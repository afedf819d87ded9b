use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Resolves a logical service name to the base URL of a reachable instance
pub trait ServiceDiscovery: Send + Sync {
    fn resolve(&self, service: &str) -> Option<String>;
}

/// Fixed instance lists, handed out round-robin
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: Arc<HashMap<String, ServiceInstances>>,
}

#[derive(Debug, Default)]
struct ServiceInstances {
    urls: Vec<String>,
    counter: AtomicUsize,
}

impl StaticDiscovery {
    /// Create a discovery table from service name to instance base URLs
    pub fn new(services: HashMap<String, Vec<String>>) -> Self {
        let services = services
            .into_iter()
            .map(|(name, urls)| {
                (
                    name,
                    ServiceInstances {
                        urls,
                        counter: AtomicUsize::new(0),
                    },
                )
            })
            .collect();

        Self {
            services: Arc::new(services),
        }
    }

    /// Number of instances registered for a service
    pub fn instance_count(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, |s| s.urls.len())
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn resolve(&self, service: &str) -> Option<String> {
        let instances = self.services.get(service)?;
        if instances.urls.is_empty() {
            return None;
        }

        let index = instances.counter.fetch_add(1, Ordering::Relaxed) % instances.urls.len();
        instances.urls.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery() -> StaticDiscovery {
        let mut services = HashMap::new();
        services.insert(
            "Nexus".to_string(),
            vec![
                "http://nexus-0:8080".to_string(),
                "http://nexus-1:8080".to_string(),
                "http://nexus-2:8080".to_string(),
            ],
        );
        services.insert("AI".to_string(), vec![]);
        StaticDiscovery::new(services)
    }

    #[test]
    fn test_round_robin() {
        let discovery = discovery();

        let picks: Vec<String> = (0..4).filter_map(|_| discovery.resolve("Nexus")).collect();
        assert_eq!(
            picks,
            vec![
                "http://nexus-0:8080",
                "http://nexus-1:8080",
                "http://nexus-2:8080",
                "http://nexus-0:8080",
            ]
        );
    }

    #[test]
    fn test_unknown_or_empty_service() {
        let discovery = discovery();
        assert!(discovery.resolve("MCP").is_none());
        assert!(discovery.resolve("AI").is_none());
        assert_eq!(discovery.instance_count("Nexus"), 3);
        assert_eq!(discovery.instance_count("MCP"), 0);
    }
}
