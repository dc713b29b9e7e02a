use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use super::{pick_first, round_robin, LoadBalancerBuilder};

static GLOBAL_REGISTRY: LazyLock<LoadBalancerRegistry> = LazyLock::new(|| {
    let registry = LoadBalancerRegistry::new();
    registry.register(Arc::new(pick_first::PickFirstBuilder));
    registry.register(Arc::new(round_robin::RoundRobinBuilder));
    registry
});

/// The process-wide policy registry, preloaded with the built-in policies.
pub fn global_lb_registry() -> &'static LoadBalancerRegistry {
    &GLOBAL_REGISTRY
}

/// Maps load balancing policy names to their builders.
pub struct LoadBalancerRegistry {
    builders: RwLock<HashMap<&'static str, Arc<dyn LoadBalancerBuilder>>>,
}

impl LoadBalancerRegistry {
    pub fn new() -> LoadBalancerRegistry {
        LoadBalancerRegistry {
            builders: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, builder: Arc<dyn LoadBalancerBuilder>) {
        self.builders.write().unwrap().insert(builder.name(), builder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LoadBalancerBuilder>> {
        self.builders.read().unwrap().get(name).cloned()
    }
}

impl Default for LoadBalancerRegistry {
    fn default() -> Self {
        LoadBalancerRegistry::new()
    }
}
