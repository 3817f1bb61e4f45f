//! Channel adapter registry with fault-isolated lifecycle management.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::channels::{ChannelAdapter, ChannelCallbacks, ChannelHealth};
use crate::models::task::TaskSource;

/// Holds every registered adapter, keyed by source. The first registered
/// adapter becomes the default (the mandatory interaction surface).
///
/// Every per-adapter lifecycle call is isolated: one adapter failing to
/// init, start, or stop never prevents the others from doing so.
pub struct ChannelRegistry {
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    by_source: HashMap<TaskSource, Arc<dyn ChannelAdapter>>,
    initialized: Mutex<HashSet<TaskSource>>,
    active: Mutex<HashSet<TaskSource>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
            by_source: HashMap::new(),
            initialized: Mutex::new(HashSet::new()),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Register an adapter. A second adapter for the same source replaces
    /// the lookup entry but keeps registration order for default selection.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        info!(name = adapter.name(), source = %adapter.source(), "adapter registered");
        self.by_source.insert(adapter.source(), Arc::clone(&adapter));
        self.adapters.push(adapter);
    }

    /// The first-registered adapter, if any.
    #[must_use]
    pub fn default_adapter(&self) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.first().map(Arc::clone)
    }

    /// Adapter serving `source`, if registered.
    #[must_use]
    pub fn adapter_for(&self, source: TaskSource) -> Option<Arc<dyn ChannelAdapter>> {
        self.by_source.get(&source).map(Arc::clone)
    }

    /// Initialize every adapter, isolating failures.
    pub async fn init_all(&self, callbacks: &ChannelCallbacks) {
        for adapter in &self.adapters {
            match adapter.init(callbacks.clone()).await {
                Ok(()) => {
                    self.mark(&self.initialized, adapter.source());
                    info!(name = adapter.name(), "adapter initialized");
                }
                Err(err) => {
                    error!(name = adapter.name(), %err, "adapter init failed");
                }
            }
        }
    }

    /// Start every successfully-initialized adapter, isolating failures.
    /// The active set records exactly those whose `start` succeeded.
    pub async fn start_all(&self) {
        for adapter in &self.adapters {
            if !self.is_marked(&self.initialized, adapter.source()) {
                warn!(name = adapter.name(), "skipping start: init did not succeed");
                continue;
            }
            match adapter.start().await {
                Ok(()) => {
                    self.mark(&self.active, adapter.source());
                    info!(name = adapter.name(), "adapter started");
                }
                Err(err) => {
                    error!(name = adapter.name(), %err, "adapter start failed");
                }
            }
        }
    }

    /// Stop every adapter, isolating failures and clearing the active set.
    pub async fn stop_all(&self) {
        for adapter in &self.adapters {
            if let Err(err) = adapter.stop().await {
                error!(name = adapter.name(), %err, "adapter stop failed");
            }
        }
        if let Ok(mut active) = self.active.lock() {
            active.clear();
        }
    }

    /// Adapters whose `start` succeeded, in registration order.
    #[must_use]
    pub fn active_list(&self) -> Vec<Arc<dyn ChannelAdapter>> {
        self.adapters
            .iter()
            .filter(|adapter| self.is_marked(&self.active, adapter.source()))
            .map(Arc::clone)
            .collect()
    }

    /// Health of every registered adapter.
    pub async fn health_all(&self) -> HashMap<TaskSource, ChannelHealth> {
        let mut health = HashMap::new();
        for adapter in &self.adapters {
            health.insert(adapter.source(), adapter.health().await);
        }
        health
    }

    fn mark(&self, set: &Mutex<HashSet<TaskSource>>, source: TaskSource) {
        if let Ok(mut guard) = set.lock() {
            guard.insert(source);
        }
    }

    fn is_marked(&self, set: &Mutex<HashSet<TaskSource>>, source: TaskSource) -> bool {
        set.lock().map(|guard| guard.contains(&source)).unwrap_or(false)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
