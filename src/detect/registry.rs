use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{Frame, TrackerBackend};
use super::normalize::TrackerOutput;

/// Thread-safe registry of tracker backends.
///
/// Backends are wrapped in `Mutex` because `TrackerBackend::update` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<Mutex<dyn TrackerBackend>>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: TrackerBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("tracker backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mutex<dyn TrackerBackend>>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<Arc<Mutex<dyn TrackerBackend>>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Hand out the named backend (or the default) as a pipeline-owned tracker.
    pub fn select(&self, name: Option<&str>) -> Result<SharedTracker> {
        let inner = match name {
            Some(name) => self
                .get(name)
                .ok_or_else(|| anyhow!("tracker backend '{}' not registered", name))?,
            None => self
                .default_backend()
                .ok_or_else(|| anyhow!("no tracker backend registered"))?,
        };
        let name = inner
            .lock()
            .map_err(|_| anyhow!("tracker lock poisoned"))?
            .name();
        Ok(SharedTracker { name, inner })
    }
}

/// A registered backend borrowed out of the registry by one pipeline.
pub struct SharedTracker {
    name: &'static str,
    inner: Arc<Mutex<dyn TrackerBackend>>,
}

impl TrackerBackend for SharedTracker {
    fn name(&self) -> &'static str {
        self.name
    }

    fn update(&mut self, frame: &Frame) -> Result<TrackerOutput> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("tracker lock poisoned"))?
            .update(frame)
    }

    fn is_exhausted(&self) -> bool {
        self.inner
            .lock()
            .map(|guard| guard.is_exhausted())
            .unwrap_or(true)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
