//! A caller-owned cache for the most recently loaded pipeline.
//!
//! Loading a diffusion pipeline is expensive, and consecutive requests usually
//! ask for the same model. [`PipelineCache`] keeps the last loaded handle
//! together with the options it was loaded with and hands it back while the
//! options stay the same. A request with different options drops the old
//! handle before loading the new one, so at most one pipeline is resident.
//! Cheap changes that keep the weights, such as a different scheduler, go
//! through [`PipelineCache::refresh`] instead of a reload.
//!
//! ```ignore
//! let mut cache = PipelineCache::new();
//! let key = PipelineKey { model: "stable-diffusion-v1-5".into(), device: "cpu".into() };
//! let pipe = cache.get_or_load(key, |key| load_pipeline(&key.model, &key.device))?;
//! ```

use std::sync::Arc;

use tracing::debug;

/// Single-slot cache keyed by the options a pipeline was loaded with.
#[derive(Debug)]
pub struct PipelineCache<K, V> {
    entry: Option<(K, Arc<V>)>,
}

impl<K, V> Default for PipelineCache<K, V> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<K: PartialEq + std::fmt::Debug, V> PipelineCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handle for `key`, or load a new one with `loader`.
    ///
    /// A different key evicts the previous handle before `loader` runs. If
    /// `loader` fails the cache is left empty and the error is returned.
    pub fn get_or_load<F, E>(&mut self, key: K, loader: F) -> Result<Arc<V>, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        if let Some((cached_key, handle)) = &self.entry {
            if *cached_key == key {
                debug!("reusing existing pipeline for {:?}", key);
                return Ok(handle.clone());
            }
        }

        if self.entry.take().is_some() {
            debug!("unloading previous pipeline");
        }
        debug!("loading new pipeline for {:?}", key);
        let handle = Arc::new(loader(&key)?);
        self.entry = Some((key, handle.clone()));
        Ok(handle)
    }

    /// Rebuild the cached handle for `key` from the current one, keeping the key.
    ///
    /// Used for cheap swaps such as a new scheduler on an already loaded
    /// model. Returns `Ok(None)` without calling `update` when `key` is not
    /// cached. If `update` fails the previous handle stays cached.
    pub fn refresh<F, E>(&mut self, key: &K, update: F) -> Result<Option<Arc<V>>, E>
    where
        F: FnOnce(&V) -> Result<V, E>,
    {
        let handle = match &mut self.entry {
            Some((cached_key, handle)) if *cached_key == *key => handle,
            _ => return Ok(None),
        };
        debug!("refreshing cached pipeline for {:?}", key);
        *handle = Arc::new(update(&**handle)?);
        Ok(Some(handle.clone()))
    }

    /// Whether a handle loaded with `key` is cached.
    pub fn is_loaded(&self, key: &K) -> bool {
        matches!(&self.entry, Some((cached_key, _)) if cached_key == key)
    }

    /// The cached key, if any.
    pub fn key(&self) -> Option<&K> {
        self.entry.as_ref().map(|(key, _)| key)
    }

    /// Drop the cached handle. Returns whether there was one.
    pub fn invalidate(&mut self) -> bool {
        let had_entry = self.entry.take().is_some();
        if had_entry {
            debug!("invalidated cached pipeline");
        }
        had_entry
    }
}
