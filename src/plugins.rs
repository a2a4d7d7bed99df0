//! Datastore plugins
//!
//! The plugin set is loaded once per process. Every node build goes through
//! [`load_plugins`], and every caller sees the same outcome: the shared
//! registry on success or the same error on failure.

use crate::content::{Blockstore, ContentError, FsBlockstore, MemBlockstore};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub const FLATFS: &str = "flatfs";
pub const MEM: &str = "mem";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Plugin registered twice: {0}")]
    Duplicate(String),

    #[error("No datastore plugin named {0}")]
    UnknownDatastore(String),

    #[error("Plugin {name} failed to initialize: {reason}")]
    Init { name: String, reason: String },
}

/// A block storage backend selectable from the repository config
#[async_trait]
pub trait DatastorePlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time setup when the plugin set is loaded
    fn init(&self) -> Result<(), String> {
        Ok(())
    }

    /// Open the datastore rooted at `path`
    async fn open(&self, path: &Path) -> Result<Arc<dyn Blockstore>, ContentError>;
}

struct FlatfsPlugin;

#[async_trait]
impl DatastorePlugin for FlatfsPlugin {
    fn name(&self) -> &'static str {
        FLATFS
    }

    async fn open(&self, path: &Path) -> Result<Arc<dyn Blockstore>, ContentError> {
        Ok(Arc::new(FsBlockstore::open(path).await?))
    }
}

struct MemPlugin;

#[async_trait]
impl DatastorePlugin for MemPlugin {
    fn name(&self) -> &'static str {
        MEM
    }

    async fn open(&self, _path: &Path) -> Result<Arc<dyn Blockstore>, ContentError> {
        Ok(Arc::new(MemBlockstore::new()))
    }
}

/// Loaded plugin set
pub struct PluginRegistry {
    datastores: HashMap<&'static str, Box<dyn DatastorePlugin>>,
}

impl PluginRegistry {
    /// Register and initialize a plugin set
    pub fn load(plugins: Vec<Box<dyn DatastorePlugin>>) -> Result<Self, PluginError> {
        let mut datastores = HashMap::new();

        for plugin in plugins {
            let name = plugin.name();
            if datastores.contains_key(name) {
                return Err(PluginError::Duplicate(name.to_string()));
            }

            plugin.init().map_err(|reason| PluginError::Init {
                name: name.to_string(),
                reason,
            })?;

            datastores.insert(name, plugin);
        }

        Ok(Self { datastores })
    }

    pub fn datastore(&self, name: &str) -> Result<&dyn DatastorePlugin, PluginError> {
        self.datastores
            .get(name)
            .map(|p| p.as_ref())
            .ok_or_else(|| PluginError::UnknownDatastore(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.datastores.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn builtin_plugins() -> Vec<Box<dyn DatastorePlugin>> {
    vec![Box::new(FlatfsPlugin), Box::new(MemPlugin)]
}

static PLUGINS: OnceCell<Result<Arc<PluginRegistry>, PluginError>> = OnceCell::new();

/// Load the process-wide plugin set (runs at most once)
pub fn load_plugins() -> Result<Arc<PluginRegistry>, PluginError> {
    PLUGINS
        .get_or_init(|| {
            let result = PluginRegistry::load(builtin_plugins()).map(Arc::new);
            match &result {
                Ok(registry) => tracing::debug!("Loaded plugins: {:?}", registry.names()),
                Err(e) => tracing::error!("Plugin loading failed: {}", e),
            }
            result
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl DatastorePlugin for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn init(&self) -> Result<(), String> {
            Err("boom".into())
        }

        async fn open(&self, _path: &Path) -> Result<Arc<dyn Blockstore>, ContentError> {
            Ok(Arc::new(MemBlockstore::new()))
        }
    }

    #[test]
    fn test_load_once_shared() {
        let a = load_plugins().unwrap();
        let b = load_plugins().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.names(), vec![FLATFS, MEM]);
    }

    #[test]
    fn test_concurrent_callers_see_same_registry() {
        let handles: Vec<_> = (0..8).map(|_| std::thread::spawn(load_plugins)).collect();
        let first = load_plugins().unwrap();

        for handle in handles {
            assert!(Arc::ptr_eq(&handle.join().unwrap().unwrap(), &first));
        }
    }

    #[test]
    fn test_duplicate_plugin() {
        let result = PluginRegistry::load(vec![Box::new(MemPlugin), Box::new(MemPlugin)]);
        assert_eq!(result.err(), Some(PluginError::Duplicate(MEM.into())));
    }

    #[test]
    fn test_init_failure() {
        let result = PluginRegistry::load(vec![Box::new(Failing)]);
        assert!(matches!(result, Err(PluginError::Init { .. })));
    }

    #[test]
    fn test_unknown_datastore() {
        let registry = load_plugins().unwrap();
        assert!(registry.datastore(FLATFS).is_ok());
        assert_eq!(
            registry.datastore("leveldb").err(),
            Some(PluginError::UnknownDatastore("leveldb".into()))
        );
    }
}
