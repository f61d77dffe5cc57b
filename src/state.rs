use crate::snapshot::{ConfigSnapshot, ProxyConfig};
use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::{ObjectRef, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse registry proxy configuration: {0}")]
    Deserialize(#[from] serde_yaml_ng::Error),
}

/// Handle to the configuration snapshot currently in effect.
///
/// Clones share the same slot. Replacing the snapshot is a single atomic
/// pointer swap, so readers see either the previous or the new snapshot.
#[derive(Clone)]
pub struct ConfigState {
    current: Arc<ArcSwap<ConfigSnapshot>>,
    synced: Arc<AtomicBool>,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self::new(ConfigSnapshot::defaults())
    }
}

impl ConfigState {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
            synced: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Replaces the snapshot from a raw YAML payload, or with the defaults when
    /// the payload is absent or blank, and returns the snapshot it stored.
    /// A payload that fails to parse leaves the previous snapshot in effect.
    pub fn apply(&self, payload: Option<&str>) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let snapshot = match payload.filter(|payload| !payload.trim().is_empty()) {
            Some(payload) => {
                let document: ProxyConfig = serde_yaml_ng::from_str(payload)?;
                ConfigSnapshot::from(document)
            }
            None => {
                info!("Resetting registry proxy configuration to built-in defaults");
                ConfigSnapshot::defaults()
            }
        };

        info!(
            "Applying registry proxy config, enabled: {}, {} proxies",
            snapshot.enabled,
            snapshot.registries.len()
        );
        let snapshot = Arc::new(snapshot);
        self.current.store(Arc::clone(&snapshot));
        match snapshot.render() {
            Ok(yaml) => info!("Current registry proxy config:\n{}", yaml),
            Err(err) => warn!("Failed to render registry proxy config: {}", err),
        }
        Ok(snapshot)
    }

    /// Records that the configuration source has been listed once. Returns
    /// `true` only for the first call.
    pub fn mark_synced(&self) -> bool {
        !self.synced.swap(true, Ordering::AcqRel)
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Shared state handed to the admission webserver.
#[derive(Clone)]
pub struct AppContext {
    pub(crate) config: ConfigState,
    pub(crate) namespaces: Store<Namespace>,
    namespaces_synced: Arc<AtomicBool>,
}

impl AppContext {
    pub fn new(config: ConfigState, namespaces: Store<Namespace>) -> Self {
        Self {
            config,
            namespaces,
            namespaces_synced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Labels of a namespace as last seen by the reflector. Unknown namespaces have no labels.
    pub fn namespace_labels(&self, namespace: &str) -> BTreeMap<String, String> {
        self.namespaces
            .get(&ObjectRef::new(namespace))
            .and_then(|ns| ns.metadata.labels.clone())
            .unwrap_or_default()
    }

    /// Resolves once the namespace store has completed its first list.
    pub async fn wait_for_namespaces(&self) {
        match self.namespaces.wait_until_ready().await {
            Ok(()) => {
                info!("Namespace cache synced");
                self.namespaces_synced.store(true, Ordering::Release);
            }
            Err(err) => warn!("Namespace cache will never be ready: {}", err),
        }
    }

    /// Ready to admit pods: the configuration and the namespace labels both reflect the cluster.
    pub fn is_ready(&self) -> bool {
        self.config.is_synced() && self.namespaces_synced.load(Ordering::Acquire)
    }
}
