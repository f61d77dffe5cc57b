use crate::config::ConfigMapRef;
use crate::snapshot::ProxyConfig;
use crate::state::ConfigState;
use anyhow::Context;
use futures::{StreamExt, TryStreamExt, future};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A change to the registry proxy configuration source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// New document contents
    Payload(String),
    /// The document is gone, fall back to the defaults
    Tombstone,
    /// A full list of the ConfigMap has been delivered
    Synced,
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, in-cluster Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

/// Creates the configuration ConfigMap from the built-in defaults when it does not exist yet.
///
/// Returns the configuration document the ConfigMap holds, `None` when it has no usable entry.
pub async fn ensure_config_map(
    client: &Client,
    config_map: &ConfigMapRef,
) -> anyhow::Result<Option<String>> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &config_map.namespace);
    if let Some(existing) = api
        .get_opt(&config_map.name)
        .await
        .context("Failed to look up registry proxy ConfigMap")?
    {
        debug!(
            "ConfigMap {}/{} already exists",
            config_map.namespace, config_map.name
        );
        return Ok(config_payload(&existing, &config_map.key).map(str::to_string));
    }

    let document = ProxyConfig::builtin()
        .to_yaml()
        .context("Failed to render default registry proxy config")?;
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map.name.clone()),
            namespace: Some(config_map.namespace.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(config_map.key.clone(), document.clone())])),
        ..Default::default()
    };

    api.create(&PostParams::default(), &cm)
        .await
        .with_context(|| {
            format!(
                "Failed to create ConfigMap {}/{}",
                config_map.namespace, config_map.name
            )
        })?;
    info!(
        "Created ConfigMap {}/{} from built-in defaults",
        config_map.namespace, config_map.name
    );
    Ok(Some(document))
}

/// The non-blank configuration document stored under `key`.
fn config_payload<'a>(cm: &'a ConfigMap, key: &str) -> Option<&'a str> {
    cm.data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(String::as_str)
        .filter(|payload| !payload.trim().is_empty())
}

/// Watches the configuration ConfigMap and forwards its changes until cancelled.
pub async fn watch_config_map(
    client: Client,
    config_map: ConfigMapRef,
    events: mpsc::Sender<ConfigEvent>,
    token: CancellationToken,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &config_map.namespace);
    let watcher_config =
        watcher::Config::default().fields(&format!("metadata.name={}", config_map.name));
    let mut stream = watcher(api, watcher_config).default_backoff().boxed();
    let mut tracker = ConfigMapTracker::new(config_map.key.clone());

    info!(
        "Watching ConfigMap {}/{} key {}",
        config_map.namespace, config_map.name, config_map.key
    );
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(event)) => {
                let listed = matches!(event, Event::InitDone);
                let config_events = tracker
                    .on_event(event)
                    .into_iter()
                    .chain(listed.then_some(ConfigEvent::Synced));
                let mut manager_gone = false;
                for config_event in config_events {
                    if events.send(config_event).await.is_err() {
                        manager_gone = true;
                        break;
                    }
                }
                if manager_gone {
                    warn!("Config manager is gone, stopping ConfigMap watch");
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => warn!("ConfigMap watch failed, retrying: {}", err),
        }
    }
    debug!("ConfigMap watch stopped");
}

/// Applies configuration events to the shared state, one at a time, until the sender is dropped.
pub async fn run_config_manager(state: ConfigState, mut events: mpsc::Receiver<ConfigEvent>) {
    while let Some(event) = events.recv().await {
        let result = match &event {
            ConfigEvent::Payload(payload) => state.apply(Some(payload.as_str())),
            ConfigEvent::Tombstone => state.apply(None),
            ConfigEvent::Synced => {
                if state.mark_synced() {
                    info!("Registry proxy configuration synced");
                }
                continue;
            }
        };
        if let Err(err) = result {
            warn!("Keeping previous registry proxy configuration: {}", err);
        }
    }
    debug!("Config manager stopped");
}

/// Keeps a cluster wide cache of namespaces for namespace label selection.
pub fn namespace_reflector(
    client: Client,
) -> (Store<Namespace>, impl Future<Output = ()> + Send + 'static) {
    let api: Api<Namespace> = Api::all(client);
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .for_each(|result| {
            if let Err(err) = result {
                warn!("Namespace watch failed, retrying: {}", err);
            }
            future::ready(())
        });
    (reader, stream)
}

/// Turns raw watch events for the single configuration ConfigMap into config events.
///
/// Replays of an already applied resource version are dropped. When a relist
/// no longer contains the ConfigMap, the deletion happened while the watch was
/// down and a tombstone is emitted.
struct ConfigMapTracker {
    key: String,
    resource_version: Option<String>,
    seen_in_relist: bool,
}

impl ConfigMapTracker {
    fn new(key: String) -> Self {
        Self {
            key,
            resource_version: None,
            seen_in_relist: false,
        }
    }

    fn on_event(&mut self, event: Event<ConfigMap>) -> Option<ConfigEvent> {
        match event {
            Event::Init => {
                self.seen_in_relist = false;
                None
            }
            Event::InitApply(cm) => {
                self.seen_in_relist = true;
                self.changed(&cm)
            }
            Event::Apply(cm) => self.changed(&cm),
            Event::Delete(cm) => {
                info!(
                    "ConfigMap {}/{} deleted",
                    cm.namespace().unwrap_or_default(),
                    cm.name_any()
                );
                self.resource_version = None;
                Some(ConfigEvent::Tombstone)
            }
            Event::InitDone => {
                if !self.seen_in_relist && self.resource_version.take().is_some() {
                    info!("ConfigMap disappeared while the watch was interrupted");
                    Some(ConfigEvent::Tombstone)
                } else {
                    None
                }
            }
        }
    }

    fn changed(&mut self, cm: &ConfigMap) -> Option<ConfigEvent> {
        let version = cm.resource_version();
        if version.is_some() && version == self.resource_version {
            debug!("ConfigMap {} unchanged at version {:?}", cm.name_any(), version);
            return None;
        }
        info!(
            "ConfigMap {}/{} changed",
            cm.namespace().unwrap_or_default(),
            cm.name_any()
        );
        self.resource_version = version;

        match config_payload(cm, &self.key) {
            Some(payload) => Some(ConfigEvent::Payload(payload.to_string())),
            None => {
                warn!(
                    "ConfigMap {} has no {} entry, using built-in defaults",
                    cm.name_any(),
                    self.key
                );
                Some(ConfigEvent::Tombstone)
            }
        }
    }
}
