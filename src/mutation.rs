use crate::image_reference::{ImageReference, ParseError};
use crate::registry_map::RegistryMap;
use crate::snapshot::ConfigSnapshot;
use json_patch::jsonptr::PointerBuf;
use json_patch::{Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{Container, EphemeralContainer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

static INIT_CONTAINERS_PATH: &str = "/spec/initContainers";
static CONTAINERS_PATH: &str = "/spec/containers";

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Failed to serialize {path} for the image patch: {source}")]
    Serialize {
        path: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid image patch path {path}: {message}")]
    Path { path: &'static str, message: String },
}

/// Access to the image of any container flavour in a pod spec.
pub trait ContainerImage {
    fn name(&self) -> &str;
    fn image(&self) -> Option<&str>;
    fn set_image(&mut self, image: String);
}

impl ContainerImage for Container {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    fn set_image(&mut self, image: String) {
        self.image = Some(image);
    }
}

impl ContainerImage for EphemeralContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    fn set_image(&mut self, image: String) {
        self.image = Some(image);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Init,
    Regular,
    Ephemeral,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Init => write!(f, "init container"),
            ContainerKind::Regular => write!(f, "container"),
            ContainerKind::Ephemeral => write!(f, "ephemeral container"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MutationRequest {
    pub namespace: String,
    pub pod_labels: BTreeMap<String, String>,
    pub namespace_labels: BTreeMap<String, String>,
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    pub ephemeral_containers: Vec<EphemeralContainer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRewrite {
    pub kind: ContainerKind,
    pub container: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationResult {
    Unchanged,
    Patched {
        patch: Patch,
        rewrites: Vec<ImageRewrite>,
    },
}

/// Rewrites the pod's images to their proxy registries.
///
/// Ephemeral container images are rewritten and reported in `rewrites`, but
/// only the init container and container arrays are ever patched, each one
/// replaced as a whole and only when one of its images changed.
pub fn mutate(
    snapshot: &ConfigSnapshot,
    request: MutationRequest,
) -> Result<MutationResult, MutationError> {
    if !snapshot.enabled {
        debug!("Registry proxy is disabled, leaving pod untouched");
        return Ok(MutationResult::Unchanged);
    }
    if !snapshot.policy.is_included(
        &request.namespace,
        &request.pod_labels,
        &request.namespace_labels,
    ) {
        debug!(
            "Pod in namespace {} is not selected by the registry proxy policy",
            request.namespace
        );
        return Ok(MutationResult::Unchanged);
    }
    if snapshot.registries.is_empty() {
        debug!("No proxy registries configured, leaving pod untouched");
        return Ok(MutationResult::Unchanged);
    }

    let MutationRequest {
        mut init_containers,
        mut containers,
        mut ephemeral_containers,
        ..
    } = request;
    let registries = &snapshot.registries;
    let mut rewrites = Vec::new();

    let init_changed = rewrite_images(
        registries,
        ContainerKind::Init,
        &mut init_containers,
        &mut rewrites,
    );
    let containers_changed = rewrite_images(
        registries,
        ContainerKind::Regular,
        &mut containers,
        &mut rewrites,
    );
    rewrite_images(
        registries,
        ContainerKind::Ephemeral,
        &mut ephemeral_containers,
        &mut rewrites,
    );

    let mut operations = Vec::with_capacity(2);
    if init_changed {
        operations.push(replace_operation(INIT_CONTAINERS_PATH, &init_containers)?);
    }
    if containers_changed {
        operations.push(replace_operation(CONTAINERS_PATH, &containers)?);
    }

    if operations.is_empty() {
        return Ok(MutationResult::Unchanged);
    }
    Ok(MutationResult::Patched {
        patch: Patch(operations),
        rewrites,
    })
}

/// Returns the proxied form of `image`, or `None` when its registry has no proxy.
pub fn proxy_image(registries: &RegistryMap, image: &str) -> Result<Option<String>, ParseError> {
    let reference = ImageReference::parse(image)?;
    let proxy = registries.get(&reference.registry);
    if proxy == reference.registry {
        return Ok(None);
    }
    Ok(Some(reference.with_registry(proxy).to_string()))
}

fn rewrite_images<C: ContainerImage>(
    registries: &RegistryMap,
    kind: ContainerKind,
    containers: &mut [C],
    rewrites: &mut Vec<ImageRewrite>,
) -> bool {
    let mut changed = false;
    for container in containers.iter_mut() {
        let Some(image) = container.image().map(str::to_owned) else {
            continue;
        };
        match proxy_image(registries, &image) {
            Ok(Some(proxied)) => {
                rewrites.push(ImageRewrite {
                    kind,
                    container: container.name().to_string(),
                    from: image,
                    to: proxied.clone(),
                });
                container.set_image(proxied);
                changed = true;
            }
            Ok(None) => {}
            Err(err) => warn!(
                "Leaving image {} of {} {} unchanged: {}",
                image,
                kind,
                container.name(),
                err
            ),
        }
    }
    changed
}

fn replace_operation<T: Serialize>(
    path: &'static str,
    value: &T,
) -> Result<PatchOperation, MutationError> {
    let value =
        serde_json::to_value(value).map_err(|source| MutationError::Serialize { path, source })?;
    let path = PointerBuf::parse(path).map_err(|err| MutationError::Path {
        path,
        message: err.to_string(),
    })?;
    Ok(PatchOperation::Replace(ReplaceOperation { path, value }))
}
