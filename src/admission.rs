use crate::mutation::{self, MutationRequest, MutationResult};
use crate::state::AppContext;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Answers a pod admission review.
///
/// The pod is always allowed. It carries a JSON patch when at least one image
/// was moved to a proxy registry, and is denied only when the patch could not be built.
pub fn review(ctx: &AppContext, review: AdmissionReview<Pod>) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<Pod> = match review.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("Invalid admission request: {}", err);
            return AdmissionResponse::invalid(err.to_string()).into_review();
        }
    };

    respond(ctx, &req).into_review()
}

fn respond(ctx: &AppContext, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    let Some(pod) = req.object.as_ref() else {
        debug!("Admission request {} carries no pod, allowing", req.uid);
        return res;
    };

    let namespace = req
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_default();
    // Pods created by controllers only have a generateName at admission time
    let pod_name = pod
        .metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or_default();

    let snapshot = ctx.config.current();
    let request = mutation_request(pod, &namespace, ctx.namespace_labels(&namespace));

    match mutation::mutate(&snapshot, request) {
        Ok(MutationResult::Unchanged) => {
            debug!("Pod {}/{} left unchanged", namespace, pod_name);
            res
        }
        Ok(MutationResult::Patched { patch, rewrites }) => {
            for rewrite in &rewrites {
                info!(
                    "Proxy image of pod {}/{} {} {}: {} -> {}",
                    namespace, pod_name, rewrite.kind, rewrite.container, rewrite.from, rewrite.to
                );
            }
            match res.with_patch(patch) {
                Ok(res) => res,
                Err(err) => {
                    error!("Failed to encode patch for pod {}/{}: {}", namespace, pod_name, err);
                    AdmissionResponse::from(req).deny(format!("could not encode image patch: {}", err))
                }
            }
        }
        Err(err) => {
            error!("Failed to build patch for pod {}/{}: {}", namespace, pod_name, err);
            res.deny(err.to_string())
        }
    }
}

/// Extracts what the mutation engine needs from a pod.
pub fn mutation_request(
    pod: &Pod,
    namespace: &str,
    namespace_labels: BTreeMap<String, String>,
) -> MutationRequest {
    let spec = pod.spec.clone().unwrap_or_default();
    MutationRequest {
        namespace: namespace.to_string(),
        pod_labels: pod.metadata.labels.clone().unwrap_or_default(),
        namespace_labels,
        init_containers: spec.init_containers.unwrap_or_default(),
        containers: spec.containers,
        ephemeral_containers: spec.ephemeral_containers.unwrap_or_default(),
    }
}
