use crate::admission;
use crate::state::AppContext;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::AdmissionReview;

/// Ready only once the configuration and the namespace cache reflect the cluster.
pub async fn readiness_probe(State(ctx): State<AppContext>) -> impl IntoResponse {
    if ctx.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn mutate_pod(
    State(ctx): State<AppContext>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(admission::review(&ctx, review))
}

pub fn create_app(ctx: AppContext) -> Router {
    Router::new()
        .route("/mutate", post(mutate_pod))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::tests::{pod_review, test_context};
    use crate::state::ConfigState;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::runtime::{reflector, watcher};
    use serde_json::json;

    #[tokio::test]
    async fn test_liveness_probe_returns_no_content() {
        let live = liveness_probe().await.into_response();
        assert_eq!(live.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_readiness_probe_waits_for_initial_sync() {
        let (namespaces, mut writer) = reflector::store::<Namespace>();
        let ctx = AppContext::new(ConfigState::default(), namespaces);

        let ready = readiness_probe(State(ctx.clone())).await.into_response();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        ctx.config.mark_synced();
        let ready = readiness_probe(State(ctx.clone())).await.into_response();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitDone);
        ctx.wait_for_namespaces().await;
        let ready = readiness_probe(State(ctx)).await.into_response();
        assert_eq!(ready.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_mutate_pod_with_default_config() {
        let ctx = test_context(None);
        let review = pod_review(
            "default",
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "web"},
                "spec": {"containers": [{"name": "web", "image": "quay.io/org/web:1"}]}
            }),
        );

        let Json(response) = mutate_pod(State(ctx), Json(review)).await;
        let response = response.response.expect("Review should carry a response");
        assert!(response.allowed);
        assert_eq!(response.uid, "test-uid");

        let patch: serde_json::Value =
            serde_json::from_slice(&response.patch.expect("Should patch")).unwrap();
        assert_eq!(patch[0]["value"][0]["image"], "quay.m.daocloud.io/org/web:1");
    }
}
