//! The validating admission webhooks guarding user configs.
//!
//! One endpoint per custom resource kind. Every endpoint follows the same
//! shape: decode the `AdmissionReview`, run the pure validation rules and
//! answer with a single aggregated allow/deny.

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use kube::{
    Api, Client, ResourceExt,
    api::ListParams,
    core::{
        DynamicObject,
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    },
};
use kubearchive_crd::{
    ClusterKubeArchiveConfigSpec, ClusterVacuumConfigSpec, KubeArchiveConfigSpec,
    NamespaceVacuumConfigSpec,
};
use kubearchive_shared::constants::CONFIG_RESOURCE_NAME;
use serde::de::DeserializeOwned;

mod validate;

pub use validate::{validate_archive_config, validate_expressions, validate_vacuum_selectors};

#[derive(Clone)]
pub struct WebhookContext {
    pub client: Client,
    pub operator_namespace: String,
}

pub fn router(ctx: Arc<WebhookContext>) -> Router {
    Router::new()
        .route("/validate-kubearchiveconfig", post(validate_namespace_config))
        .route(
            "/validate-clusterkubearchiveconfig",
            post(validate_cluster_config),
        )
        .route(
            "/validate-namespacevacuumconfig",
            post(validate_namespace_vacuum),
        )
        .route("/validate-clustervacuumconfig", post(validate_cluster_vacuum))
        .route("/health", axum::routing::get(|| async { "ok" }))
        .with_state(ctx)
}

/// Decodes the review, hands the object to `verdict` and wraps the outcome.
/// Undecodable reviews are denied rather than dropped, so a broken client
/// sees why.
async fn review<F>(review: AdmissionReview<DynamicObject>, verdict: F) -> Json<AdmissionReview<DynamicObject>>
where
    F: AsyncFnOnce(&AdmissionRequest<DynamicObject>, &DynamicObject) -> Vec<String>,
{
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(%error, "rejecting malformed admission review");
            let response = AdmissionResponse::invalid(error.to_string());
            return Json(response.into_review());
        }
    };

    let mut response = AdmissionResponse::from(&request);

    if let Some(object) = &request.object {
        let problems = verdict(&request, object).await;
        if !problems.is_empty() {
            tracing::info!(
                name = %object.name_any(),
                problems = problems.len(),
                "denying admission"
            );
            response = response.deny(problems.join("; "));
        }
    }

    Json(response.into_review())
}

fn spec_of<S: DeserializeOwned>(object: &DynamicObject) -> Result<S, String> {
    let spec = object.data.get("spec").cloned().unwrap_or_default();
    serde_json::from_value(spec).map_err(|error| format!("invalid spec: {error}"))
}

async fn validate_namespace_config(
    State(_ctx): State<Arc<WebhookContext>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review(body, async |_request, object| {
        match spec_of::<KubeArchiveConfigSpec>(object) {
            Ok(spec) => validate_archive_config(&object.name_any(), &spec.resources),
            Err(problem) => vec![problem],
        }
    })
    .await
}

async fn validate_cluster_config(
    State(_ctx): State<Arc<WebhookContext>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review(body, async |_request, object| {
        match spec_of::<ClusterKubeArchiveConfigSpec>(object) {
            Ok(spec) => validate_archive_config(&object.name_any(), &spec.resources),
            Err(problem) => vec![problem],
        }
    })
    .await
}

async fn validate_namespace_vacuum(
    State(ctx): State<Arc<WebhookContext>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review(body, async |_request, object| {
        match spec_of::<NamespaceVacuumConfigSpec>(object) {
            Ok(spec) => match archived_kinds(&ctx.client).await {
                Ok(known) => validate_vacuum_selectors(&spec.resources, &known),
                Err(problem) => vec![problem],
            },
            Err(problem) => vec![problem],
        }
    })
    .await
}

async fn validate_cluster_vacuum(
    State(ctx): State<Arc<WebhookContext>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review(body, async |_request, object| {
        // cluster-wide vacuums may only live next to the operator
        if object.namespace().as_deref() != Some(ctx.operator_namespace.as_str()) {
            return vec![format!(
                "cluster vacuum configs must live in the {:?} namespace",
                ctx.operator_namespace
            )];
        }

        match spec_of::<ClusterVacuumConfigSpec>(object) {
            Ok(spec) => match archived_kinds(&ctx.client).await {
                Ok(known) => spec
                    .namespaces
                    .values()
                    .flat_map(|list| validate_vacuum_selectors(&list.resources, &known))
                    .collect(),
                Err(problem) => vec![problem],
            },
            Err(problem) => vec![problem],
        }
    })
    .await
}

/// The `(apiVersion, kind)` pairs currently referenced by any archive
/// config, against which vacuum configs are checked.
async fn archived_kinds(client: &Client) -> Result<Vec<(String, String)>, String> {
    let mut known = Vec::new();

    let cluster = Api::<kubearchive_crd::ClusterKubeArchiveConfig>::all(client.clone())
        .get_opt(CONFIG_RESOURCE_NAME)
        .await
        .map_err(|error| format!("failed to read cluster config: {error}"))?;
    if let Some(config) = cluster {
        known.extend(
            config
                .spec
                .resources
                .iter()
                .map(|spec| spec.selector.canonical_key()),
        );
    }

    let configs = Api::<kubearchive_crd::KubeArchiveConfig>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|error| format!("failed to list archive configs: {error}"))?;
    for config in configs {
        known.extend(
            config
                .spec
                .resources
                .iter()
                .map(|spec| spec.selector.canonical_key()),
        );
    }

    known.sort();
    known.dedup();
    Ok(known)
}
