//! The HTTP surface: Kubernetes-style list/get/log routes over the merged
//! live + archive view.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{OriginalUri, Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use kube::discovery::ApiCapabilities;
use kubearchive_shared::discovery::KindResolver;
use kubearchive_storage::{Database, QueryFilter};
use serde_json::json;

use crate::{
    auth::{self, Attributes},
    error::{ApiError, Result},
    live, logs,
    merge::{self, PageToken},
    params::ListQuery,
};

#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub resolver: Arc<KindResolver>,
    pub base_config: kube::Config,
    pub impersonation_allowed: bool,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/{resource}", get(core_cluster))
        .route("/api/v1/namespaces/{namespace}/{resource}", get(core_list))
        .route(
            "/api/v1/namespaces/{namespace}/{resource}/{name}",
            get(core_get),
        )
        .route(
            "/api/v1/namespaces/{namespace}/{resource}/{name}/log",
            get(core_log),
        )
        .route("/apis/{group}/{version}/{resource}", get(group_cluster))
        .route(
            "/apis/{group}/{version}/namespaces/{namespace}/{resource}",
            get(group_list),
        )
        .route(
            "/apis/{group}/{version}/namespaces/{namespace}/{resource}/{name}",
            get(group_get),
        )
        .route(
            "/apis/{group}/{version}/namespaces/{namespace}/{resource}/{name}/log",
            get(group_log),
        )
        .route("/livez", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(state)
}

/// The target of one request, normalized across the core and group routes.
struct Target {
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    name: Option<String>,
}

async fn core_cluster(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path(resource): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    let target = Target {
        group: String::new(),
        version: "v1".to_owned(),
        resource,
        namespace: None,
        name: None,
    };
    respond(handle_list(&state, &headers, target, query).await, &uri)
}

async fn core_list(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path((namespace, resource)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Response {
    let target = Target {
        group: String::new(),
        version: "v1".to_owned(),
        resource,
        namespace: Some(namespace),
        name: None,
    };
    respond(handle_list(&state, &headers, target, query).await, &uri)
}

async fn core_get(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path((namespace, resource, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
) -> Response {
    let target = Target {
        group: String::new(),
        version: "v1".to_owned(),
        resource,
        namespace: Some(namespace),
        name: Some(name),
    };
    respond(handle_list(&state, &headers, target, query).await, &uri)
}

async fn core_log(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path((namespace, resource, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
) -> Response {
    let target = Target {
        group: String::new(),
        version: "v1".to_owned(),
        resource,
        namespace: Some(namespace),
        name: Some(name),
    };
    respond(handle_log(&state, &headers, target, query).await, &uri)
}

async fn group_cluster(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path((group, version, resource)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
) -> Response {
    let target = Target {
        group,
        version,
        resource,
        namespace: None,
        name: None,
    };
    respond(handle_list(&state, &headers, target, query).await, &uri)
}

async fn group_list(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path((group, version, namespace, resource)): Path<(String, String, String, String)>,
    Query(query): Query<ListQuery>,
) -> Response {
    let target = Target {
        group,
        version,
        resource,
        namespace: Some(namespace),
        name: None,
    };
    respond(handle_list(&state, &headers, target, query).await, &uri)
}

async fn group_get(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path((group, version, namespace, resource, name)): Path<(String, String, String, String, String)>,
    Query(query): Query<ListQuery>,
) -> Response {
    let target = Target {
        group,
        version,
        resource,
        namespace: Some(namespace),
        name: Some(name),
    };
    respond(handle_list(&state, &headers, target, query).await, &uri)
}

async fn group_log(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path((group, version, namespace, resource, name)): Path<(String, String, String, String, String)>,
    Query(query): Query<ListQuery>,
) -> Response {
    let target = Target {
        group,
        version,
        resource,
        namespace: Some(namespace),
        name: Some(name),
    };
    respond(handle_log(&state, &headers, target, query).await, &uri)
}

fn respond(result: Result<Response>, uri: &axum::http::Uri) -> Response {
    match result {
        Ok(response) => response,
        Err(error) => error.into_response_for(uri),
    }
}

async fn handle_list(
    state: &AppState,
    headers: &HeaderMap,
    target: Target,
    query: ListQuery,
) -> Result<Response> {
    let named_get = target.name.is_some();
    let resolved = query.resolve(target.name.as_deref())?;

    let (resource, capabilities) = resolve_target(state, &target).await?;

    let caller = auth::authorize(
        &state.base_config,
        state.impersonation_allowed,
        headers,
        Attributes {
            verb: if named_get { "get" } else { "list" }.to_owned(),
            group: target.group.clone(),
            resource: target.resource.clone(),
            namespace: target.namespace.clone(),
        },
    )
    .await?;

    let filter = QueryFilter {
        namespace: target.namespace.clone(),
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
        name: resolved.name.clone(),
        label_selector: resolved.label_selector.clone(),
        created_after: resolved.created_after,
        created_before: resolved.created_before,
    };

    let token = PageToken::decode(resolved.continue_token.as_deref(), &filter)?;

    // Both sides run concurrently and both must settle before the response.
    let live_future = async {
        if token.live_done {
            Ok(None)
        } else {
            live::list(
                caller.clone(),
                &resource,
                &capabilities.scope,
                target.namespace.as_deref(),
                &resolved,
                token.live.as_deref(),
            )
            .await
            .map(Some)
        }
    };
    let archive_future =
        state
            .database
            .list_resources(&filter, resolved.limit, token.archive.as_deref());

    let (live_result, archive_result) = tokio::join!(live_future, archive_future);

    // a live-side failure dominates the response
    let live_result = live_result?;
    let archive_page = archive_result.map_err(ApiError::from)?;

    let merged = merge::assemble(&token, &filter, resolved.limit, live_result, archive_page);

    if named_get {
        // GET of a single named resource returns the object, not a list
        return match merged.items.into_iter().next() {
            Some(item) => Ok(Json(item).into_response()),
            None => Err(ApiError::NotFound),
        };
    }

    if merged.items.is_empty() && merged.live_not_served && merged.continue_token.is_none() {
        // neither side knows this resource at all
        return Err(ApiError::NotFound);
    }

    let envelope = json!({
        "apiVersion": resource.api_version,
        "kind": format!("{}List", resource.kind),
        "metadata": {
            "continue": merged.continue_token.unwrap_or_default(),
        },
        "items": merged.items,
    });

    Ok(Json(envelope).into_response())
}

async fn handle_log(
    state: &AppState,
    headers: &HeaderMap,
    target: Target,
    query: ListQuery,
) -> Result<Response> {
    let namespace = target
        .namespace
        .clone()
        .ok_or_else(|| ApiError::bad_request("log requests must name a namespace"))?;
    let name = target
        .name
        .clone()
        .ok_or_else(|| ApiError::bad_request("log requests must name a resource"))?;
    if name.contains('*') {
        return Err(ApiError::bad_request("wildcards are not allowed in the path"));
    }

    let (resource, _) = resolve_target(state, &target).await?;

    let caller = auth::authorize(
        &state.base_config,
        state.impersonation_allowed,
        headers,
        Attributes {
            verb: "get".to_owned(),
            group: target.group.clone(),
            resource: target.resource.clone(),
            namespace: Some(namespace.clone()),
        },
    )
    .await?;

    let container = query.container.clone();

    logs::stream(
        &state.database,
        &state.http,
        caller,
        &resource,
        &namespace,
        &name,
        container.as_deref(),
    )
    .await
}

async fn resolve_target(
    state: &AppState,
    target: &Target,
) -> Result<(kube::api::ApiResource, ApiCapabilities)> {
    state
        .resolver
        .by_plural(&target.group, &target.version, &target.resource)
        .await
        .map_err(|error| {
            tracing::debug!(%error, resource = %target.resource, "failed to resolve resource");
            ApiError::NotFound
        })
}
