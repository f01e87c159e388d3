//! Listing live resources with the caller's own client.

use kube::{
    Api, Client,
    api::{ApiResource, DynamicObject, ListParams},
    discovery::Scope,
};
use serde_json::Value as Json;

use crate::{
    error::{ApiError, Result},
    params::ResolvedQuery,
};

/// A page of live results. `continue_token` is the apiserver's own opaque
/// continuation.
#[derive(Clone, Debug, Default)]
pub struct LivePage {
    pub items: Vec<Json>,
    pub continue_token: Option<String>,
}

/// The live side of a merge: either a page, or "this kind is not served by
/// the cluster" (treated as empty, but remembered for the 404 decision).
#[derive(Clone, Debug)]
pub enum LiveResult {
    Page(LivePage),
    NotServed,
}

/// Lists live resources. Label selectors and exact names push down to the
/// apiserver; wildcard names and creation-time windows filter client-side
/// (the apiserver cannot express either).
pub async fn list(
    client: Client,
    resource: &ApiResource,
    scope: &Scope,
    namespace: Option<&str>,
    query: &ResolvedQuery,
    continue_token: Option<&str>,
) -> Result<LiveResult> {
    let api: Api<DynamicObject> = match (scope, namespace) {
        (Scope::Namespaced, Some(namespace)) => {
            Api::namespaced_with(client, namespace, resource)
        }
        _ => Api::all_with(client, resource),
    };

    let mut params = ListParams::default().limit(query.limit);
    if !query.label_selector.is_empty() {
        params = params.labels(&query.label_selector.canonical());
    }
    if let Some(name) = &query.name
        && !name.is_wildcard()
    {
        params = params.fields(&format!("metadata.name={}", name.raw()));
    }
    if let Some(token) = continue_token {
        params.continue_token = Some(token.to_owned());
    }

    let list = match api.list(&params).await {
        Ok(list) => list,
        // an unknown kind on the live side merely means "nothing live"
        Err(kube::Error::Api(response)) if response.code == 404 => {
            return Ok(LiveResult::NotServed);
        }
        Err(error) => return Err(ApiError::from(error)),
    };

    let continue_token = list
        .metadata
        .continue_
        .clone()
        .filter(|token| !token.is_empty());

    let items = list
        .items
        .into_iter()
        .filter(|object| matches_client_side(object, query))
        .map(|object| to_resource_json(object, resource))
        .collect::<Result<Vec<_>>>()?;

    Ok(LiveResult::Page(LivePage {
        items,
        continue_token,
    }))
}

fn matches_client_side(object: &DynamicObject, query: &ResolvedQuery) -> bool {
    if let Some(pattern) = &query.name
        && pattern.is_wildcard()
        && !object
            .metadata
            .name
            .as_deref()
            .is_some_and(|name| pattern.matches(name))
    {
        return false;
    }

    if query.created_after.is_some() || query.created_before.is_some() {
        let Some(created) = object.metadata.creation_timestamp.as_ref() else {
            return false;
        };
        let created = chrono::DateTime::<chrono::Utc>::from_timestamp(
            created.0.as_second(),
            created.0.subsec_nanosecond().try_into().unwrap_or(0),
        )
        .unwrap_or_default();
        if query.created_after.is_some_and(|after| created < after) {
            return false;
        }
        if query.created_before.is_some_and(|before| created >= before) {
            return false;
        }
    }

    true
}

/// Serializes a live object into the same JSON shape the archive stores:
/// apiVersion and kind are filled in (list items come without them).
fn to_resource_json(object: DynamicObject, resource: &ApiResource) -> Result<Json> {
    let mut value = serde_json::to_value(&object)
        .map_err(|error| ApiError::internal(format!("failed to serialize live object: {error}")))?;

    if value.get("apiVersion").is_none() {
        value["apiVersion"] = Json::String(resource.api_version.clone());
    }
    if value.get("kind").is_none() {
        value["kind"] = Json::String(resource.kind.clone());
    }

    Ok(value)
}
