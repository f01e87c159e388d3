//! The `/log` subresource: streaming archived container logs.

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kube::{Client, api::ApiResource};
use kubearchive_storage::Database;
use reqwest::Client as HttpClient;

use crate::error::{ApiError, Result};

/// Resolves the named resource to an archived log location (walking the
/// ownership edges) and streams the object store's content. When the
/// archive has nothing and the resource is a Pod, falls through to the live
/// kubelet logs with the caller's identity.
pub async fn stream(
    database: &Database,
    http: &HttpClient,
    caller: Client,
    resource: &ApiResource,
    namespace: &str,
    name: &str,
    container: Option<&str>,
) -> Result<Response> {
    let locations = match database
        .log_urls_for(
            namespace,
            &resource.api_version,
            &resource.kind,
            name,
            container,
        )
        .await
    {
        Ok(locations) => locations,
        Err(kubearchive_storage::Error::NotFound) => Vec::new(),
        Err(error) => return Err(error.into()),
    };

    match locations.first() {
        Some(location) => {
            tracing::debug!(
                namespace,
                name,
                container = %location.container,
                "streaming archived log"
            );
            stream_object_store(http, &location.url).await
        }
        None if resource.kind == "Pod" => live_pod_logs(caller, namespace, name, container).await,
        None => Err(ApiError::NotFound),
    }
}

/// Streams the external object-store URL, propagating its status code.
async fn stream_object_store(http: &HttpClient, url: &str) -> Result<Response> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|error| ApiError::internal(format!("log store request failed: {error}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Upstream {
            status: status.as_u16(),
            message: format!("log store answered with status {status}"),
        });
    }

    let body = Body::from_stream(response.bytes_stream());
    Ok((StatusCode::OK, body).into_response())
}

async fn live_pod_logs(
    caller: Client,
    namespace: &str,
    name: &str,
    container: Option<&str>,
) -> Result<Response> {
    let mut path = format!("/api/v1/namespaces/{namespace}/pods/{name}/log");
    if let Some(container) = container {
        path.push_str(&format!("?container={container}"));
    }

    let request = http::Request::get(path)
        .body(Vec::new())
        .map_err(|error| ApiError::internal(format!("failed to build log request: {error}")))?;

    let text = caller
        .request_text(request)
        .await
        .map_err(ApiError::from)?;

    Ok((StatusCode::OK, text).into_response())
}
