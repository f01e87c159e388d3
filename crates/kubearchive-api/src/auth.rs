//! Per-request authentication and authorization.
//!
//! The caller's bearer credential is turned into a Kubernetes client of its
//! own, and a `SelfSubjectAccessReview` is posted *as the caller* for the
//! requested verb/resource/namespace. The server never re-uses its own
//! service account for reads on behalf of callers.

use axum::http::HeaderMap;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::{Api, Client, api::PostParams, config::AuthInfo};
use secrecy::SecretString;

use crate::error::{ApiError, Result};

pub const IMPERSONATE_USER_HEADER: &str = "Impersonate-User";
pub const IMPERSONATE_GROUP_HEADER: &str = "Impersonate-Group";

/// What the caller wants to do, in RBAC vocabulary.
#[derive(Clone, Debug)]
pub struct Attributes {
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub namespace: Option<String>,
}

/// Builds a client carrying the caller's credential (and, if permitted, the
/// impersonation headers), then verifies authorization for `attributes`.
///
/// The returned client is what all live-cluster reads of this request go
/// through, so authorization and data access always share one identity.
pub async fn authorize(
    base_config: &kube::Config,
    impersonation_allowed: bool,
    headers: &HeaderMap,
    attributes: Attributes,
) -> Result<Client> {
    let token = bearer_token(headers)?;

    let mut config = base_config.clone();
    config.auth_info = AuthInfo {
        token: Some(SecretString::from(token)),
        ..AuthInfo::default()
    };

    if impersonation_allowed {
        if let Some(user) = header_value(headers, IMPERSONATE_USER_HEADER) {
            config.auth_info.impersonate = Some(user);

            let groups: Vec<String> = headers
                .get_all(IMPERSONATE_GROUP_HEADER)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .map(str::to_owned)
                .collect();
            if !groups.is_empty() {
                config.auth_info.impersonate_groups = Some(groups);
            }
        }
    }

    let client = Client::try_from(config)
        .map_err(|error| ApiError::internal(format!("failed to build client: {error}")))?;

    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                verb: Some(attributes.verb.clone()),
                group: Some(attributes.group.clone()),
                resource: Some(attributes.resource.clone()),
                namespace: attributes.namespace.clone(),
                ..ResourceAttributes::default()
            }),
            ..SelfSubjectAccessReviewSpec::default()
        },
        ..SelfSubjectAccessReview::default()
    };

    let reviews: Api<SelfSubjectAccessReview> = Api::all(client.clone());
    let response = reviews
        .create(&PostParams::default(), &review)
        .await
        .map_err(|error| match error {
            kube::Error::Api(response) if response.code == 401 => ApiError::Unauthorized {
                message: "invalid bearer credential".to_owned(),
            },
            other => ApiError::internal(format!("access review failed: {other}")),
        })?;

    let allowed = response.status.as_ref().is_some_and(|status| status.allowed);
    if !allowed {
        let reason = response
            .status
            .and_then(|status| status.reason)
            .unwrap_or_else(|| "access denied".to_owned());
        return Err(ApiError::Forbidden { message: reason });
    }

    Ok(client)
}

fn bearer_token(headers: &HeaderMap) -> Result<String> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .ok_or(ApiError::Unauthorized {
            message: "a bearer token is required".to_owned(),
        })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_authorization_header_is_unauthorized() {
        assert!(matches!(
            bearer_token(&HeaderMap::new()).unwrap_err(),
            ApiError::Unauthorized { .. }
        ));
    }

    #[test]
    fn basic_credentials_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Basic dXNlcjpwYXNz".parse().unwrap(),
        );
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer my-token".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).unwrap(), "my-token");
    }
}
