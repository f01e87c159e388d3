//! Building the shared ApiServerSource which streams resource lifecycle
//! events into the sink.
//!
//! The source CRD belongs to the eventing installation, so it is applied as
//! a [`DynamicObject`] rather than a typed struct.

use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta};
use kubearchive_shared::constants::{A13E_NAME, SINK_NAME};
use serde_json::json;

use crate::rbac::managed_labels;

pub fn api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "sources.knative.dev",
        "v1",
        "ApiServerSource",
    ))
}

/// The event source object: one `Resource`-mode source covering the union
/// of all referenced kinds, scoped to the union of configured namespaces.
pub fn build(
    operator_namespace: &str,
    kinds: &[(String, String)],
    namespaces: &[String],
) -> DynamicObject {
    let resources: Vec<_> = kinds
        .iter()
        .map(|(api_version, kind)| json!({"apiVersion": api_version, "kind": kind}))
        .collect();

    let mut source = DynamicObject::new(A13E_NAME, &api_resource()).data(json!({
        "spec": {
            "mode": "Resource",
            "serviceAccountName": A13E_NAME,
            "resources": resources,
            "sink": {
                "ref": {
                    "apiVersion": "v1",
                    "kind": "Service",
                    "name": SINK_NAME,
                    "namespace": operator_namespace,
                },
            },
            "namespaceSelector": {
                "matchExpressions": [{
                    "key": "kubernetes.io/metadata.name",
                    "operator": "In",
                    "values": namespaces,
                }],
            },
        },
    }));

    source.metadata = ObjectMeta {
        name: Some(A13E_NAME.to_owned()),
        namespace: Some(operator_namespace.to_owned()),
        labels: Some(managed_labels()),
        ..ObjectMeta::default()
    };

    source
}
