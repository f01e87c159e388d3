//! A thin, read-only view over the JSON document of a Kubernetes resource.
//!
//! Events arrive at the sink as untyped JSON. Instead of deserializing into
//! per-kind structs (the set of kinds is user-configured and open), all
//! components share this envelope which exposes the handful of fields the
//! archive cares about.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use snafu::{OptionExt, Snafu};
use uuid::Uuid;

use crate::constants::LOG_URLS_ANNOTATION;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("resource is missing required field {field:?}"))]
    MissingField { field: &'static str },

    #[snafu(display("resource field metadata.uid {uid:?} is not a UUID"))]
    MalformedUid { uid: String },
}

/// The identifying tuple every archived resource must carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceKey {
    pub uid: Uuid,
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// A borrowed view over a resource JSON object.
///
/// Construction never fails; accessors return `Option` for absent fields so
/// callers decide whether absence is an error ([`ResourceDocument::key`]) or
/// simply "no data".
#[derive(Clone, Copy, Debug)]
pub struct ResourceDocument<'a> {
    value: &'a Value,
}

impl<'a> ResourceDocument<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }

    pub fn as_value(&self) -> &'a Value {
        self.value
    }

    pub fn api_version(&self) -> Option<&'a str> {
        self.value.get("apiVersion")?.as_str()
    }

    pub fn kind(&self) -> Option<&'a str> {
        self.value.get("kind")?.as_str()
    }

    fn metadata_str(&self, field: &str) -> Option<&'a str> {
        self.value.get("metadata")?.get(field)?.as_str()
    }

    pub fn name(&self) -> Option<&'a str> {
        self.metadata_str("name")
    }

    pub fn namespace(&self) -> Option<&'a str> {
        self.metadata_str("namespace")
    }

    pub fn resource_version(&self) -> Option<&'a str> {
        self.metadata_str("resourceVersion")
    }

    pub fn uid(&self) -> Option<&'a str> {
        self.metadata_str("uid")
    }

    pub fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.metadata_str("creationTimestamp")?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    fn metadata_string_map(&self, field: &str) -> BTreeMap<String, String> {
        self.value
            .get("metadata")
            .and_then(|meta| meta.get(field))
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_owned())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata_string_map("labels")
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata_string_map("annotations")
    }

    /// The uids of all owner references which parse as UUIDs. Self references
    /// are dropped here so ownership edges can never be trivially cyclic.
    pub fn owner_uids(&self) -> Vec<Uuid> {
        let own_uid = self.uid().and_then(|uid| Uuid::parse_str(uid).ok());

        self.value
            .get("metadata")
            .and_then(|meta| meta.get("ownerReferences"))
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| r.get("uid")?.as_str())
                    .filter_map(|uid| Uuid::parse_str(uid).ok())
                    .filter(|uid| Some(*uid) != own_uid)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Log locations recorded by the log collection pipeline, if any.
    pub fn log_urls(&self) -> Vec<LogUrl> {
        let Some(raw) = self.annotations().remove(LOG_URLS_ANNOTATION) else {
            return Vec::new();
        };

        match serde_json::from_str::<Vec<LogUrl>>(&raw) {
            Ok(urls) => urls,
            Err(error) => {
                tracing::warn!(%error, "ignoring malformed log-url annotation");
                Vec::new()
            }
        }
    }

    /// Extracts the identifying tuple, failing on the first missing field.
    pub fn key(&self) -> Result<ResourceKey> {
        let uid = self.uid().context(MissingFieldSnafu {
            field: "metadata.uid",
        })?;
        let uid = Uuid::parse_str(uid).ok().context(MalformedUidSnafu {
            uid: uid.to_owned(),
        })?;

        Ok(ResourceKey {
            uid,
            api_version: self
                .api_version()
                .context(MissingFieldSnafu {
                    field: "apiVersion",
                })?
                .to_owned(),
            kind: self
                .kind()
                .context(MissingFieldSnafu { field: "kind" })?
                .to_owned(),
            namespace: self
                .namespace()
                .context(MissingFieldSnafu {
                    field: "metadata.namespace",
                })?
                .to_owned(),
            name: self
                .name()
                .context(MissingFieldSnafu {
                    field: "metadata.name",
                })?
                .to_owned(),
        })
    }
}

/// One archived container log location.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LogUrl {
    pub container: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "busybox",
                "namespace": "default",
                "uid": "2b42e7a1-5e3c-4e2b-9c8e-6d2d2f9f0b3a",
                "resourceVersion": "12345",
                "creationTimestamp": "2024-05-01T10:00:00Z",
                "labels": {"app": "busybox", "env": "dev"},
                "annotations": {
                    "kubearchive.org/log-urls": "[{\"container\":\"main\",\"url\":\"s3://logs/busybox/main\"}]"
                },
                "ownerReferences": [
                    {"apiVersion": "batch/v1", "kind": "Job", "name": "j", "uid": "9a0f54c2-0000-4e2b-9c8e-6d2d2f9f0b3a"}
                ]
            },
            "status": {"phase": "Running"}
        })
    }

    #[test]
    fn key_extraction() {
        let value = pod();
        let doc = ResourceDocument::new(&value);
        let key = doc.key().unwrap();

        assert_eq!(key.kind, "Pod");
        assert_eq!(key.namespace, "default");
        assert_eq!(key.name, "busybox");
        assert_eq!(
            key.uid,
            Uuid::parse_str("2b42e7a1-5e3c-4e2b-9c8e-6d2d2f9f0b3a").unwrap()
        );
    }

    #[test]
    fn missing_uid_is_an_error() {
        let mut value = pod();
        value["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("uid")
            .unwrap();

        let doc = ResourceDocument::new(&value);
        assert_eq!(
            doc.key().unwrap_err(),
            Error::MissingField {
                field: "metadata.uid"
            }
        );
    }

    #[test]
    fn log_urls_from_annotation() {
        let value = pod();
        let doc = ResourceDocument::new(&value);

        assert_eq!(
            doc.log_urls(),
            vec![LogUrl {
                container: "main".to_owned(),
                url: "s3://logs/busybox/main".to_owned(),
            }]
        );
    }

    #[test]
    fn self_owner_reference_is_dropped() {
        let mut value = pod();
        value["metadata"]["ownerReferences"]
            .as_array_mut()
            .unwrap()
            .push(json!({"uid": "2b42e7a1-5e3c-4e2b-9c8e-6d2d2f9f0b3a"}));

        let doc = ResourceDocument::new(&value);
        assert_eq!(doc.owner_uids().len(), 1);
    }

    #[test]
    fn creation_timestamp_parses() {
        let value = pod();
        let doc = ResourceDocument::new(&value);
        assert_eq!(
            doc.creation_timestamp().unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
    }
}
