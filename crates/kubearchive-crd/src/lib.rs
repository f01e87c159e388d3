//! The custom resources KubeArchive installs and reconciles.
//!
//! - [`KubeArchiveConfig`]: per-namespace archive configuration (singleton,
//!   name `kubearchive`).
//! - [`ClusterKubeArchiveConfig`]: cluster-wide defaults (singleton, name
//!   `kubearchive`).
//! - [`SinkFilter`]: the merged filter table the operator writes and the
//!   sink consumes (name `sink-filters`, operator namespace only).
//! - [`NamespaceVacuumConfig`] / [`ClusterVacuumConfig`]: which resources a
//!   vacuum run sweeps.

use indexmap::IndexMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Selects the resources an [`ArchiveResourceSpec`] applies to.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    pub api_version: String,
    pub kind: String,

    /// Restricts the selection further by labels. Only resources matching
    /// the selector are considered by the expressions below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

impl ResourceSelector {
    /// Canonical `(apiVersion, kind)` key with surrounding whitespace
    /// stripped, used wherever selectors are compared or merged.
    pub fn canonical_key(&self) -> (String, String) {
        (
            self.api_version.trim().to_owned(),
            self.kind.trim().to_owned(),
        )
    }
}

/// A retention clause: of all resources matching `when`, the first `count`
/// in `orderBy`-descending order are kept back from vacuum archival.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeepLastWhen {
    /// Partition predicate. An empty string selects every resource.
    #[serde(default)]
    pub when: String,

    /// How many of the most recent matches to keep back. Zero keeps nothing
    /// back, i.e. everything is archived.
    #[serde(default)]
    pub count: u32,

    /// Ordering key expression. Defaults to creation timestamp, ties broken
    /// by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
}

/// One entry of an archive configuration: a resource selector plus the three
/// policy expressions and optional retention clauses.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResourceSpec {
    pub selector: ResourceSelector,

    /// Archive the resource when this evaluates to true.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub archive_when: String,

    /// Archive the resource and then delete it from the cluster when this
    /// evaluates to true.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delete_when: String,

    /// Archive the resource when the cluster reports it deleted and this
    /// evaluates to true.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub archive_on_delete: String,

    /// Retention clauses applied by the vacuum. Clauses are independent and
    /// their kept-back sets union.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keep_last_when: Vec<KeepLastWhen>,
}

impl ArchiveResourceSpec {
    /// All non-empty expressions carried by this spec, for validation.
    pub fn expressions(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("archiveWhen", self.archive_when.as_str()),
            ("deleteWhen", self.delete_when.as_str()),
            ("archiveOnDelete", self.archive_on_delete.as_str()),
        ]
        .into_iter()
        .chain(
            self.keep_last_when
                .iter()
                .flat_map(|clause| {
                    [
                        ("keepLastWhen.when", clause.when.as_str()),
                        (
                            "keepLastWhen.orderBy",
                            clause.order_by.as_deref().unwrap_or(""),
                        ),
                    ]
                }),
        )
        .filter(|(_, source)| !source.trim().is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeArchiveConfigStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Namespace-scoped archive configuration. One per namespace, necessarily
/// named `kubearchive`.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubearchive.org",
    version = "v1",
    kind = "KubeArchiveConfig",
    plural = "kubearchiveconfigs",
    shortname = "kac",
    status = "KubeArchiveConfigStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubeArchiveConfigSpec {
    #[serde(default)]
    pub resources: Vec<ArchiveResourceSpec>,
}

/// Cluster-scoped archive defaults. A namespace config overrides these
/// field-by-field per `(apiVersion, kind)`.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubearchive.org",
    version = "v1",
    kind = "ClusterKubeArchiveConfig",
    plural = "clusterkubearchiveconfigs",
    shortname = "ckac",
    status = "KubeArchiveConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterKubeArchiveConfigSpec {
    #[serde(default)]
    pub resources: Vec<ArchiveResourceSpec>,
}

/// The merged filter table, written by the operator and read by the sink.
/// Keyed by namespace; the cluster-wide portion lives under the
/// [`GLOBAL_KEY`][kubearchive_shared::constants::GLOBAL_KEY] pseudo
/// namespace.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubearchive.org",
    version = "v1",
    kind = "SinkFilter",
    plural = "sinkfilters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SinkFilterSpec {
    #[serde(default)]
    pub namespaces: IndexMap<String, Vec<ArchiveResourceSpec>>,
}

/// A `(apiVersion, kind)` pair a vacuum run sweeps.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VacuumSelector {
    pub api_version: String,
    pub kind: String,
}

/// Vacuum configuration for a single namespace. An empty resource list
/// sweeps every kind the namespace has a filter entry for.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubearchive.org",
    version = "v1",
    kind = "NamespaceVacuumConfig",
    plural = "namespacevacuumconfigs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceVacuumConfigSpec {
    #[serde(default)]
    pub resources: Vec<VacuumSelector>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceVacuumList {
    #[serde(default)]
    pub resources: Vec<VacuumSelector>,
}

/// Cluster-wide vacuum configuration: a map keyed by namespace name or the
/// `___all-namespaces___` sentinel. Only valid in the operator namespace.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubearchive.org",
    version = "v1",
    kind = "ClusterVacuumConfig",
    plural = "clustervacuumconfigs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVacuumConfigSpec {
    #[serde(default)]
    pub namespaces: IndexMap<String, NamespaceVacuumList>,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use kubearchive_shared::constants::GLOBAL_KEY;

    use super::*;

    #[test]
    fn archive_config_deserializes_from_yaml() {
        let config: KubeArchiveConfigSpec = serde_yaml::from_str(indoc! {"
            resources:
              - selector:
                  apiVersion: batch/v1
                  kind: Job
                deleteWhen: has(status.completionTime)
                keepLastWhen:
                  - when: \"status.succeeded > 0\"
                    count: 3
              - selector:
                  apiVersion: v1
                  kind: Pod
                  labelSelector:
                    matchLabels:
                      app: web
                archiveWhen: \"status.phase == 'Succeeded'\"
        "})
        .unwrap();

        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].selector.kind, "Job");
        assert_eq!(config.resources[0].keep_last_when[0].count, 3);
        assert!(config.resources[0].archive_when.is_empty());
        assert!(
            config.resources[1]
                .selector
                .label_selector
                .as_ref()
                .unwrap()
                .match_labels
                .as_ref()
                .unwrap()
                .contains_key("app")
        );
    }

    #[test]
    fn expressions_iterator_skips_empty_sources() {
        let spec = ArchiveResourceSpec {
            selector: ResourceSelector {
                api_version: "v1".into(),
                kind: "Pod".into(),
                label_selector: None,
            },
            archive_when: String::new(),
            delete_when: "status.phase == 'Succeeded'".into(),
            archive_on_delete: String::new(),
            keep_last_when: vec![KeepLastWhen {
                when: "true".into(),
                count: 2,
                order_by: None,
            }],
        };

        let collected: Vec<_> = spec.expressions().collect();
        assert_eq!(
            collected,
            vec![
                ("deleteWhen", "status.phase == 'Succeeded'"),
                ("keepLastWhen.when", "true"),
            ]
        );
    }

    #[test]
    fn selector_keys_are_canonicalized() {
        let selector = ResourceSelector {
            api_version: " batch/v1 ".into(),
            kind: "Job\n".into(),
            label_selector: None,
        };
        assert_eq!(
            selector.canonical_key(),
            ("batch/v1".to_owned(), "Job".to_owned())
        );
    }

    #[test]
    fn sink_filter_round_trips_through_yaml() {
        let mut namespaces = IndexMap::new();
        namespaces.insert(
            GLOBAL_KEY.to_owned(),
            vec![ArchiveResourceSpec {
                selector: ResourceSelector {
                    api_version: "v1".into(),
                    kind: "Pod".into(),
                    label_selector: None,
                },
                archive_when: "true".into(),
                ..ArchiveResourceSpec::default()
            }],
        );
        let spec = SinkFilterSpec { namespaces };

        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back: SinkFilterSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(spec, back);
    }
}
