//! Merging the cluster-wide defaults and the per-namespace configs into the
//! `SinkFilter` the sink consumes.
//!
//! Override semantics per `(apiVersion, kind)`: a namespace's non-empty
//! expression replaces the cluster-wide one for that kind, field by field
//! (archiveWhen, deleteWhen and archiveOnDelete independently). Kinds a
//! namespace does not mention are inherited whole. The untouched cluster
//! portion is additionally stored under the global pseudo namespace, where
//! the sink falls back to for namespaces without any config.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use kubearchive_crd::{ArchiveResourceSpec, SinkFilterSpec};
use kubearchive_shared::constants::GLOBAL_KEY;

/// Builds the complete filter map from the current cluster state.
pub fn build_sink_filter(
    cluster: &[ArchiveResourceSpec],
    namespaces: &BTreeMap<String, Vec<ArchiveResourceSpec>>,
) -> SinkFilterSpec {
    let mut merged = IndexMap::new();

    if !cluster.is_empty() {
        merged.insert(GLOBAL_KEY.to_owned(), cluster.to_vec());
    }

    for (namespace, local) in namespaces {
        merged.insert(namespace.clone(), merge_namespace(cluster, local));
    }

    SinkFilterSpec { namespaces: merged }
}

fn merge_namespace(
    cluster: &[ArchiveResourceSpec],
    local: &[ArchiveResourceSpec],
) -> Vec<ArchiveResourceSpec> {
    let mut result: Vec<ArchiveResourceSpec> = local.to_vec();

    for global in cluster {
        let key = global.selector.canonical_key();

        match result
            .iter_mut()
            .find(|spec| spec.selector.canonical_key() == key)
        {
            // kind not mentioned locally: inherit the whole global spec
            None => result.push(global.clone()),

            // kind mentioned locally: fill the fields the namespace left
            // empty from the global spec
            Some(spec) => {
                if spec.archive_when.trim().is_empty() {
                    spec.archive_when = global.archive_when.clone();
                }
                if spec.delete_when.trim().is_empty() {
                    spec.delete_when = global.delete_when.clone();
                }
                if spec.archive_on_delete.trim().is_empty() {
                    spec.archive_on_delete = global.archive_on_delete.clone();
                }
                if spec.keep_last_when.is_empty() {
                    spec.keep_last_when = global.keep_last_when.clone();
                }
            }
        }
    }

    result
}

/// All `(apiVersion, kind)` pairs referenced anywhere in the filter map.
pub fn referenced_kinds(sink_filter: &SinkFilterSpec) -> Vec<(String, String)> {
    let mut kinds: Vec<(String, String)> = sink_filter
        .namespaces
        .values()
        .flatten()
        .map(|spec| spec.selector.canonical_key())
        .collect();

    kinds.sort();
    kinds.dedup();
    kinds
}

/// All real namespaces (the global pseudo namespace excluded) in the map.
pub fn referenced_namespaces(sink_filter: &SinkFilterSpec) -> Vec<String> {
    sink_filter
        .namespaces
        .keys()
        .filter(|namespace| *namespace != GLOBAL_KEY)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use kubearchive_crd::{KeepLastWhen, ResourceSelector};

    use super::*;

    fn spec(api_version: &str, kind: &str, archive: &str, delete: &str) -> ArchiveResourceSpec {
        ArchiveResourceSpec {
            selector: ResourceSelector {
                api_version: api_version.to_owned(),
                kind: kind.to_owned(),
                label_selector: None,
            },
            archive_when: archive.to_owned(),
            delete_when: delete.to_owned(),
            ..ArchiveResourceSpec::default()
        }
    }

    #[test]
    fn cluster_spec_lands_under_the_global_key() {
        let cluster = vec![spec("v1", "Pod", "true", "")];
        let merged = build_sink_filter(&cluster, &BTreeMap::new());

        assert_eq!(merged.namespaces.len(), 1);
        assert_eq!(merged.namespaces[GLOBAL_KEY][0].archive_when, "true");
    }

    #[test]
    fn unmentioned_kinds_are_inherited_whole() {
        let cluster = vec![spec("v1", "Pod", "true", "")];
        let namespaces = BTreeMap::from([(
            "team-a".to_owned(),
            vec![spec("batch/v1", "Job", "has(status.completionTime)", "")],
        )]);

        let merged = build_sink_filter(&cluster, &namespaces);
        let team_a = &merged.namespaces["team-a"];

        assert_eq!(team_a.len(), 2);
        assert_eq!(team_a[0].selector.kind, "Job");
        assert_eq!(team_a[1].selector.kind, "Pod");
        assert_eq!(team_a[1].archive_when, "true");
    }

    #[test]
    fn local_expressions_override_field_by_field() {
        let cluster = vec![spec(
            "v1",
            "Pod",
            "status.phase == 'Succeeded'",
            "status.phase == 'Failed'",
        )];
        // local only overrides archiveWhen; deleteWhen stays global
        let namespaces = BTreeMap::from([(
            "team-a".to_owned(),
            vec![spec("v1", "Pod", "status.phase != 'Pending'", "")],
        )]);

        let merged = build_sink_filter(&cluster, &namespaces);
        let pod = &merged.namespaces["team-a"][0];

        assert_eq!(pod.archive_when, "status.phase != 'Pending'");
        assert_eq!(pod.delete_when, "status.phase == 'Failed'");
    }

    #[test]
    fn retention_clauses_are_inherited_when_absent() {
        let mut global = spec("batch/v1", "Job", "true", "");
        global.keep_last_when = vec![KeepLastWhen {
            when: "true".into(),
            count: 3,
            order_by: None,
        }];

        let namespaces = BTreeMap::from([(
            "team-a".to_owned(),
            vec![spec("batch/v1", "Job", "has(status.completionTime)", "")],
        )]);

        let merged = build_sink_filter(&[global], &namespaces);
        assert_eq!(merged.namespaces["team-a"][0].keep_last_when[0].count, 3);
    }

    #[test]
    fn selector_keys_are_canonicalized_before_matching() {
        let cluster = vec![spec(" v1 ", "Pod", "true", "")];
        let namespaces = BTreeMap::from([(
            "team-a".to_owned(),
            vec![spec("v1", "Pod ", "status.phase == 'Succeeded'", "")],
        )]);

        let merged = build_sink_filter(&cluster, &namespaces);
        // one merged entry, not two
        assert_eq!(merged.namespaces["team-a"].len(), 1);
    }

    #[test]
    fn referenced_kinds_deduplicate_across_namespaces() {
        let cluster = vec![spec("v1", "Pod", "true", "")];
        let namespaces = BTreeMap::from([
            ("a".to_owned(), vec![spec("v1", "Pod", "x == 1", "")]),
            ("b".to_owned(), vec![spec("batch/v1", "Job", "true", "")]),
        ]);

        let merged = build_sink_filter(&cluster, &namespaces);
        assert_eq!(
            referenced_kinds(&merged),
            vec![
                ("batch/v1".to_owned(), "Job".to_owned()),
                ("v1".to_owned(), "Pod".to_owned()),
            ]
        );
        assert_eq!(referenced_namespaces(&merged), vec!["a", "b"]);
    }
}
