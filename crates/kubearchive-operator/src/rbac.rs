//! Builders for the RBAC objects each archived namespace needs.
//!
//! Three identities are maintained per namespace: the event-source listener
//! (`kubearchive-a13e`, read-only watch access), the sink (read plus delete,
//! granted via a namespaced Role to the sink's service account in the
//! operator namespace) and the vacuum (read-only list access plus broker
//! access in the operator namespace).

use std::collections::BTreeMap;

use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{ClusterRole, PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
use kube::api::ObjectMeta;
use kubearchive_shared::constants::{A13E_NAME, SINK_NAME, VACUUM_BROKER_BINDING, VACUUM_NAME};

/// A kind resolved to what RBAC rules speak: API group and plural resource.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RbacKind {
    pub group: String,
    pub plural: String,
}

/// Label set stamped on every object the operator manages, used both for
/// identification and for pruning by set difference.
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/managed-by".to_owned(),
        "kubearchive-operator".to_owned(),
    )])
}

fn metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: namespace.map(str::to_owned),
        labels: Some(managed_labels()),
        ..ObjectMeta::default()
    }
}

fn rules(kinds: &[RbacKind], verbs: &[&str]) -> Vec<PolicyRule> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for kind in kinds {
        grouped
            .entry(kind.group.clone())
            .or_default()
            .push(kind.plural.clone());
    }

    grouped
        .into_iter()
        .map(|(group, mut resources)| {
            resources.sort();
            resources.dedup();
            PolicyRule {
                api_groups: Some(vec![group]),
                resources: Some(resources),
                verbs: verbs.iter().map(|verb| (*verb).to_owned()).collect(),
                ..PolicyRule::default()
            }
        })
        .collect()
}

fn service_account(name: &str, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(name, Some(namespace)),
        ..ServiceAccount::default()
    }
}

/// The service account the event source impersonates to watch resources in
/// `namespace`.
pub fn listener_service_account(namespace: &str) -> ServiceAccount {
    service_account(A13E_NAME, namespace)
}

/// Cluster-wide read access to every referenced kind; bound per namespace
/// through [`listener_role_binding`].
pub fn listener_cluster_role(kinds: &[RbacKind]) -> ClusterRole {
    ClusterRole {
        metadata: metadata(A13E_NAME, None),
        rules: Some(rules(kinds, &["get", "list", "watch"])),
        ..ClusterRole::default()
    }
}

pub fn listener_role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: metadata(A13E_NAME, Some(namespace)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "ClusterRole".to_owned(),
            name: A13E_NAME.to_owned(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: A13E_NAME.to_owned(),
            namespace: Some(namespace.to_owned()),
            ..Subject::default()
        }]),
    }
}

/// Grants the sink permission to read and delete the namespace's archived
/// kinds.
pub fn sink_role(namespace: &str, kinds: &[RbacKind]) -> Role {
    Role {
        metadata: metadata(SINK_NAME, Some(namespace)),
        rules: Some(rules(kinds, &["get", "list", "delete"])),
    }
}

pub fn sink_role_binding(namespace: &str, operator_namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: metadata(SINK_NAME, Some(namespace)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "Role".to_owned(),
            name: SINK_NAME.to_owned(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: SINK_NAME.to_owned(),
            namespace: Some(operator_namespace.to_owned()),
            ..Subject::default()
        }]),
    }
}

pub fn vacuum_service_account(namespace: &str) -> ServiceAccount {
    service_account(VACUUM_NAME, namespace)
}

pub fn vacuum_role(namespace: &str, kinds: &[RbacKind]) -> Role {
    Role {
        metadata: metadata(VACUUM_NAME, Some(namespace)),
        rules: Some(rules(kinds, &["get", "list"])),
    }
}

pub fn vacuum_role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: metadata(VACUUM_NAME, Some(namespace)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "Role".to_owned(),
            name: VACUUM_NAME.to_owned(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: VACUUM_NAME.to_owned(),
            namespace: Some(namespace.to_owned()),
            ..Subject::default()
        }]),
    }
}

/// Grants every namespace's vacuum service account access to the broker in
/// the operator namespace. Applying this binding wholesale is what prunes
/// subjects of namespaces that dropped out: the subject list is replaced,
/// not appended to.
pub fn broker_role_binding(operator_namespace: &str, namespaces: &[String]) -> RoleBinding {
    RoleBinding {
        metadata: metadata(VACUUM_BROKER_BINDING, Some(operator_namespace)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "Role".to_owned(),
            name: VACUUM_BROKER_BINDING.to_owned(),
        },
        subjects: Some(
            namespaces
                .iter()
                .map(|namespace| Subject {
                    kind: "ServiceAccount".to_owned(),
                    name: VACUUM_NAME.to_owned(),
                    namespace: Some(namespace.clone()),
                    ..Subject::default()
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds() -> Vec<RbacKind> {
        vec![
            RbacKind {
                group: String::new(),
                plural: "pods".to_owned(),
            },
            RbacKind {
                group: "batch".to_owned(),
                plural: "jobs".to_owned(),
            },
            RbacKind {
                group: "batch".to_owned(),
                plural: "cronjobs".to_owned(),
            },
        ]
    }

    #[test]
    fn rules_group_by_api_group() {
        let role = sink_role("team-a", &kinds());
        let rules = role.rules.unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].api_groups, Some(vec![String::new()]));
        assert_eq!(rules[0].resources, Some(vec!["pods".to_owned()]));
        assert_eq!(
            rules[1].resources,
            Some(vec!["cronjobs".to_owned(), "jobs".to_owned()])
        );
        assert_eq!(rules[0].verbs, vec!["get", "list", "delete"]);
    }

    #[test]
    fn listener_gets_watch_but_not_delete() {
        let role = listener_cluster_role(&kinds());
        for rule in role.rules.unwrap() {
            assert!(rule.verbs.contains(&"watch".to_owned()));
            assert!(!rule.verbs.contains(&"delete".to_owned()));
        }
    }

    #[test]
    fn sink_subject_lives_in_the_operator_namespace() {
        let binding = sink_role_binding("team-a", "kubearchive");
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.namespace.as_deref(), Some("kubearchive"));
        assert_eq!(binding.metadata.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn broker_binding_carries_one_subject_per_namespace() {
        let binding =
            broker_role_binding("kubearchive", &["a".to_owned(), "b".to_owned()]);
        let subjects = binding.subjects.unwrap();

        assert_eq!(subjects.len(), 2);
        assert!(
            subjects
                .iter()
                .all(|subject| subject.name == VACUUM_NAME)
        );
    }

    #[test]
    fn everything_carries_the_managed_by_label() {
        let sa = vacuum_service_account("team-a");
        assert_eq!(
            sa.metadata.labels.unwrap()["app.kubernetes.io/managed-by"],
            "kubearchive-operator"
        );
    }
}
