//! The validation rules behind the admission webhooks.
//!
//! Each function aggregates every problem it finds into one list so a user
//! fixing a config sees all mistakes at once instead of one per retry.

use kubearchive_crd::{ArchiveResourceSpec, VacuumSelector};
use kubearchive_filter::Program;
use kubearchive_shared::constants::CONFIG_RESOURCE_NAME;

/// Validates a namespace or cluster archive config: the singleton name and
/// every non-empty expression.
pub fn validate_archive_config(name: &str, resources: &[ArchiveResourceSpec]) -> Vec<String> {
    let mut problems = Vec::new();

    if name != CONFIG_RESOURCE_NAME {
        problems.push(format!(
            "invalid name {name:?}: the config must be named {CONFIG_RESOURCE_NAME:?}"
        ));
    }

    problems.extend(validate_expressions(resources));
    problems
}

/// Compiles every expression of every spec, collecting all failures.
pub fn validate_expressions(resources: &[ArchiveResourceSpec]) -> Vec<String> {
    let mut problems = Vec::new();

    for spec in resources {
        let (api_version, kind) = spec.selector.canonical_key();
        if api_version.is_empty() || kind.is_empty() {
            problems.push("selector must carry both apiVersion and kind".to_owned());
            continue;
        }

        for (field, source) in spec.expressions() {
            // ordering keys evaluate to arbitrary comparable values, the
            // other expressions must be boolean
            let compiled = if field == "keepLastWhen.orderBy" {
                Program::compile_value(source)
            } else {
                Program::compile(source)
            };

            if let Err(error) = compiled {
                problems.push(format!("{kind} ({api_version}) {field}: {error}"));
            }
        }
    }

    problems
}

/// Validates that every vacuumed `(apiVersion, kind)` pair is archived by
/// some config; `known` is the union of pairs across the cluster's archive
/// configs at admission time.
pub fn validate_vacuum_selectors(
    selectors: &[VacuumSelector],
    known: &[(String, String)],
) -> Vec<String> {
    selectors
        .iter()
        .filter(|selector| {
            !known.contains(&(selector.api_version.clone(), selector.kind.clone()))
        })
        .map(|selector| {
            format!(
                "{} ({}) is not referenced by any archive config",
                selector.kind, selector.api_version
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use kubearchive_crd::{KeepLastWhen, ResourceSelector};

    use super::*;

    fn spec(archive_when: &str) -> ArchiveResourceSpec {
        ArchiveResourceSpec {
            selector: ResourceSelector {
                api_version: "v1".into(),
                kind: "Pod".into(),
                label_selector: None,
            },
            archive_when: archive_when.to_owned(),
            ..ArchiveResourceSpec::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(
            validate_archive_config("kubearchive", &[spec("status.phase == 'Succeeded'")])
                .is_empty()
        );
    }

    #[test]
    fn wrong_name_is_rejected() {
        let problems = validate_archive_config("my-config", &[]);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("must be named"));
    }

    #[test]
    fn syntax_errors_are_aggregated_with_position_info() {
        let problems = validate_archive_config(
            "kubearchive",
            &[spec("status.state *^ Completed'"), spec("(unclosed")],
        );

        assert_eq!(problems.len(), 2);
        assert!(problems.iter().all(|p| p.contains("Syntax error")), "{problems:?}");
    }

    #[test]
    fn retention_predicates_are_compiled_too() {
        let mut broken = spec("true");
        broken.keep_last_when = vec![KeepLastWhen {
            when: "status.succeeded >".into(),
            count: 1,
            order_by: None,
        }];

        let problems = validate_archive_config("kubearchive", &[broken]);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("keepLastWhen.when"));
    }

    #[test]
    fn ordering_keys_may_be_non_boolean() {
        let mut spec = spec("true");
        spec.keep_last_when = vec![KeepLastWhen {
            when: "status.succeeded > 0".into(),
            count: 2,
            order_by: Some("metadata.creationTimestamp".into()),
        }];

        assert!(validate_archive_config("kubearchive", &[spec]).is_empty());
    }

    #[test]
    fn empty_selector_is_rejected() {
        let mut incomplete = spec("true");
        incomplete.selector.kind = String::new();

        let problems = validate_archive_config("kubearchive", &[incomplete]);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("selector"));
    }

    #[test]
    fn vacuum_selectors_must_reference_archived_kinds() {
        let known = vec![("v1".to_owned(), "Pod".to_owned())];

        let fine = VacuumSelector {
            api_version: "v1".into(),
            kind: "Pod".into(),
        };
        let unknown = VacuumSelector {
            api_version: "batch/v1".into(),
            kind: "Job".into(),
        };

        assert!(validate_vacuum_selectors(&[fine.clone()], &known).is_empty());

        let problems = validate_vacuum_selectors(&[fine, unknown], &known);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("Job"));
    }
}
