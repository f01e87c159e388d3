//! The unified filter table the sink consults for every event.
//!
//! Maps `(namespace, apiVersion, kind)` to the three compiled predicates.
//! Readers take a shared lock and evaluate under it (evaluation is pure CPU;
//! the lock never spans I/O). A rebuild compiles a complete replacement
//! table first and only then swaps it in under the write lock, so a broken
//! configuration can never take down a previously working table.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kubearchive_crd::{ArchiveResourceSpec, SinkFilterSpec};
use kubearchive_shared::constants::GLOBAL_KEY;
use serde_json::Value as Json;
use snafu::{ResultExt, Snafu};

use crate::expr::{CompileError, EvalContext, Program, or_join};

type Result<T, E = RebuildError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum RebuildError {
    #[snafu(display(
        "failed to compile {field} for kind {kind:?} in namespace {namespace:?}"
    ))]
    CompileExpression {
        source: CompileError,
        namespace: String,
        kind: String,
        field: &'static str,
    },

    #[snafu(display("label selector for kind {kind:?} in namespace {namespace:?} uses unsupported operator {operator:?}"))]
    UnsupportedSelectorOperator {
        namespace: String,
        kind: String,
        operator: String,
    },
}

#[derive(Debug, Default)]
struct KindPrograms {
    archive: Option<Program>,
    delete: Option<Program>,
    archive_on_delete: Option<Program>,
}

type TableKey = (String, String, String);

/// The hot-reloadable filter table. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct FilterTable {
    inner: RwLock<HashMap<TableKey, KindPrograms>>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `spec` into a fresh table and swaps it in atomically.
    ///
    /// On error the previous table remains in force — the caller is expected
    /// to log and keep serving.
    pub fn rebuild(&self, spec: &SinkFilterSpec) -> Result<()> {
        let mut next = HashMap::new();

        for (namespace, specs) in &spec.namespaces {
            compile_namespace(&mut next, namespace, specs)?;
        }

        let size = next.len();
        *self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
        tracing::info!(entries = size, "filter table rebuilt");

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// True when the resource must be written to the archive: its archive
    /// predicate matches, or it is about to be deleted (deletion implies a
    /// final snapshot).
    pub fn must_archive(&self, ctx: &EvalContext, resource: &Json) -> bool {
        self.evaluate(ctx, resource, |programs| &programs.archive)
            || self.must_delete(ctx, resource)
    }

    /// True when the sink must delete the live resource after archiving it.
    pub fn must_delete(&self, ctx: &EvalContext, resource: &Json) -> bool {
        self.evaluate(ctx, resource, |programs| &programs.delete)
    }

    /// True when a cluster-side deletion of the resource must be recorded in
    /// the archive.
    pub fn must_archive_on_delete(&self, ctx: &EvalContext, resource: &Json) -> bool {
        self.evaluate(ctx, resource, |programs| &programs.archive_on_delete)
    }

    fn evaluate(
        &self,
        ctx: &EvalContext,
        resource: &Json,
        select: impl Fn(&KindPrograms) -> &Option<Program>,
    ) -> bool {
        let Some((namespace, api_version, kind)) = identity_of(resource) else {
            return false;
        };

        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let programs = table
            .get(&(namespace.to_owned(), api_version.to_owned(), kind.to_owned()))
            .or_else(|| {
                table.get(&(
                    GLOBAL_KEY.to_owned(),
                    api_version.to_owned(),
                    kind.to_owned(),
                ))
            });

        programs
            .and_then(|programs| select(programs).as_ref())
            .is_some_and(|program| program.matches(ctx, resource))
    }
}

fn identity_of(resource: &Json) -> Option<(&str, &str, &str)> {
    let namespace = resource.get("metadata")?.get("namespace")?.as_str()?;
    let api_version = resource.get("apiVersion")?.as_str()?;
    let kind = resource.get("kind")?.as_str()?;
    Some((namespace, api_version, kind))
}

/// Compiles one namespace's ordered spec list into table entries. Several
/// specs for the same `(apiVersion, kind)` OR together; a spec's label
/// selector is folded into its expressions as a conjunct so the three
/// programs per key stay the whole story.
fn compile_namespace(
    table: &mut HashMap<TableKey, KindPrograms>,
    namespace: &str,
    specs: &[ArchiveResourceSpec],
) -> Result<()> {
    let mut sources: HashMap<(String, String), [Vec<String>; 3]> = HashMap::new();

    for spec in specs {
        let key = spec.selector.canonical_key();
        let guard = selector_expression(namespace, &key.1, spec.selector.label_selector.as_ref())?;

        let fields = sources.entry(key).or_default();
        for (slot, source) in [
            (0, &spec.archive_when),
            (1, &spec.delete_when),
            (2, &spec.archive_on_delete),
        ] {
            let source = source.trim();
            if source.is_empty() {
                continue;
            }
            let combined = match &guard {
                Some(guard) => format!("({guard}) && ({source})"),
                None => source.to_owned(),
            };
            fields[slot].push(combined);
        }
    }

    for ((api_version, kind), [archive, delete, archive_on_delete]) in sources {
        let compile = |sources: Vec<String>, field: &'static str| -> Result<Option<Program>> {
            or_join(sources.iter().map(String::as_str))
                .map(|joined| {
                    Program::compile(&joined).context(CompileExpressionSnafu {
                        namespace,
                        kind: kind.clone(),
                        field,
                    })
                })
                .transpose()
        };

        let programs = KindPrograms {
            archive: compile(archive, "archiveWhen")?,
            delete: compile(delete, "deleteWhen")?,
            archive_on_delete: compile(archive_on_delete, "archiveOnDelete")?,
        };

        table.insert((namespace.to_owned(), api_version, kind), programs);
    }

    Ok(())
}

/// Translates a Kubernetes label selector into an expression conjunct over
/// `metadata.labels`, preserving apiserver semantics for absent keys.
fn selector_expression(
    namespace: &str,
    kind: &str,
    selector: Option<&LabelSelector>,
) -> Result<Option<String>> {
    let Some(selector) = selector else {
        return Ok(None);
    };

    let mut terms = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            terms.push(format!(
                "metadata.labels[{}] == {}",
                quote(key),
                quote(value)
            ));
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for requirement in expressions {
            let key = quote(&requirement.key);
            let values = || {
                requirement
                    .values
                    .iter()
                    .flatten()
                    .map(|value| quote(value))
                    .collect::<Vec<_>>()
                    .join(", ")
            };

            let term = match requirement.operator.as_str() {
                "In" => format!("metadata.labels[{key}] in [{}]", values()),
                "NotIn" => format!("!(metadata.labels[{key}] in [{}])", values()),
                "Exists" => format!("has(metadata.labels[{key}])"),
                "DoesNotExist" => format!("!has(metadata.labels[{key}])"),
                operator => {
                    return UnsupportedSelectorOperatorSnafu {
                        namespace,
                        kind,
                        operator,
                    }
                    .fail();
                }
            };
            terms.push(term);
        }
    }

    if terms.is_empty() {
        Ok(None)
    } else {
        Ok(Some(terms.join(" && ")))
    }
}

fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use kubearchive_crd::ResourceSelector;
    use serde_json::json;

    use super::*;

    fn spec_for(
        api_version: &str,
        kind: &str,
        archive_when: &str,
        delete_when: &str,
        archive_on_delete: &str,
    ) -> ArchiveResourceSpec {
        ArchiveResourceSpec {
            selector: ResourceSelector {
                api_version: api_version.to_owned(),
                kind: kind.to_owned(),
                label_selector: None,
            },
            archive_when: archive_when.to_owned(),
            delete_when: delete_when.to_owned(),
            archive_on_delete: archive_on_delete.to_owned(),
            keep_last_when: Vec::new(),
        }
    }

    fn table_with(namespace: &str, specs: Vec<ArchiveResourceSpec>) -> FilterTable {
        let mut namespaces = IndexMap::new();
        namespaces.insert(namespace.to_owned(), specs);

        let table = FilterTable::new();
        table.rebuild(&SinkFilterSpec { namespaces }).unwrap();
        table
    }

    fn pod(namespace: &str, phase: &str) -> Json {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "namespace": namespace, "labels": {"env": "dev"}},
            "status": {"phase": phase},
        })
    }

    #[test]
    fn archive_predicate_matches_configured_kinds_only() {
        let table = table_with(
            "team-a",
            vec![spec_for("v1", "Pod", "status.phase == 'Succeeded'", "", "")],
        );
        let ctx = EvalContext::default();

        assert!(table.must_archive(&ctx, &pod("team-a", "Succeeded")));
        assert!(!table.must_archive(&ctx, &pod("team-a", "Running")));
        // other namespaces have no entry and no global fallback here
        assert!(!table.must_archive(&ctx, &pod("team-b", "Succeeded")));
    }

    #[test]
    fn delete_implies_archive() {
        let table = table_with(
            "team-a",
            vec![spec_for("v1", "Pod", "", "status.phase == 'Succeeded'", "")],
        );
        let ctx = EvalContext::default();
        let resource = pod("team-a", "Succeeded");

        assert!(table.must_delete(&ctx, &resource));
        assert!(table.must_archive(&ctx, &resource));
        assert!(!table.must_archive_on_delete(&ctx, &resource));
    }

    #[test]
    fn global_entry_applies_to_unconfigured_namespaces() {
        let table = table_with(
            GLOBAL_KEY,
            vec![spec_for("v1", "Pod", "status.phase == 'Succeeded'", "", "")],
        );
        let ctx = EvalContext::default();

        assert!(table.must_archive(&ctx, &pod("anywhere", "Succeeded")));
    }

    #[test]
    fn namespace_entry_shadows_the_global_one() {
        let mut namespaces = IndexMap::new();
        namespaces.insert(
            GLOBAL_KEY.to_owned(),
            vec![spec_for("v1", "Pod", "true", "", "")],
        );
        namespaces.insert(
            "team-a".to_owned(),
            vec![spec_for("v1", "Pod", "status.phase == 'Succeeded'", "", "")],
        );

        let table = FilterTable::new();
        table.rebuild(&SinkFilterSpec { namespaces }).unwrap();
        let ctx = EvalContext::default();

        // the namespace entry replaces the global "archive everything"
        assert!(!table.must_archive(&ctx, &pod("team-a", "Running")));
        assert!(table.must_archive(&ctx, &pod("team-b", "Running")));
    }

    #[test]
    fn nil_and_unknown_inputs_are_false() {
        let table = table_with("team-a", vec![spec_for("v1", "Pod", "true", "", "")]);
        let ctx = EvalContext::default();

        assert!(!table.must_archive(&ctx, &Json::Null));
        assert!(!table.must_archive(
            &ctx,
            &json!({"apiVersion": "v1", "kind": "Secret",
                    "metadata": {"namespace": "team-a", "name": "s"}})
        ));
    }

    #[test]
    fn label_selector_scopes_expressions() {
        let selector = LabelSelector {
            match_labels: Some([("env".to_owned(), "prod".to_owned())].into()),
            match_expressions: None,
        };
        let mut spec = spec_for("v1", "Pod", "true", "", "");
        spec.selector.label_selector = Some(selector);

        let table = table_with("team-a", vec![spec]);
        let ctx = EvalContext::default();

        // pod carries env=dev, selector wants env=prod
        assert!(!table.must_archive(&ctx, &pod("team-a", "Running")));

        let mut prod_pod = pod("team-a", "Running");
        prod_pod["metadata"]["labels"]["env"] = json!("prod");
        assert!(table.must_archive(&ctx, &prod_pod));
    }

    #[test]
    fn multiple_specs_for_one_kind_or_together() {
        let table = table_with(
            "team-a",
            vec![
                spec_for("v1", "Pod", "status.phase == 'Succeeded'", "", ""),
                spec_for("v1", "Pod", "status.phase == 'Failed'", "", ""),
            ],
        );
        let ctx = EvalContext::default();

        assert!(table.must_archive(&ctx, &pod("team-a", "Succeeded")));
        assert!(table.must_archive(&ctx, &pod("team-a", "Failed")));
        assert!(!table.must_archive(&ctx, &pod("team-a", "Running")));
    }

    #[test]
    fn rebuild_failure_keeps_previous_table() {
        let table = table_with("team-a", vec![spec_for("v1", "Pod", "true", "", "")]);
        let ctx = EvalContext::default();

        let mut namespaces = IndexMap::new();
        namespaces.insert(
            "team-a".to_owned(),
            vec![spec_for("v1", "Pod", "status.state *^ broken'", "", "")],
        );
        let error = table.rebuild(&SinkFilterSpec { namespaces }).unwrap_err();
        assert!(error.to_string().contains("archiveWhen"));

        // previous table still answers
        assert!(table.must_archive(&ctx, &pod("team-a", "Running")));
    }

    #[test]
    fn selector_expression_handles_set_operators() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "env".into(),
                    operator: "In".into(),
                    values: Some(vec!["dev".into(), "stage".into()]),
                },
                LabelSelectorRequirement {
                    key: "tmp".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
        };

        let expression = selector_expression("ns", "Pod", Some(&selector))
            .unwrap()
            .unwrap();
        assert_eq!(
            expression,
            "metadata.labels['env'] in ['dev', 'stage'] && !has(metadata.labels['tmp'])"
        );
        Program::compile(&expression).unwrap();
    }
}
