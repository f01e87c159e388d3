//! Enumerating live resources and replaying them through the sink.

use std::time::{Duration, Instant};

use kube::{
    Api,
    api::{DynamicObject, ListParams},
};
use kubearchive_crd::{ArchiveResourceSpec, SinkFilterSpec};
use kubearchive_shared::{constants::GLOBAL_KEY, discovery::KindResolver};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

use crate::{report::VacuumReport, retention};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve {kind:?} ({api_version:?})"))]
    ResolveKind {
        source: kubearchive_shared::discovery::Error,
        api_version: String,
        kind: String,
    },

    #[snafu(display("failed to list {kind:?} in namespace {namespace:?}"))]
    ListResources {
        source: kube::Error,
        namespace: String,
        kind: String,
    },

    #[snafu(display("sink rejected the event with status {status}"))]
    SinkRejected { status: u16 },

    #[snafu(display("failed to reach the sink"))]
    SinkUnreachable { source: reqwest::Error },
}

pub struct Vacuum {
    pub resolver: KindResolver,
    pub http: reqwest::Client,
    pub sink_url: String,
    /// Wall-clock budget for the whole run.
    pub budget: Duration,
}

impl Vacuum {
    /// Sweeps the given `(namespace, apiVersion, kind)` triples. The sink
    /// filter spec supplies the retention clauses governing each namespace.
    pub async fn run(
        &self,
        targets: &[(String, String, String)],
        sink_filter: &SinkFilterSpec,
    ) -> VacuumReport {
        let deadline = Instant::now() + self.budget;
        let mut report = VacuumReport::default();

        for (namespace, api_version, kind) in targets {
            let entry = report.kind_report(namespace, kind);

            if Instant::now() >= deadline {
                entry
                    .errors
                    .push("run budget exceeded before this kind was swept (retryable)".to_owned());
                continue;
            }

            if let Err(error) = self
                .sweep_kind(namespace, api_version, kind, sink_filter, &mut report)
                .await
            {
                report
                    .kind_report(namespace, kind)
                    .errors
                    .push(error.to_string());
            }
        }

        report
    }

    async fn sweep_kind(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        sink_filter: &SinkFilterSpec,
        report: &mut VacuumReport,
    ) -> Result<()> {
        let (resource, _) = self
            .resolver
            .by_kind(api_version, kind)
            .await
            .context(ResolveKindSnafu {
                api_version,
                kind,
            })?;

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.resolver.client(), namespace, &resource);
        let objects = api
            .list(&ListParams::default())
            .await
            .context(ListResourcesSnafu { namespace, kind })?;

        let documents: Vec<serde_json::Value> = objects
            .items
            .iter()
            .filter_map(|object| {
                let mut value = serde_json::to_value(object).ok()?;
                if value.get("apiVersion").is_none() {
                    value["apiVersion"] = serde_json::Value::String(api_version.to_owned());
                }
                if value.get("kind").is_none() {
                    value["kind"] = serde_json::Value::String(kind.to_owned());
                }
                Some(value)
            })
            .collect();

        let clauses = retention_clauses(sink_filter, namespace, api_version, kind);
        let kept = retention::kept_back(&documents, &clauses);

        let entry = report.kind_report(namespace, kind);
        entry.listed = documents.len();
        entry.kept_back = kept.len();

        for (index, document) in documents.iter().enumerate() {
            if kept.contains(&index) {
                continue;
            }

            match self.submit(document).await {
                Ok(()) => report.kind_report(namespace, kind).submitted += 1,
                Err(error) => {
                    let name = document
                        .get("metadata")
                        .and_then(|meta| meta.get("name"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("<unknown>");
                    report
                        .kind_report(namespace, kind)
                        .errors
                        .push(format!("{name}: {error}"));
                }
            }
        }

        Ok(())
    }

    /// Posts one synthetic upsert event to the sink, binary CloudEvents
    /// mode, exactly the shape the live event source produces.
    async fn submit(&self, resource: &serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(&self.sink_url)
            .header("ce-specversion", "1.0")
            .header("ce-type", "org.kubearchive.vacuum.resource.update")
            .header("ce-source", "kubearchive-vacuum")
            .header("ce-id", Uuid::new_v4().to_string())
            .header("ce-time", chrono::Utc::now().to_rfc3339())
            .json(resource)
            .send()
            .await
            .context(SinkUnreachableSnafu)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::SinkRejected {
                status: status.as_u16(),
            })
        }
    }
}

/// The retention clauses governing `(namespace, apiVersion, kind)`: the
/// namespace's own entry, or the global one when the namespace has none.
fn retention_clauses(
    sink_filter: &SinkFilterSpec,
    namespace: &str,
    api_version: &str,
    kind: &str,
) -> Vec<kubearchive_crd::KeepLastWhen> {
    let find = |specs: &[ArchiveResourceSpec]| {
        specs
            .iter()
            .filter(|spec| {
                let (av, k) = spec.selector.canonical_key();
                av == api_version && k == kind
            })
            .flat_map(|spec| spec.keep_last_when.clone())
            .collect::<Vec<_>>()
    };

    if let Some(specs) = sink_filter.namespaces.get(namespace) {
        let clauses = find(specs);
        if !clauses.is_empty() {
            return clauses;
        }
    }

    sink_filter
        .namespaces
        .get(GLOBAL_KEY)
        .map(|specs| find(specs))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use kubearchive_crd::{KeepLastWhen, ResourceSelector};

    use super::*;

    fn sink_filter() -> SinkFilterSpec {
        let spec = |count: u32| ArchiveResourceSpec {
            selector: ResourceSelector {
                api_version: "batch/v1".into(),
                kind: "Job".into(),
                label_selector: None,
            },
            keep_last_when: vec![KeepLastWhen {
                when: "true".into(),
                count,
                order_by: None,
            }],
            ..ArchiveResourceSpec::default()
        };

        let mut namespaces = IndexMap::new();
        namespaces.insert(GLOBAL_KEY.to_owned(), vec![spec(5)]);
        namespaces.insert("team-a".to_owned(), vec![spec(2)]);
        SinkFilterSpec { namespaces }
    }

    #[test]
    fn namespace_clauses_win_over_global() {
        let clauses = retention_clauses(&sink_filter(), "team-a", "batch/v1", "Job");
        assert_eq!(clauses[0].count, 2);
    }

    #[test]
    fn global_clauses_apply_elsewhere() {
        let clauses = retention_clauses(&sink_filter(), "team-b", "batch/v1", "Job");
        assert_eq!(clauses[0].count, 5);
    }

    #[test]
    fn unknown_kinds_have_no_clauses() {
        assert!(retention_clauses(&sink_filter(), "team-a", "v1", "Pod").is_empty());
    }
}
