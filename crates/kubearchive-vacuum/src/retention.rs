//! `keepLastWhen` retention: which live resources a vacuum run holds back
//! from archival.
//!
//! Each clause is `(predicate, count, orderingKey)`. Clauses apply
//! independently and their kept-back sets union: of the resources matching
//! the predicate, the `count` greatest by ordering key stay out of the
//! sweep. The default ordering key is creation time, ties broken by name.

use std::{cmp::Ordering, collections::BTreeSet};

use chrono::{DateTime, Utc};
use kubearchive_crd::KeepLastWhen;
use kubearchive_filter::{EvalContext, Program, Value};
use serde_json::Value as Json;

/// Returns the indices of `resources` kept back by `clauses`.
///
/// Clauses whose predicate or ordering key fails to compile are skipped with
/// a warning; admission normally prevents that, but the vacuum must not
/// panic on configs predating a validation fix.
pub fn kept_back(resources: &[Json], clauses: &[KeepLastWhen]) -> BTreeSet<usize> {
    let ctx = EvalContext::default();
    let mut kept = BTreeSet::new();

    for clause in clauses {
        let predicate = match compile_predicate(&clause.when) {
            Ok(predicate) => predicate,
            Err(error) => {
                tracing::warn!(%error, when = %clause.when, "skipping retention clause");
                continue;
            }
        };

        let order_key = match &clause.order_by {
            Some(source) if !source.trim().is_empty() => match OrderProgram::compile(source) {
                Ok(program) => Some(program),
                Err(error) => {
                    tracing::warn!(%error, order_by = %source, "ignoring retention ordering key");
                    None
                }
            },
            _ => None,
        };

        let mut matching: Vec<usize> = resources
            .iter()
            .enumerate()
            .filter(|(_, resource)| {
                predicate
                    .as_ref()
                    .is_none_or(|predicate| predicate.matches(&ctx, resource))
            })
            .map(|(index, _)| index)
            .collect();

        matching.sort_by(|a, b| {
            order_of(&ctx, order_key.as_ref(), &resources[*a], &resources[*b])
        });

        kept.extend(matching.into_iter().take(clause.count as usize));
    }

    kept
}

/// An empty predicate selects everything.
fn compile_predicate(source: &str) -> Result<Option<Program>, kubearchive_filter::CompileError> {
    if source.trim().is_empty() || source.trim() == "true" {
        return Ok(None);
    }
    Program::compile(source).map(Some)
}

/// A compiled ordering key. Unlike predicates this may evaluate to any
/// comparable value, so it skips the boolean-result requirement by being
/// evaluated rather than matched.
struct OrderProgram(Program);

impl OrderProgram {
    fn compile(source: &str) -> Result<Self, kubearchive_filter::CompileError> {
        Program::compile_value(source).map(Self)
    }

    fn evaluate(&self, ctx: &EvalContext, resource: &Json) -> Option<SortKey> {
        match self.0.evaluate(ctx, resource) {
            Ok(Value::Int(i)) => Some(SortKey::Number(i as f64)),
            Ok(Value::Float(f)) => Some(SortKey::Number(f)),
            Ok(Value::Timestamp(ts)) => Some(SortKey::Timestamp(ts)),
            Ok(Value::Str(raw)) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map(|ts| SortKey::Timestamp(ts.with_timezone(&Utc)))
                    .unwrap_or(SortKey::Text(raw)),
            ),
            _ => None,
        }
    }
}

/// Comparable ordering key values.
#[derive(Clone, Debug, PartialEq)]
enum SortKey {
    Number(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl SortKey {
    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            // mixed types fall back to equal; the default ordering decides
            _ => Ordering::Equal,
        }
    }
}

/// Descending by ordering key (or creation time), ties broken by name
/// descending, so `take(count)` keeps the most recent entries.
fn order_of(
    ctx: &EvalContext,
    order_key: Option<&OrderProgram>,
    a: &Json,
    b: &Json,
) -> Ordering {
    if let Some(program) = order_key
        && let (Some(key_a), Some(key_b)) = (program.evaluate(ctx, a), program.evaluate(ctx, b))
    {
        let by_key = key_b.compare(&key_a);
        if by_key != Ordering::Equal {
            return by_key;
        }
    }

    let creation = |resource: &Json| {
        resource
            .get("metadata")
            .and_then(|meta| meta.get("creationTimestamp"))
            .and_then(Json::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    };
    let name = |resource: &Json| {
        resource
            .get("metadata")
            .and_then(|meta| meta.get("name"))
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_owned()
    };

    creation(b)
        .cmp(&creation(a))
        .then_with(|| name(b).cmp(&name(a)))
}

#[cfg(test)]
mod tests {
    use kubearchive_crd::KeepLastWhen;
    use serde_json::json;

    use super::*;

    fn job(name: &str, created: &str, succeeded: i64) -> Json {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": name, "namespace": "default", "creationTimestamp": created},
            "status": {"succeeded": succeeded},
        })
    }

    fn jobs() -> Vec<Json> {
        vec![
            job("job-1", "2024-05-01T10:00:00Z", 1),
            job("job-2", "2024-05-02T10:00:00Z", 1),
            job("job-3", "2024-05-03T10:00:00Z", 0),
            job("job-4", "2024-05-04T10:00:00Z", 1),
            job("job-5", "2024-05-05T10:00:00Z", 1),
        ]
    }

    #[test]
    fn keeps_the_most_recent_n() {
        let clauses = vec![KeepLastWhen {
            when: "true".into(),
            count: 2,
            order_by: None,
        }];

        // job-5 and job-4 are newest
        assert_eq!(kept_back(&jobs(), &clauses), BTreeSet::from([3, 4]));
    }

    #[test]
    fn count_zero_keeps_nothing_back() {
        let clauses = vec![KeepLastWhen {
            when: "true".into(),
            count: 0,
            order_by: None,
        }];
        assert!(kept_back(&jobs(), &clauses).is_empty());
    }

    #[test]
    fn predicate_partitions_before_counting() {
        let clauses = vec![KeepLastWhen {
            when: "status.succeeded > 0".into(),
            count: 2,
            order_by: None,
        }];

        // among succeeded jobs, job-5 and job-4 are newest; job-3 never
        // matched the predicate and is not kept back
        assert_eq!(kept_back(&jobs(), &clauses), BTreeSet::from([3, 4]));
    }

    #[test]
    fn clauses_union_their_kept_sets() {
        let clauses = vec![
            KeepLastWhen {
                when: "status.succeeded > 0".into(),
                count: 1,
                order_by: None,
            },
            KeepLastWhen {
                when: "status.succeeded == 0".into(),
                count: 1,
                order_by: None,
            },
        ];

        // newest succeeded (job-5) plus newest failed (job-3)
        assert_eq!(kept_back(&jobs(), &clauses), BTreeSet::from([2, 4]));
    }

    #[test]
    fn count_larger_than_matches_keeps_everything_matched() {
        let clauses = vec![KeepLastWhen {
            when: "true".into(),
            count: 100,
            order_by: None,
        }];
        assert_eq!(kept_back(&jobs(), &clauses).len(), 5);
    }

    #[test]
    fn broken_clauses_are_ignored() {
        let clauses = vec![KeepLastWhen {
            when: "status.succeeded >".into(),
            count: 3,
            order_by: None,
        }];
        assert!(kept_back(&jobs(), &clauses).is_empty());
    }

    #[test]
    fn ties_on_creation_time_break_by_name() {
        let resources = vec![
            job("b", "2024-05-01T10:00:00Z", 1),
            job("a", "2024-05-01T10:00:00Z", 1),
            job("c", "2024-05-01T10:00:00Z", 1),
        ];
        let clauses = vec![KeepLastWhen {
            when: "true".into(),
            count: 1,
            order_by: None,
        }];

        // same timestamp: "c" sorts first by descending name
        assert_eq!(kept_back(&resources, &clauses), BTreeSet::from([2]));
    }
}
