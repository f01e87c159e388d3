//! Filtered, keyset-paginated reads over the archive.

use chrono::{DateTime, Utc};
use kubearchive_shared::{
    NamePattern,
    selector::{LabelSelector, Operator},
};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::{Database, Error, Result, token, with_retries};

/// The filter set of one list query. Two queries with equal filters share
/// continue tokens; everything that influences row selection must
/// participate in [`QueryFilter::fingerprint`].
#[derive(Clone, Debug, Default)]
pub struct QueryFilter {
    /// `None` lists across all namespaces.
    pub namespace: Option<String>,
    pub api_version: String,
    pub kind: String,
    pub name: Option<NamePattern>,
    pub label_selector: LabelSelector,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
}

impl QueryFilter {
    pub fn validate(&self) -> Result<()> {
        if let (Some(after), Some(before)) = (self.created_after, self.created_before)
            && before <= after
        {
            return Err(Error::BadRequest {
                message: "creationTimestampBefore must be later than creationTimestampAfter"
                    .to_owned(),
            });
        }
        Ok(())
    }

    /// A short digest over the canonical filter set, binding continue tokens
    /// to the query that minted them.
    pub fn fingerprint(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.namespace.as_deref().unwrap_or("*"),
            self.api_version,
            self.kind,
            self.name.as_ref().map(NamePattern::raw).unwrap_or(""),
            self.label_selector.canonical(),
            self.created_after.map(|t| t.to_rfc3339()).unwrap_or_default(),
            self.created_before.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );

        let digest = Sha256::digest(canonical.as_bytes());
        // 16 hex chars are plenty to tell filter sets apart
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// One matched archive row.
#[derive(Clone, Debug)]
pub struct Hit {
    pub uid: Uuid,
    pub created_at: DateTime<Utc>,
    pub data: Json,
}

/// One page of results. `more` signals that rows beyond this page exist;
/// [`Database::continue_token_for`] mints the token resuming after any hit,
/// so callers consuming a page partially can hand out a correct cursor.
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub hits: Vec<Hit>,
    pub more: bool,
}

impl Page {
    /// The adapter-level continuation: resume after the last hit of a fully
    /// consumed page.
    pub fn continue_token(&self, filter: &QueryFilter) -> Option<String> {
        if !self.more {
            return None;
        }
        self.hits
            .last()
            .map(|hit| Database::continue_token_for(filter, hit))
    }
}

impl Database {
    /// Lists archived resources matching `filter`, ordered by
    /// `(created_at, uuid)` ascending, returning at most `limit` rows.
    pub async fn list_resources(
        &self,
        filter: &QueryFilter,
        limit: u32,
        continue_token: Option<&str>,
    ) -> Result<Page> {
        filter.validate()?;

        let fingerprint = filter.fingerprint();
        let cursor = continue_token
            .map(|token| token::decode(token, &fingerprint))
            .transpose()?;

        let rows = with_retries("list resources", || async {
            let mut builder = select_resources(filter, cursor, limit);
            builder
                .build()
                .fetch_all(self.pool())
                .await
                .map_err(Error::from_sqlx)
        })
        .await?;

        // one extra row is fetched purely to detect a further page
        let more = rows.len() > limit as usize;
        let hits = rows
            .iter()
            .take(limit as usize)
            .map(|row| Hit {
                uid: row.get("uuid"),
                created_at: row.get("created_at"),
                data: row.get("data"),
            })
            .collect();

        Ok(Page { hits, more })
    }

    /// The token resuming a query right after `hit`.
    pub fn continue_token_for(filter: &QueryFilter, hit: &Hit) -> String {
        token::encode(hit.created_at, hit.uid, &filter.fingerprint())
    }
}

fn select_resources(
    filter: &QueryFilter,
    cursor: Option<(DateTime<Utc>, Uuid)>,
    limit: u32,
) -> QueryBuilder<'_, Postgres> {
    let mut builder: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("SELECT uuid, created_at, data FROM resource WHERE api_version = ");
    builder.push_bind(&filter.api_version);
    builder.push(" AND kind = ");
    builder.push_bind(&filter.kind);

    if let Some(namespace) = &filter.namespace {
        builder.push(" AND namespace = ");
        builder.push_bind(namespace);
    }

    match &filter.name {
        Some(pattern) if pattern.is_wildcard() => {
            builder.push(" AND name ILIKE ");
            builder.push_bind(pattern.to_like_pattern());
            builder.push(" ESCAPE '\\'");
        }
        Some(pattern) => {
            builder.push(" AND name = ");
            builder.push_bind(pattern.raw().to_owned());
        }
        None => {}
    }

    if let Some(after) = filter.created_after {
        builder.push(" AND created_at >= ");
        builder.push_bind(after);
    }
    if let Some(before) = filter.created_before {
        builder.push(" AND created_at < ");
        builder.push_bind(before);
    }

    push_label_requirements(&mut builder, &filter.label_selector);

    if let Some((created_at, uid)) = cursor {
        builder.push(" AND (created_at, uuid) > (");
        builder.push_bind(created_at);
        builder.push(", ");
        builder.push_bind(uid);
        builder.push(")");
    }

    builder.push(" ORDER BY created_at, uuid LIMIT ");
    // limit + 1: the sentinel row signalling another page exists
    builder.push_bind(i64::from(limit) + 1);

    builder
}

/// Renders each selector requirement as an (anti-)join against the label
/// table. `!=` and `notin` use NOT EXISTS so that rows without the key
/// match, like the apiserver's selector semantics.
fn push_label_requirements(builder: &mut QueryBuilder<'_, Postgres>, selector: &LabelSelector) {
    for requirement in &selector.requirements {
        let negated = matches!(
            requirement.operator,
            Operator::NotEquals | Operator::NotIn | Operator::DoesNotExist
        );

        builder.push(if negated {
            " AND NOT EXISTS (SELECT 1 FROM label l WHERE l.uuid = resource.uuid AND l.key = "
        } else {
            " AND EXISTS (SELECT 1 FROM label l WHERE l.uuid = resource.uuid AND l.key = "
        });
        builder.push_bind(requirement.key.clone());

        match requirement.operator {
            Operator::Equals | Operator::NotEquals => {
                builder.push(" AND l.value = ");
                builder.push_bind(requirement.values[0].clone());
            }
            Operator::In | Operator::NotIn => {
                builder.push(" AND l.value IN (");
                let mut separated = builder.separated(", ");
                for value in &requirement.values {
                    separated.push_bind(value.clone());
                }
                builder.push(")");
            }
            Operator::Exists | Operator::DoesNotExist => {}
        }

        builder.push(")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> QueryFilter {
        QueryFilter {
            namespace: Some("default".to_owned()),
            api_version: "v1".to_owned(),
            kind: "Pod".to_owned(),
            ..QueryFilter::default()
        }
    }

    #[test]
    fn inverted_time_window_is_rejected() {
        let mut f = filter();
        f.created_after = Some(Utc::now());
        f.created_before = Some(Utc::now() - chrono::Duration::hours(1));

        assert!(matches!(
            f.validate().unwrap_err(),
            Error::BadRequest { .. }
        ));
    }

    #[test]
    fn equal_bounds_are_rejected() {
        let now = Utc::now();
        let mut f = filter();
        f.created_after = Some(now);
        f.created_before = Some(now);

        assert!(f.validate().is_err());
    }

    #[test]
    fn fingerprint_depends_on_every_filter_dimension() {
        let base = filter();

        let mut other_kind = filter();
        other_kind.kind = "Job".to_owned();

        let mut other_name = filter();
        other_name.name = Some(NamePattern::parse("*test*"));

        let mut other_selector = filter();
        other_selector.label_selector = "env!=prod".parse().unwrap();

        let mut other_window = filter();
        other_window.created_after = Some(Utc::now());

        let fingerprints: Vec<String> = [&base, &other_kind, &other_name, &other_selector, &other_window]
            .iter()
            .map(|f| f.fingerprint())
            .collect();

        for (i, a) in fingerprints.iter().enumerate() {
            for (j, b) in fingerprints.iter().enumerate() {
                assert_eq!(a == b, i == j, "fingerprints {i} and {j} collide");
            }
        }
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(filter().fingerprint(), filter().fingerprint());
    }

    #[test]
    fn select_renders_all_clauses() {
        let mut f = filter();
        f.name = Some(NamePattern::parse("web-*"));
        f.label_selector = "env in (dev,stage),!tmp".parse().unwrap();
        f.created_after = Some(Utc::now() - chrono::Duration::days(1));
        f.created_before = Some(Utc::now());

        let builder = select_resources(&f, Some((Utc::now(), Uuid::new_v4())), 50);
        let sql = builder.sql();

        assert!(sql.contains("api_version ="));
        assert!(sql.contains("name ILIKE"));
        assert!(sql.contains("created_at >="));
        assert!(sql.contains("created_at <"));
        assert!(sql.contains("EXISTS (SELECT 1 FROM label"));
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM label"));
        assert!(sql.contains("(created_at, uuid) >"));
        assert!(sql.contains("ORDER BY created_at, uuid LIMIT"));
    }

    #[test]
    fn exact_names_use_equality() {
        let mut f = filter();
        f.name = Some(NamePattern::parse("exact-name"));

        let builder = select_resources(&f, None, 10);
        let sql = builder.sql();

        assert!(sql.contains("name ="));
        assert!(!sql.contains("ILIKE"));
    }
}
