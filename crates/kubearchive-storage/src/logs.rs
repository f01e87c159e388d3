//! Resolving a resource to its archived container log locations.
//!
//! Log URLs live on the leaf workload (usually a Pod). A request for a
//! higher-level resource (Job, CronJob, ...) walks the ownership edges
//! downwards, breadth-first, until a descendant with log rows is found.
//! Owner edges form a DAG in practice, but a visited set guards against
//! cycles written by misbehaving controllers.

use std::collections::HashSet;

use kubearchive_shared::constants::DEFAULT_CONTAINER_ANNOTATION;
use sqlx::Row;
use uuid::Uuid;

use crate::{Database, Error, Result, with_retries};

/// One archived log location of the resolved resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLocation {
    pub container: String,
    pub url: String,
}

impl Database {
    /// Resolves `(namespace, apiVersion, kind, name)` to the log URLs of the
    /// first descendant carrying any.
    ///
    /// Container choice: the explicit `container` argument wins; otherwise
    /// the descendant's `kubectl.kubernetes.io/default-container` annotation;
    /// otherwise all containers, first one first.
    ///
    /// Returns [`Error::NotFound`] when the named resource is not archived;
    /// an empty list when it is archived but no descendant has logs (the
    /// caller may then fall through to the live cluster).
    pub async fn log_urls_for(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
        container: Option<&str>,
    ) -> Result<Vec<LogLocation>> {
        let root = self
            .find_resource_uid(namespace, api_version, kind, name)
            .await?
            .ok_or(Error::NotFound)?;

        let mut visited = HashSet::from([root]);
        let mut frontier = vec![root];

        while !frontier.is_empty() {
            if let Some(locations) = self.logs_of_any(&frontier, container).await? {
                return Ok(locations);
            }

            let children = self.children_of(&frontier).await?;
            frontier = children
                .into_iter()
                .filter(|child| visited.insert(*child))
                .collect();
        }

        Ok(Vec::new())
    }

    async fn find_resource_uid(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<Uuid>> {
        let row = with_retries("find resource", || async {
            sqlx::query(
                r"
                SELECT uuid FROM resource
                WHERE namespace = $1 AND api_version = $2 AND kind = $3 AND name = $4
                ORDER BY created_at DESC
                LIMIT 1",
            )
            .bind(namespace)
            .bind(api_version)
            .bind(kind)
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::from_sqlx)
        })
        .await?;

        Ok(row.map(|row| row.get("uuid")))
    }

    /// Log rows of the first member of `uids` (in creation order) which has
    /// any, already narrowed to the chosen container.
    async fn logs_of_any(
        &self,
        uids: &[Uuid],
        container: Option<&str>,
    ) -> Result<Option<Vec<LogLocation>>> {
        let rows = with_retries("fetch log urls", || async {
            sqlx::query(
                r"
                SELECT l.uuid, l.container_name, l.url,
                       r.data -> 'metadata' -> 'annotations' ->> $2 AS default_container
                FROM log_url l
                JOIN resource r ON r.uuid = l.uuid
                WHERE l.uuid = ANY($1)
                ORDER BY r.created_at, r.uuid",
            )
            .bind(uids)
            .bind(DEFAULT_CONTAINER_ANNOTATION)
            .fetch_all(self.pool())
            .await
            .map_err(Error::from_sqlx)
        })
        .await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let chosen_uid: Uuid = first.get("uuid");
        let default_container: Option<String> = first.get("default_container");

        let of_chosen: Vec<(String, String)> = rows
            .iter()
            .filter(|row| row.get::<Uuid, _>("uuid") == chosen_uid)
            .map(|row| (row.get("container_name"), row.get("url")))
            .collect();

        // an explicitly requested container always filters, even to nothing;
        // the default-container annotation only narrows when it actually
        // names a container with logs
        let wanted = match container {
            Some(container) => Some(container.to_owned()),
            None => default_container
                .filter(|wanted| of_chosen.iter().any(|(name, _)| name == wanted)),
        };

        let locations = of_chosen
            .into_iter()
            .filter(|(name, _)| wanted.as_deref().is_none_or(|wanted| name == wanted))
            .map(|(container, url)| LogLocation { container, url })
            .collect();

        Ok(Some(locations))
    }

    async fn children_of(&self, uids: &[Uuid]) -> Result<Vec<Uuid>> {
        let rows = with_retries("walk ownership edges", || async {
            sqlx::query("SELECT uuid FROM owner_reference WHERE owner_uuid = ANY($1)")
                .bind(uids)
                .fetch_all(self.pool())
                .await
                .map_err(Error::from_sqlx)
        })
        .await?;

        Ok(rows.iter().map(|row| row.get("uuid")).collect())
    }
}
