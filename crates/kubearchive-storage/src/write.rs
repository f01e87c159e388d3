//! The transactional upsert path.

use chrono::{DateTime, Utc};
use kubearchive_shared::ResourceDocument;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::{Database, Error, Result, with_retries};

impl Database {
    /// Inserts or updates the archive row for a resource, replacing its
    /// label rows, ownership edges and log-URL rows in the same transaction.
    ///
    /// `deleted_at` is set when the triggering event was a cluster-side
    /// delete; an upsert never clears a previously recorded deletion stamp
    /// (uids are not reused, so a redelivered update cannot "undelete").
    ///
    /// Keyed on uid, so redelivery of the same event reproduces the
    /// identical row.
    pub async fn upsert_resource(
        &self,
        resource: &Json,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let document = ResourceDocument::new(resource);
        let key = document.key().map_err(|error| Error::BadRequest {
            message: error.to_string(),
        })?;

        let created_at = document.creation_timestamp().unwrap_or_else(Utc::now);
        let resource_version = document.resource_version().map(str::to_owned);
        let labels = document.labels();
        let owners = document.owner_uids();
        let log_urls = document.log_urls();

        with_retries("upsert resource", || async {
            let mut tx = self.pool().begin().await.map_err(Error::from_sqlx)?;

            sqlx::query(
                r"
                INSERT INTO resource (uuid, api_version, kind, name, namespace,
                                      resource_version, created_at, cluster_deleted_ts, data)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (uuid) DO UPDATE SET
                    api_version        = EXCLUDED.api_version,
                    kind               = EXCLUDED.kind,
                    name               = EXCLUDED.name,
                    namespace          = EXCLUDED.namespace,
                    resource_version   = EXCLUDED.resource_version,
                    cluster_deleted_ts = COALESCE(EXCLUDED.cluster_deleted_ts,
                                                  resource.cluster_deleted_ts),
                    data               = EXCLUDED.data",
            )
            .bind(key.uid)
            .bind(&key.api_version)
            .bind(&key.kind)
            .bind(&key.name)
            .bind(&key.namespace)
            .bind(&resource_version)
            .bind(created_at)
            .bind(deleted_at)
            .bind(resource)
            .execute(&mut *tx)
            .await
            .map_err(Error::from_sqlx)?;

            replace_labels(&mut tx, key.uid, &labels).await?;
            replace_owners(&mut tx, key.uid, &owners).await?;
            replace_log_urls(&mut tx, key.uid, &log_urls).await?;

            tx.commit().await.map_err(Error::from_sqlx)?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            uid = %key.uid,
            kind = %key.kind,
            namespace = %key.namespace,
            name = %key.name,
            deleted = deleted_at.is_some(),
            "archived resource"
        );

        Ok(())
    }
}

async fn replace_labels(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    uid: Uuid,
    labels: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
    sqlx::query("DELETE FROM label WHERE uuid = $1")
        .bind(uid)
        .execute(&mut **tx)
        .await
        .map_err(Error::from_sqlx)?;

    for (key, value) in labels {
        sqlx::query("INSERT INTO label (uuid, key, value) VALUES ($1, $2, $3)")
            .bind(uid)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(Error::from_sqlx)?;
    }

    Ok(())
}

async fn replace_owners(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    uid: Uuid,
    owners: &[Uuid],
) -> Result<()> {
    sqlx::query("DELETE FROM owner_reference WHERE uuid = $1")
        .bind(uid)
        .execute(&mut **tx)
        .await
        .map_err(Error::from_sqlx)?;

    for owner in owners {
        // ON CONFLICT drops duplicate edges; self references never get here
        // (the envelope already filters them).
        sqlx::query(
            "INSERT INTO owner_reference (uuid, owner_uuid) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(uid)
        .bind(owner)
        .execute(&mut **tx)
        .await
        .map_err(Error::from_sqlx)?;
    }

    Ok(())
}

async fn replace_log_urls(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    uid: Uuid,
    log_urls: &[kubearchive_shared::envelope::LogUrl],
) -> Result<()> {
    sqlx::query("DELETE FROM log_url WHERE uuid = $1")
        .bind(uid)
        .execute(&mut **tx)
        .await
        .map_err(Error::from_sqlx)?;

    for log_url in log_urls {
        sqlx::query("INSERT INTO log_url (uuid, container_name, url) VALUES ($1, $2, $3)")
            .bind(uid)
            .bind(&log_url.container)
            .bind(&log_url.url)
            .execute(&mut **tx)
            .await
            .map_err(Error::from_sqlx)?;
    }

    Ok(())
}
