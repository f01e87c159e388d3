//! The per-event decision and write path.
//!
//! State machine per event: received → filtered → (skipped | archived) →
//! (kept | delete-requested) → acknowledged. Storage failures bubble up as
//! errors so the HTTP layer withholds the acknowledgement and the source
//! redelivers; a failed live delete only warns, because the archive already
//! holds the final state.

use std::{sync::Arc, time::Duration};

use kube::api::{Api, DeleteParams, DynamicObject};
use kubearchive_filter::{EvalContext, FilterTable};
use kubearchive_shared::{ResourceDocument, ResourceKey, discovery::KindResolver};
use kubearchive_storage::Database;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::event::{Operation, SinkEvent};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to archive resource {uid}"))]
    Archive {
        source: kubearchive_storage::Error,
        uid: uuid::Uuid,
    },
}

/// How an event was settled. `Skipped` is an acknowledgement too: the event
/// was understood and needed no write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Archived,
    ArchivedAndDeleteRequested,
}

pub struct Dispatcher {
    filters: Arc<FilterTable>,
    database: Database,
    resolver: Arc<KindResolver>,
}

impl Dispatcher {
    pub fn new(filters: Arc<FilterTable>, database: Database, resolver: Arc<KindResolver>) -> Self {
        Self {
            filters,
            database,
            resolver,
        }
    }

    pub async fn handle(&self, event: &SinkEvent, cancel: CancellationToken) -> Result<Outcome> {
        let document = ResourceDocument::new(&event.resource);
        let key = match document.key() {
            Ok(key) => key,
            Err(error) => {
                // Redelivery cannot fix a malformed event, so it is
                // acknowledged and dropped rather than returned to the source.
                tracing::warn!(
                    %error,
                    event_id = event.id.as_deref().unwrap_or("<none>"),
                    event_type = %event.event_type,
                    "skipping event with incomplete resource identity"
                );
                return Ok(Outcome::Skipped);
            }
        };

        // Predicate evaluation happens before any I/O; the filter lock is
        // released by the time the storage call starts.
        let ctx = EvalContext::new(cancel);
        let decision = decide(&self.filters, &ctx, event.operation, &event.resource);

        match decision {
            Decision::Skip => {
                tracing::debug!(uid = %key.uid, kind = %key.kind, "event did not match any filter");
                Ok(Outcome::Skipped)
            }

            Decision::Archive => {
                self.database
                    .upsert_resource(&event.resource, None)
                    .await
                    .context(ArchiveSnafu { uid: key.uid })?;
                Ok(Outcome::Archived)
            }

            Decision::ArchiveThenDelete => {
                self.database
                    .upsert_resource(&event.resource, None)
                    .await
                    .context(ArchiveSnafu { uid: key.uid })?;

                // The archive write is acknowledged by storage at this
                // point; only now may the live copy go away.
                self.delete_live_resource(&key).await;
                Ok(Outcome::ArchivedAndDeleteRequested)
            }

            Decision::ArchiveDeleted => {
                self.database
                    .upsert_resource(&event.resource, Some(event.time))
                    .await
                    .context(ArchiveSnafu { uid: key.uid })?;
                Ok(Outcome::Archived)
            }
        }
    }

    /// Deletes the live resource, retrying transient failures with bounded
    /// backoff. A missing resource counts as success (someone else deleted
    /// it first); exhausting the budget is a warning, not an error.
    async fn delete_live_resource(&self, key: &ResourceKey) {
        const ATTEMPTS: u32 = 3;
        let mut delay = Duration::from_millis(200);

        for attempt in 1..=ATTEMPTS {
            match self.try_delete(key).await {
                Ok(()) => {
                    tracing::info!(
                        uid = %key.uid,
                        kind = %key.kind,
                        namespace = %key.namespace,
                        name = %key.name,
                        "deleted live resource after archiving"
                    );
                    return;
                }
                Err(error) if attempt < ATTEMPTS => {
                    tracing::debug!(%error, attempt, uid = %key.uid, "live delete failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        uid = %key.uid,
                        kind = %key.kind,
                        namespace = %key.namespace,
                        name = %key.name,
                        "giving up on live delete, archive already holds the final state"
                    );
                }
            }
        }
    }

    async fn try_delete(&self, key: &ResourceKey) -> Result<(), DeleteError> {
        let (resource, _) = self
            .resolver
            .by_kind(&key.api_version, &key.kind)
            .await
            .context(ResolveKindSnafu)?;

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.resolver.client(), &key.namespace, &resource);

        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(DeleteError::Delete { source }),
        }
    }
}

#[derive(Debug, Snafu)]
enum DeleteError {
    #[snafu(display("failed to resolve kind for deletion"))]
    ResolveKind {
        source: kubearchive_shared::discovery::Error,
    },

    #[snafu(display("delete call failed"))]
    Delete { source: kube::Error },
}

/// What the filters ask for, before any I/O happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Skip,
    /// Write the archive row.
    Archive,
    /// Write the archive row, then delete the live resource.
    ArchiveThenDelete,
    /// Write the archive row with the cluster-deleted stamp set.
    ArchiveDeleted,
}

/// The filter decision matrix. Upserts archive on `mustArchive` (which
/// subsumes `mustDelete`); deletes archive on `mustArchiveOnDelete` or
/// `mustArchive` and record the deletion timestamp.
pub fn decide(
    filters: &FilterTable,
    ctx: &EvalContext,
    operation: Operation,
    resource: &serde_json::Value,
) -> Decision {
    match operation {
        Operation::Upsert => {
            if filters.must_delete(ctx, resource) {
                Decision::ArchiveThenDelete
            } else if filters.must_archive(ctx, resource) {
                Decision::Archive
            } else {
                Decision::Skip
            }
        }
        Operation::Delete => {
            if filters.must_archive_on_delete(ctx, resource) || filters.must_archive(ctx, resource)
            {
                Decision::ArchiveDeleted
            } else {
                Decision::Skip
            }
        }
    }
}
