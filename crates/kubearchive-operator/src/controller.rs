//! The config reconciler.
//!
//! A `kube-runtime` [`Controller`] over every `KubeArchiveConfig`, triggered
//! also by `ClusterKubeArchiveConfig` changes: a cluster config merges into
//! every namespace, so its watch stream re-enqueues all namespace configs
//! (a full resync). Each reconcile recomputes the derived state — the
//! merged `SinkFilter`, the shared event source and the per-namespace RBAC —
//! and applies it with server-side applies under one field manager, so
//! concurrent operators resolve by optimistic concurrency on the apiserver.
//!
//! Namespace teardown runs under a finalizer: the RBAC objects and the
//! namespace's filter entries are removed before the config object itself
//! is allowed to go away, so a crash mid-cleanup is retried rather than
//! leaking orphaned state. Reconcile errors re-enqueue the failed object
//! with backoff through the controller's error policy.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::{
    api::{
        core::v1::ServiceAccount,
        rbac::v1::{ClusterRole, Role, RoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    runtime::{
        WatchStreamExt,
        controller::{Action, Controller},
        finalizer::{Event as FinalizerEvent, finalizer},
        reflector::{ObjectRef, reflector, store},
        watcher,
    },
};
use kubearchive_crd::{
    ClusterKubeArchiveConfig, KubeArchiveConfig, KubeArchiveConfigStatus, SinkFilter,
    SinkFilterSpec,
};
use kubearchive_filter::FilterTable;
use kubearchive_shared::{
    constants::{
        A13E_NAME, CONFIG_RESOURCE_NAME, FIELD_MANAGER, SINK_FILTER_NAME, SINK_NAME, VACUUM_NAME,
    },
    discovery::KindResolver,
};
use snafu::{ResultExt, Snafu};

use crate::{apiserversource, merge, rbac};

/// Guards namespace cleanup: the config only leaves etcd once its derived
/// objects are gone.
pub const FINALIZER_NAME: &str = "kubearchive.org/cleanup";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list archive configs"))]
    ListConfigs { source: kube::Error },

    #[snafu(display("merged filter configuration does not compile"))]
    CompileFilters {
        source: kubearchive_filter::RebuildError,
    },

    #[snafu(display("failed to apply the sink filter"))]
    ApplySinkFilter { source: kube::Error },

    #[snafu(display("failed to apply the event source"))]
    ApplyEventSource { source: kube::Error },

    #[snafu(display("failed to apply cluster role"))]
    ApplyClusterRole { source: kube::Error },

    #[snafu(display("failed to apply RBAC in namespace {namespace:?}"))]
    ApplyNamespaceRbac {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("failed to remove RBAC from namespace {namespace:?}"))]
    CleanupNamespaceRbac {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("failed to process the config finalizer"))]
    Finalizer {
        #[snafu(source(from(kube::runtime::finalizer::Error<Error>, Box::new)))]
        source: Box<kube::runtime::finalizer::Error<Error>>,
    },
}

pub struct Context {
    pub client: Client,
    pub operator_namespace: String,
    pub resolver: KindResolver,
}

/// Runs the controller until it is shut down by a signal.
pub async fn run(ctx: Arc<Context>) {
    let namespace_configs: Api<KubeArchiveConfig> = Api::all(ctx.client.clone());
    let cluster_configs: Api<ClusterKubeArchiveConfig> = Api::all(ctx.client.clone());

    // With only a cluster config and no namespace configs there is no
    // object to reconcile, but the global filter entry and the event source
    // still need to exist. One initial pass covers that; everything after
    // is object-driven.
    if let Err(error) = apply_cluster_state(&ctx).await {
        tracing::warn!(%error, "initial reconcile failed, the controller will retry per object");
    }

    // A dedicated reflector keeps the set of namespace configs so a cluster
    // config change can re-enqueue every one of them.
    let (store, writer) = store::<KubeArchiveConfig>();
    let config_cache = reflector(
        writer,
        watcher(namespace_configs.clone(), watcher::Config::default()),
    )
    .default_backoff()
    .touched_objects();
    tokio::spawn(async move {
        futures::pin_mut!(config_cache);
        while let Some(result) = config_cache.next().await {
            if let Err(error) = result {
                tracing::warn!(%error, "namespace config cache watch failed, restarting");
            }
        }
    });

    Controller::new(namespace_configs, watcher::Config::default())
        .watches(
            cluster_configs,
            watcher::Config::default(),
            move |_cluster_config| {
                // the cluster config merges into every namespace, so any
                // change to it is a full resync
                store
                    .state()
                    .into_iter()
                    .map(|config| ObjectRef::from_obj(config.as_ref()))
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => tracing::debug!(object = %object, "reconciled"),
                Err(error) => tracing::warn!(%error, "reconcile failed"),
            }
        })
        .await;
}

async fn reconcile(config: Arc<KubeArchiveConfig>, ctx: Arc<Context>) -> Result<Action> {
    let Some(namespace) = config.namespace() else {
        return Ok(Action::await_change());
    };

    if config.name_any() != CONFIG_RESOURCE_NAME {
        // the webhook rejects foreign names at admission; one that slipped
        // in anyway (webhook outage) must not drive any state
        tracing::warn!(%namespace, name = %config.name_any(), "ignoring config with unexpected name");
        return Ok(Action::await_change());
    }

    let api: Api<KubeArchiveConfig> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER_NAME, config, |event| async {
        match event {
            FinalizerEvent::Apply(config) => apply_config(&config, &ctx).await,
            FinalizerEvent::Cleanup(config) => cleanup_config(&config, &ctx).await,
        }
    })
    .await
    .context(FinalizerSnafu)
}

/// Requeues the failed object on a short backoff of its own, independent of
/// any other watch traffic.
fn error_policy(config: Arc<KubeArchiveConfig>, error: &Error, _ctx: Arc<Context>) -> Action {
    tracing::warn!(
        %error,
        namespace = %config.namespace().unwrap_or_default(),
        "reconcile failed, requeueing with backoff"
    );
    Action::requeue(Duration::from_secs(10))
}

/// The apply side of the finalizer: recompute and apply the derived state,
/// then record the outcome on this config's status.
async fn apply_config(config: &KubeArchiveConfig, ctx: &Context) -> Result<Action> {
    match apply_cluster_state(ctx).await {
        Ok(()) => {
            let condition =
                ready_condition("True", "ReconcileSucceeded", "configuration active");
            update_status(ctx, config, condition).await;

            // periodic resync bounds drift from missed events
            Ok(Action::requeue(Duration::from_secs(300)))
        }
        Err(error) => {
            let condition = ready_condition("False", "ReconcileFailed", &error.to_string());
            update_status(ctx, config, condition).await;
            Err(error)
        }
    }
}

/// The cleanup side of the finalizer: tear down the namespace's RBAC and
/// recompute the shared state without it. Only when both succeed does the
/// finalizer release the object.
async fn cleanup_config(config: &KubeArchiveConfig, ctx: &Context) -> Result<Action> {
    if let Some(namespace) = config.namespace() {
        delete_namespace_rbac(ctx, &namespace).await?;
    }

    // The deleting config carries a deletion timestamp and is filtered out
    // of the listing, so this recompute drops its SinkFilter entry, shrinks
    // the event source scope and prunes its subject from the broker binding
    // by set difference.
    apply_cluster_state(ctx).await?;

    Ok(Action::await_change())
}

/// One full recomputation: read every config, derive all owned objects,
/// apply them. The derived objects are cluster-wide singletons plus
/// per-namespace fans-out, so every reconcile applies the whole picture.
async fn apply_cluster_state(ctx: &Context) -> Result<()> {
    let cluster_config = Api::<ClusterKubeArchiveConfig>::all(ctx.client.clone())
        .get_opt(CONFIG_RESOURCE_NAME)
        .await
        .context(ListConfigsSnafu)?;

    let namespace_configs = Api::<KubeArchiveConfig>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await
        .context(ListConfigsSnafu)?
        .items
        .into_iter()
        .filter(|config| {
            config.name_any() == CONFIG_RESOURCE_NAME
                && config.metadata.deletion_timestamp.is_none()
        })
        .collect::<Vec<_>>();

    let cluster_resources = cluster_config
        .as_ref()
        .map(|config| config.spec.resources.clone())
        .unwrap_or_default();

    let per_namespace: BTreeMap<String, _> = namespace_configs
        .iter()
        .filter_map(|config| {
            config
                .namespace()
                .map(|namespace| (namespace, config.spec.resources.clone()))
        })
        .collect();

    let sink_filter = merge::build_sink_filter(&cluster_resources, &per_namespace);
    let kinds = merge::referenced_kinds(&sink_filter);
    let namespaces = merge::referenced_namespaces(&sink_filter);

    // A merged spec that does not compile would be rejected by the sink as
    // well; fail before touching the previously applied filter object.
    FilterTable::new()
        .rebuild(&sink_filter)
        .context(CompileFiltersSnafu)?;

    apply_sink_filter(ctx, &sink_filter).await?;
    apply_event_source(ctx, &kinds, &namespaces).await?;
    apply_rbac(ctx, &kinds, &namespaces).await?;

    tracing::info!(
        namespaces = namespaces.len(),
        kinds = kinds.len(),
        "derived state applied"
    );

    Ok(())
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

async fn apply_sink_filter(ctx: &Context, spec: &SinkFilterSpec) -> Result<()> {
    let api: Api<SinkFilter> = Api::namespaced(ctx.client.clone(), &ctx.operator_namespace);
    let mut object = SinkFilter::new(SINK_FILTER_NAME, spec.clone());
    object.metadata.labels = Some(rbac::managed_labels());

    api.patch(SINK_FILTER_NAME, &apply_params(), &Patch::Apply(&object))
        .await
        .context(ApplySinkFilterSnafu)?;

    Ok(())
}

async fn apply_event_source(
    ctx: &Context,
    kinds: &[(String, String)],
    namespaces: &[String],
) -> Result<()> {
    let source = apiserversource::build(&ctx.operator_namespace, kinds, namespaces);
    let api: Api<DynamicObject> = Api::namespaced_with(
        ctx.client.clone(),
        &ctx.operator_namespace,
        &apiserversource::api_resource(),
    );

    api.patch(A13E_NAME, &apply_params(), &Patch::Apply(&source))
        .await
        .context(ApplyEventSourceSnafu)?;

    Ok(())
}

async fn apply_rbac(
    ctx: &Context,
    kinds: &[(String, String)],
    namespaces: &[String],
) -> Result<()> {
    // Resolve the plural resource names RBAC rules are written in. A kind
    // whose CRD is not (yet) installed is skipped with a warning; the next
    // resync picks it up.
    let mut rbac_kinds = Vec::new();
    for (api_version, kind) in kinds {
        match ctx.resolver.by_kind(api_version, kind).await {
            Ok((resource, _)) => rbac_kinds.push(rbac::RbacKind {
                group: resource.group,
                plural: resource.plural,
            }),
            Err(error) => {
                tracing::warn!(%error, %api_version, %kind, "skipping unresolvable kind in RBAC rules");
            }
        }
    }
    rbac_kinds.sort();
    rbac_kinds.dedup();

    let cluster_roles: Api<ClusterRole> = Api::all(ctx.client.clone());
    let listener_role = rbac::listener_cluster_role(&rbac_kinds);
    cluster_roles
        .patch(A13E_NAME, &apply_params(), &Patch::Apply(&listener_role))
        .await
        .context(ApplyClusterRoleSnafu)?;

    for namespace in namespaces {
        apply_namespace_rbac(ctx, namespace, &rbac_kinds)
            .await
            .context(ApplyNamespaceRbacSnafu { namespace })?;
    }

    let bindings: Api<RoleBinding> =
        Api::namespaced(ctx.client.clone(), &ctx.operator_namespace);
    let broker = rbac::broker_role_binding(&ctx.operator_namespace, namespaces);
    bindings
        .patch(
            &broker.name_any(),
            &apply_params(),
            &Patch::Apply(&broker),
        )
        .await
        .context(ApplyClusterRoleSnafu)?;

    Ok(())
}

async fn apply_namespace_rbac(
    ctx: &Context,
    namespace: &str,
    kinds: &[rbac::RbacKind],
) -> Result<(), kube::Error> {
    let service_accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), namespace);
    let roles: Api<Role> = Api::namespaced(ctx.client.clone(), namespace);
    let bindings: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), namespace);
    let params = apply_params();

    for account in [
        rbac::listener_service_account(namespace),
        rbac::vacuum_service_account(namespace),
    ] {
        service_accounts
            .patch(&account.name_any(), &params, &Patch::Apply(&account))
            .await?;
    }

    for role in [rbac::sink_role(namespace, kinds), rbac::vacuum_role(namespace, kinds)] {
        roles
            .patch(&role.name_any(), &params, &Patch::Apply(&role))
            .await?;
    }

    for binding in [
        rbac::listener_role_binding(namespace),
        rbac::sink_role_binding(namespace, &ctx.operator_namespace),
        rbac::vacuum_role_binding(namespace),
    ] {
        bindings
            .patch(&binding.name_any(), &params, &Patch::Apply(&binding))
            .await?;
    }

    Ok(())
}

/// Removes the per-namespace objects the operator created. Missing objects
/// are fine (cleanup may be re-run after a partial failure).
async fn delete_namespace_rbac(ctx: &Context, namespace: &str) -> Result<()> {
    let params = DeleteParams::default();

    let service_accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), namespace);
    for name in [A13E_NAME, VACUUM_NAME] {
        tolerate_missing(service_accounts.delete(name, &params).await)
            .context(CleanupNamespaceRbacSnafu { namespace })?;
    }

    let roles: Api<Role> = Api::namespaced(ctx.client.clone(), namespace);
    for name in [SINK_NAME, VACUUM_NAME] {
        tolerate_missing(roles.delete(name, &params).await)
            .context(CleanupNamespaceRbacSnafu { namespace })?;
    }

    let bindings: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), namespace);
    for name in [A13E_NAME, SINK_NAME, VACUUM_NAME] {
        tolerate_missing(bindings.delete(name, &params).await)
            .context(CleanupNamespaceRbacSnafu { namespace })?;
    }

    tracing::info!(%namespace, "removed namespace RBAC");
    Ok(())
}

fn tolerate_missing<T>(result: kube::Result<T>) -> kube::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(error),
    }
}

fn ready_condition(status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        type_: "Ready".to_owned(),
        status: status.to_owned(),
        reason: reason.to_owned(),
        message: message.to_owned(),
        last_transition_time: Time(k8s_openapi::jiff::Timestamp::now()),
        observed_generation: None,
    }
}

/// Best-effort status patching; a failed status write never fails the
/// reconcile itself.
async fn update_status(ctx: &Context, config: &KubeArchiveConfig, condition: Condition) {
    let Some(namespace) = config.namespace() else {
        return;
    };

    let api: Api<KubeArchiveConfig> = Api::namespaced(ctx.client.clone(), &namespace);
    let status = serde_json::json!({
        "apiVersion": KubeArchiveConfig::api_version(&()),
        "kind": KubeArchiveConfig::kind(&()),
        "status": KubeArchiveConfigStatus {
            conditions: vec![condition],
        },
    });

    if let Err(error) = api
        .patch_status(
            &config.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&status),
        )
        .await
    {
        tracing::warn!(%error, %namespace, "failed to update config status");
    }
}
