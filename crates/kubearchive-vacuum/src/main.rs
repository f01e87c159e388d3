//! The KubeArchive vacuum: replays live resources through the sink so the
//! archive converges with the cluster, honoring retention clauses.
//!
//! Runs as a Job or CronJob, once per invocation, and prints a structured
//! YAML report on stdout.

use std::{process::ExitCode, time::Duration};

use clap::{Parser, ValueEnum};
use kube::{Api, Client};
use kubearchive_crd::{ClusterVacuumConfig, NamespaceVacuumConfig, SinkFilter, SinkFilterSpec};
use kubearchive_shared::{
    constants::{ALL_NAMESPACES_KEY, GLOBAL_KEY, SINK_FILTER_NAME},
    discovery::KindResolver,
    logging,
};
use snafu::{OptionExt, ResultExt, Snafu};

mod report;
mod retention;
mod run;

pub const APP_NAME: &str = "kubearchive-vacuum";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Sweep one namespace, driven by a NamespaceVacuumConfig.
    Namespace,
    /// Sweep many namespaces, driven by a ClusterVacuumConfig.
    Cluster,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, env = "VACUUM_MODE", value_enum)]
    mode: Mode,

    /// Name of the vacuum config object to execute.
    #[arg(long, env = "VACUUM_CONFIG")]
    config: String,

    /// Namespace this vacuum runs in (namespace mode reads its config here).
    #[arg(long, env = "POD_NAMESPACE")]
    namespace: String,

    /// Namespace the operator and the SinkFilter object live in.
    #[arg(long, env = "KUBEARCHIVE_NAMESPACE")]
    operator_namespace: String,

    /// URL of the sink's event endpoint.
    #[arg(long, env = "KUBEARCHIVE_SINK_URL")]
    sink_url: String,

    /// Wall-clock budget for the whole run, in seconds.
    #[arg(long, env = "VACUUM_BUDGET_SECONDS", default_value_t = 3600)]
    budget_seconds: u64,
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to read vacuum config {name:?}"))]
    ReadVacuumConfig { source: kube::Error, name: String },

    #[snafu(display("vacuum config {name:?} does not exist"))]
    MissingVacuumConfig { name: String },

    #[snafu(display("failed to read the sink filter"))]
    ReadSinkFilter { source: kube::Error },

    #[snafu(display("failed to serialize the report"))]
    SerializeReport { source: serde_yaml::Error },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::initialize(APP_NAME);

    match run(Args::parse()).await {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(error) => {
            tracing::error!(%error, "vacuum exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<bool, Error> {
    let client = Client::try_default().await.context(CreateClientSnafu)?;

    let sink_filter = Api::<SinkFilter>::namespaced(client.clone(), &args.operator_namespace)
        .get_opt(SINK_FILTER_NAME)
        .await
        .context(ReadSinkFilterSnafu)?
        .map(|object| object.spec)
        .unwrap_or_default();

    let targets = collect_targets(&args, &client, &sink_filter).await?;
    tracing::info!(targets = targets.len(), "vacuum starting");

    let vacuum = run::Vacuum {
        resolver: KindResolver::new(client),
        http: reqwest::Client::new(),
        sink_url: args.sink_url.clone(),
        budget: Duration::from_secs(args.budget_seconds),
    };

    let report = vacuum.run(&targets, &sink_filter).await;

    // the report is the run's primary artifact
    println!(
        "{}",
        serde_yaml::to_string(&report).context(SerializeReportSnafu)?
    );

    Ok(!report.has_errors())
}

/// Expands the vacuum config into concrete `(namespace, apiVersion, kind)`
/// sweep targets. An empty resource list means every kind the namespace has
/// a filter entry for.
async fn collect_targets(
    args: &Args,
    client: &Client,
    sink_filter: &SinkFilterSpec,
) -> Result<Vec<(String, String, String)>, Error> {
    let mut targets = Vec::new();

    match args.mode {
        Mode::Namespace => {
            let config = Api::<NamespaceVacuumConfig>::namespaced(client.clone(), &args.namespace)
                .get_opt(&args.config)
                .await
                .context(ReadVacuumConfigSnafu { name: &args.config })?
                .context(MissingVacuumConfigSnafu { name: &args.config })?;

            push_targets(
                &mut targets,
                sink_filter,
                &args.namespace,
                &config.spec.resources,
            );
        }

        Mode::Cluster => {
            let config =
                Api::<ClusterVacuumConfig>::namespaced(client.clone(), &args.operator_namespace)
                    .get_opt(&args.config)
                    .await
                    .context(ReadVacuumConfigSnafu { name: &args.config })?
                    .context(MissingVacuumConfigSnafu { name: &args.config })?;

            for (key, list) in &config.spec.namespaces {
                if key == ALL_NAMESPACES_KEY {
                    for namespace in sink_filter.namespaces.keys() {
                        if namespace != GLOBAL_KEY {
                            push_targets(&mut targets, sink_filter, namespace, &list.resources);
                        }
                    }
                } else {
                    push_targets(&mut targets, sink_filter, key, &list.resources);
                }
            }
        }
    }

    targets.sort();
    targets.dedup();
    Ok(targets)
}

fn push_targets(
    targets: &mut Vec<(String, String, String)>,
    sink_filter: &SinkFilterSpec,
    namespace: &str,
    selectors: &[kubearchive_crd::VacuumSelector],
) {
    if selectors.is_empty() {
        // every kind configured for this namespace, global fallback included
        let specs = sink_filter
            .namespaces
            .get(namespace)
            .or_else(|| sink_filter.namespaces.get(GLOBAL_KEY));

        for spec in specs.into_iter().flatten() {
            let (api_version, kind) = spec.selector.canonical_key();
            targets.push((namespace.to_owned(), api_version, kind));
        }
    } else {
        for selector in selectors {
            targets.push((
                namespace.to_owned(),
                selector.api_version.clone(),
                selector.kind.clone(),
            ));
        }
    }
}
