//! The KubeArchive operator: reconciles archive configurations and serves
//! the validating admission webhooks.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use kube::{Client, CustomResourceExt};
use kubearchive_crd::{
    ClusterKubeArchiveConfig, ClusterVacuumConfig, KubeArchiveConfig, NamespaceVacuumConfig,
    SinkFilter,
};
use kubearchive_shared::{
    discovery::KindResolver,
    logging,
    web::{TlsOptions, TlsServer},
};
use snafu::{ResultExt, Snafu};

mod apiserversource;
mod controller;
mod merge;
mod rbac;
mod webhooks;

pub const APP_NAME: &str = "kubearchive-operator";

#[derive(Debug, Parser)]
#[command(author, version, about)]
enum Command {
    /// Print the custom resource definitions as YAML.
    Crd,

    /// Run the operator.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Namespace the operator (and its owned singletons) run in.
    #[arg(long, env = "KUBEARCHIVE_NAMESPACE")]
    operator_namespace: String,

    /// Address the webhook server binds to.
    #[arg(long, env = "WEBHOOK_BIND_ADDRESS", default_value = "0.0.0.0:8443")]
    webhook_bind_address: SocketAddr,

    /// Path to the webhook serving certificate (PEM).
    #[arg(long, env = "WEBHOOK_TLS_CERT", default_value = "/etc/webhook-tls/tls.crt")]
    webhook_tls_cert: PathBuf,

    /// Path to the webhook serving key (PEM).
    #[arg(long, env = "WEBHOOK_TLS_KEY", default_value = "/etc/webhook-tls/tls.key")]
    webhook_tls_key: PathBuf,
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to serialize CRDs"))]
    SerializeCrds { source: serde_yaml::Error },

    #[snafu(display("failed to create webhook server"))]
    CreateWebhookServer { source: kubearchive_shared::web::Error },

    #[snafu(display("webhook server failed"))]
    RunWebhookServer { source: kubearchive_shared::web::Error },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::initialize(APP_NAME);

    let result = match Command::parse() {
        Command::Crd => print_crds(),
        Command::Run(args) => run(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "operator exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

fn print_crds() -> Result<(), Error> {
    let crds = [
        serde_yaml::to_string(&KubeArchiveConfig::crd()),
        serde_yaml::to_string(&ClusterKubeArchiveConfig::crd()),
        serde_yaml::to_string(&SinkFilter::crd()),
        serde_yaml::to_string(&NamespaceVacuumConfig::crd()),
        serde_yaml::to_string(&ClusterVacuumConfig::crd()),
    ];

    for crd in crds {
        println!("---\n{}", crd.context(SerializeCrdsSnafu)?);
    }

    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Error> {
    let client = Client::try_default().await.context(CreateClientSnafu)?;

    let controller_ctx = Arc::new(controller::Context {
        client: client.clone(),
        operator_namespace: args.operator_namespace.clone(),
        resolver: KindResolver::new(client.clone()),
    });

    let webhook_ctx = Arc::new(webhooks::WebhookContext {
        client,
        operator_namespace: args.operator_namespace.clone(),
    });
    let webhook_server = TlsServer::new(
        args.webhook_bind_address,
        webhooks::router(webhook_ctx),
        &TlsOptions {
            certificate_path: args.webhook_tls_cert,
            private_key_path: args.webhook_tls_key,
        },
    )
    .context(CreateWebhookServerSnafu)?;

    tracing::info!(
        operator_namespace = %args.operator_namespace,
        webhook_bind_address = %args.webhook_bind_address,
        "operator starting"
    );

    tokio::select! {
        () = controller::run(controller_ctx) => Ok(()),
        result = webhook_server.run() => result.context(RunWebhookServerSnafu),
    }
}
