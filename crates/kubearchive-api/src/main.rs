//! The KubeArchive query API: a read-only, Kubernetes-compatible HTTPS
//! surface merging live cluster state with the archive.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use kubearchive_shared::{
    discovery::KindResolver,
    logging,
    web::{TlsOptions, TlsServer},
};
use kubearchive_storage::{ConnectionOptions, Database};
use snafu::{ResultExt, Snafu};

mod auth;
mod error;
mod live;
mod logs;
mod merge;
mod params;
mod routes;

pub const APP_NAME: &str = "kubearchive-api";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Address the HTTPS server binds to.
    #[arg(long, env = "API_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    bind_address: SocketAddr,

    /// Postgres connection URL.
    #[arg(long, env = "KUBEARCHIVE_DATABASE_URL")]
    database_url: String,

    /// Path to the serving certificate (PEM).
    #[arg(long, env = "API_TLS_CERT", default_value = "/etc/api-tls/tls.crt")]
    tls_cert: PathBuf,

    /// Path to the serving key (PEM).
    #[arg(long, env = "API_TLS_KEY", default_value = "/etc/api-tls/tls.key")]
    tls_key: PathBuf,

    /// Honor Impersonate-User/Impersonate-Group headers on requests.
    #[arg(long, env = "AUTH_IMPERSONATE", default_value_t = false)]
    auth_impersonate: bool,
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to infer the Kubernetes client configuration"))]
    InferConfig { source: kube::config::InferConfigError },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to connect to the archive database"))]
    ConnectDatabase { source: kubearchive_storage::Error },

    #[snafu(display("failed to create HTTP client"))]
    CreateHttpClient { source: reqwest::Error },

    #[snafu(display("failed to create HTTPS server"))]
    CreateServer { source: kubearchive_shared::web::Error },

    #[snafu(display("HTTPS server failed"))]
    RunServer { source: kubearchive_shared::web::Error },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::initialize(APP_NAME);

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "query API exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let base_config = kube::Config::infer().await.context(InferConfigSnafu)?;
    let service_client =
        kube::Client::try_from(base_config.clone()).context(CreateClientSnafu)?;

    let database = Database::connect(&ConnectionOptions {
        url: args.database_url.clone(),
        ..ConnectionOptions::default()
    })
    .await
    .context(ConnectDatabaseSnafu)?;

    let state = routes::AppState {
        database,
        resolver: Arc::new(KindResolver::new(service_client)),
        base_config,
        impersonation_allowed: args.auth_impersonate,
        http: reqwest::Client::builder()
            .build()
            .context(CreateHttpClientSnafu)?,
    };

    let server = TlsServer::new(
        args.bind_address,
        routes::router(state),
        &TlsOptions {
            certificate_path: args.tls_cert,
            private_key_path: args.tls_key,
        },
    )
    .context(CreateServerSnafu)?;

    tracing::info!(
        bind_address = %args.bind_address,
        impersonation = args.auth_impersonate,
        "query API starting"
    );

    server.run().await.context(RunServerSnafu)
}
