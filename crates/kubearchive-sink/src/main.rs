//! The KubeArchive sink: receives resource events from the cluster event
//! source, archives matching resources and deletes live resources when the
//! filters say so.

use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use kube::Client;
use kubearchive_filter::FilterTable;
use kubearchive_shared::{constants, discovery::KindResolver, logging};
use kubearchive_storage::{ConnectionOptions, Database};
use snafu::{ResultExt, Snafu};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

mod dispatch;
mod event;
mod reload;
mod server;

pub const APP_NAME: &str = "kubearchive-sink";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Address the event endpoint binds to.
    #[arg(long, env = "SINK_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,

    /// Namespace the operator and the SinkFilter object live in.
    #[arg(long, env = "KUBEARCHIVE_NAMESPACE")]
    operator_namespace: String,

    /// Postgres connection URL.
    #[arg(long, env = "KUBEARCHIVE_DATABASE_URL")]
    database_url: String,

    /// Upper bound on concurrently processed events.
    #[arg(long, env = "SINK_MAX_INFLIGHT", default_value_t = 64)]
    max_inflight: usize,
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to connect to the archive database"))]
    ConnectDatabase { source: kubearchive_storage::Error },

    #[snafu(display("failed to bind {bind_address:?}"))]
    BindListener {
        source: std::io::Error,
        bind_address: String,
    },

    #[snafu(display("HTTP server failed"))]
    Serve { source: std::io::Error },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::initialize(APP_NAME);

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "sink exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let client = Client::try_default().await.context(CreateClientSnafu)?;

    let database = Database::connect(&ConnectionOptions {
        url: args.database_url.clone(),
        ..ConnectionOptions::default()
    })
    .await
    .context(ConnectDatabaseSnafu)?;

    let filters = Arc::new(FilterTable::new());
    let resolver = Arc::new(KindResolver::new(client.clone()));
    let shutdown = CancellationToken::new();

    // Filter reload runs for the lifetime of the process; until the first
    // SinkFilter arrives the table is empty and every event is skipped.
    tokio::spawn(reload::watch_sink_filter(
        client.clone(),
        args.operator_namespace.clone(),
        Arc::clone(&filters),
    ));

    let state = server::AppState {
        dispatcher: Arc::new(dispatch::Dispatcher::new(
            filters,
            database,
            resolver,
        )),
        permits: Arc::new(Semaphore::new(args.max_inflight)),
        shutdown: shutdown.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&args.bind_address)
        .await
        .context(BindListenerSnafu {
            bind_address: args.bind_address.clone(),
        })?;
    tracing::info!(
        bind_address = %args.bind_address,
        operator_namespace = %args.operator_namespace,
        sink_filter = constants::SINK_FILTER_NAME,
        "sink is accepting events"
    );

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context(ServeSnafu)
}

/// Resolves when SIGTERM or SIGINT arrives, cancelling in-flight evaluation
/// on the way out.
async fn shutdown_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
    }

    shutdown.cancel();
}
