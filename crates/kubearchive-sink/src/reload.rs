//! Hot reload of the filter table from the `SinkFilter` object.

use std::sync::Arc;

use futures::TryStreamExt;
use kube::{
    Api, Client,
    runtime::{WatchStreamExt, watcher},
};
use kubearchive_crd::SinkFilter;
use kubearchive_filter::FilterTable;
use kubearchive_shared::constants::SINK_FILTER_NAME;

/// Watches the named `SinkFilter` in the operator namespace and rebuilds the
/// shared table on every change. Runs until the process exits; watch errors
/// back off and resume, rebuild errors keep the previous table in force.
pub async fn watch_sink_filter(client: Client, operator_namespace: String, filters: Arc<FilterTable>) {
    let api: Api<SinkFilter> = Api::namespaced(client, &operator_namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={SINK_FILTER_NAME}"));

    loop {
        let stream = watcher(api.clone(), config.clone())
            .default_backoff()
            .applied_objects();
        futures::pin_mut!(stream);

        loop {
            match stream.try_next().await {
                Ok(Some(sink_filter)) => {
                    if let Err(error) = filters.rebuild(&sink_filter.spec) {
                        tracing::error!(%error, "filter table rebuild failed, keeping previous table");
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(%error, "sink filter watch failed, restarting");
                    break;
                }
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}
