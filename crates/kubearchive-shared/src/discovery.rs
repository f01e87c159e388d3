//! A read-through cache over Kubernetes API discovery.
//!
//! The archive deals in user-configured `(apiVersion, kind)` pairs and in
//! URL path segments carrying the *plural* resource name. Both directions
//! need discovery data, which is fetched per group/version once and then
//! served from memory.

use std::collections::HashMap;

use kube::{
    Client,
    core::GroupVersionKind,
    discovery::{self, ApiCapabilities, ApiResource},
};
use snafu::{ResultExt, Snafu};
use tokio::sync::RwLock;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to discover API group {group:?} version {version:?}"))]
    DiscoverGroup {
        source: kube::Error,
        group: String,
        version: String,
    },

    #[snafu(display("kind {kind:?} does not exist in {api_version:?}"))]
    UnknownKind { api_version: String, kind: String },

    #[snafu(display("resource {plural:?} does not exist in group {group:?} version {version:?}"))]
    UnknownResource {
        group: String,
        version: String,
        plural: String,
    },
}

/// Splits an `apiVersion` value into `(group, version)`, with the core group
/// represented as the empty string.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Caching resolver from `(apiVersion, kind)` or `(group, version, plural)`
/// to an [`ApiResource`] plus its capabilities.
pub struct KindResolver {
    client: Client,
    cache: RwLock<HashMap<String, Vec<(ApiResource, ApiCapabilities)>>>,
}

impl KindResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Drops all cached discovery data, forcing a refetch on next use. Called
    /// when a lookup misses, since CRDs come and go at runtime.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    async fn versioned_resources(
        &self,
        group: &str,
        version: &str,
    ) -> Result<Vec<(ApiResource, ApiCapabilities)>> {
        let cache_key = format!("{group}/{version}");

        if let Some(cached) = self.cache.read().await.get(&cache_key) {
            return Ok(cached.clone());
        }

        let api_group = discovery::group(&self.client, group).await.context(
            DiscoverGroupSnafu {
                group: group.to_owned(),
                version: version.to_owned(),
            },
        )?;
        let resources = api_group.versioned_resources(version);

        self.cache
            .write()
            .await
            .insert(cache_key, resources.clone());

        Ok(resources)
    }

    /// Resolves a `(apiVersion, kind)` pair as found in archive configs and
    /// resource documents.
    pub async fn by_kind(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities)> {
        let (group, version) = split_api_version(api_version);

        let resources = self.versioned_resources(group, version).await?;
        resources
            .into_iter()
            .find(|(resource, _)| resource.kind == kind)
            .ok_or_else(|| Error::UnknownKind {
                api_version: api_version.to_owned(),
                kind: kind.to_owned(),
            })
    }

    /// Resolves a plural resource path segment (`pods`, `cronjobs`, ...).
    pub async fn by_plural(
        &self,
        group: &str,
        version: &str,
        plural: &str,
    ) -> Result<(ApiResource, ApiCapabilities)> {
        let resources = self.versioned_resources(group, version).await?;
        resources
            .into_iter()
            .find(|(resource, _)| resource.plural == plural)
            .ok_or_else(|| Error::UnknownResource {
                group: group.to_owned(),
                version: version.to_owned(),
                plural: plural.to_owned(),
            })
    }

    /// Convenience wrapper resolving a full [`GroupVersionKind`].
    pub async fn by_gvk(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        let api_version = if gvk.group.is_empty() {
            gvk.version.clone()
        } else {
            format!("{}/{}", gvk.group, gvk.version)
        };
        self.by_kind(&api_version, &gvk.kind).await
    }
}
