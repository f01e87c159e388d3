//! Well-known names shared between the operator, sink, vacuum and query API.

/// API group of all KubeArchive custom resources.
pub const API_GROUP: &str = "kubearchive.org";

/// Version of all KubeArchive custom resources.
pub const API_VERSION: &str = "v1";

/// The required name of every `KubeArchiveConfig` and of the singleton
/// `ClusterKubeArchiveConfig`.
pub const CONFIG_RESOURCE_NAME: &str = "kubearchive";

/// Name of the `SinkFilter` object in the operator namespace which backs the
/// in-memory filter table.
pub const SINK_FILTER_NAME: &str = "sink-filters";

/// Pseudo-namespace key under which the cluster-wide filter entry is stored
/// inside the `SinkFilter` object.
pub const GLOBAL_KEY: &str = "___global___";

/// Sentinel key in a `ClusterVacuumConfig` meaning "every namespace with a
/// filter entry".
pub const ALL_NAMESPACES_KEY: &str = "___all-namespaces___";

/// Annotation carrying the JSON list of `{container, url}` entries written by
/// the log collection pipeline.
pub const LOG_URLS_ANNOTATION: &str = "kubearchive.org/log-urls";

/// Upstream annotation naming the container `kubectl logs` defaults to.
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

/// Name of the shared ApiServerSource and of the per-namespace service
/// account it impersonates for watching resources.
pub const A13E_NAME: &str = "kubearchive-a13e";

/// Name of the sink service, its service account and its per-namespace Role.
pub const SINK_NAME: &str = "kubearchive-sink";

/// Name of the per-namespace vacuum service account and Role.
pub const VACUUM_NAME: &str = "kubearchive-vacuum";

/// Name of the RoleBinding in the operator namespace granting all vacuum
/// service accounts access to the broker.
pub const VACUUM_BROKER_BINDING: &str = "kubearchive-vacuum-broker";

/// Field manager used for all server-side apply patches.
pub const FIELD_MANAGER: &str = "kubearchive-operator";

/// Environment variable controlling the log filter of every binary.
pub const LOG_ENV_VAR: &str = "KUBEARCHIVE_LOG";
