//! Shared building blocks for the KubeArchive components: the dynamic
//! resource envelope the sink and filters operate on, Kubernetes label
//! selector parsing, wildcard name patterns and the kind/plural discovery
//! cache.

pub mod constants;
pub mod discovery;
pub mod envelope;
pub mod logging;
pub mod pattern;
pub mod selector;
pub mod web;

pub use envelope::{ResourceDocument, ResourceKey};
pub use pattern::NamePattern;
pub use selector::LabelSelector;
