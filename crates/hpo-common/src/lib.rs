//! Common types for the helm project operator: CRDs, options, labels, and the
//! shared cluster plumbing (watch cache, applier, enqueue handles, leader lease)

#![deny(missing_docs)]

pub mod apply;
pub mod cache;
pub mod chart;
pub mod crd;
pub mod enqueue;
pub mod error;
pub mod labels;
pub mod leader_election;
pub mod options;
pub mod release;
pub mod roles;
pub mod selector;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the operator runs in when none is configured
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "cattle-helm-system";

/// Default controller name, used as the field manager and lease prefix
pub const DEFAULT_CONTROLLER_NAME: &str = "helm-project-operator";

/// Image used by the downstream helm-controller job when none is configured
pub const DEFAULT_JOB_IMAGE: &str = "rancher/klipper-helm:v0.7.0-build20220315";

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Kubernetes caps namespace names (DNS-1123 labels) at this many characters
pub const MAX_NAMESPACE_NAME_LEN: usize = 63;
