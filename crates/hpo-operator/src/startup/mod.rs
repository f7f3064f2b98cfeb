//! Startup steps that run before the controllers start
//!
//! Every step here is fatal on failure; the controllers only start once the
//! CRD exists, the registration namespaces are known and stale cleanup
//! labels are gone.

mod cleanup;
mod crds;
mod namespaces;

pub use cleanup::remove_cleanup_labels;
pub use crds::ensure_crds_installed;
pub use namespaces::register_project_namespaces;
