//! Namespace project resolver
//!
//! Classifies namespaces as system, project registration or project member,
//! materializes registration (and dedicated release) namespaces for every
//! project that has members, and answers membership queries for the
//! ProjectHelmChart reconciler through [`ProjectGetter`].

pub mod error;
pub mod getter;
pub mod registry;
pub mod resolver;
pub mod resources;

pub use error::NamespaceError;
pub use getter::ProjectGetter;
pub use registry::NamespaceRegistry;
pub use resolver::{error_policy, reconcile, NamespaceContext};
