//! RBAC subject tracking
//!
//! Keeps an in-memory index of which users, groups and service accounts hold
//! each configured default-role slot (admin/edit/view), per namespace and at
//! cluster scope. The index is fed by RoleBinding and ClusterRoleBinding
//! watches and queried by the reconcilers when emitting RoleBindings.

#![deny(missing_docs)]

pub mod driver;
pub mod tracker;

pub use driver::BindingDriver;
pub use tracker::{BindingKey, Grant, Scope, SubjectKey, SubjectRoleGetter, SubjectRoleTracker, CLUSTER_SCOPE};

#[cfg(any(test, feature = "mock"))]
pub use tracker::MockSubjectRoleGetter;
