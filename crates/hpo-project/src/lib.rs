//! ProjectHelmChart reconciler
//!
//! Turns each ProjectHelmChart into the HelmChart, HelmRelease, RoleBindings
//! and (in system-project mode) dedicated release namespace that deploy the
//! operator's chart into a project, and reports progress on the chart's
//! status. The desired-state computation in [`reconciler`] is pure; the
//! [`controller`] applies its output and writes the status.

#![deny(missing_docs)]

pub mod cleanup;
pub mod controller;
pub mod error;
pub mod reconciler;
pub mod removal;
pub mod resolvers;
pub mod resources;
pub mod status;
pub mod values;

pub use controller::{
    error_policy, reconcile, ChartStatusClient, KubeChartStatusClient, ProjectContext,
    PROJECT_HELM_CHART_SET,
};
pub use error::ProjectError;
pub use reconciler::{ProjectReconciler, Reconciled};
pub use removal::RemovalHandler;
pub use resolvers::ChartResolvers;
