//! ProjectHelmChart controller
//!
//! Applies what [`ProjectReconciler`] computes as one apply set owned by the
//! chart and writes the status back when it changed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hpo_common::apply::{ApplyOwner, ApplySet, ObjectKind, ResourceApplier};
use hpo_common::crd::{ProjectHelmChart, ProjectHelmChartStatus};
use hpo_common::labels::CLEANUP_LABEL;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, error, info};

use crate::error::ProjectError;
use crate::reconciler::{ProjectReconciler, Reconciled};

/// Apply set id of a chart's children
pub const PROJECT_HELM_CHART_SET: &str = "project-helm-chart-applier";

/// Requeue interval after a failed pass
const REQUEUE_ERROR_SECS: u64 = 30;

/// Kinds pruned from a chart's apply set; namespaces are never pruned
pub(crate) const PRUNED_KINDS: [ObjectKind; 3] = [
    ObjectKind::HelmChart,
    ObjectKind::HelmRelease,
    ObjectKind::RoleBinding,
];

// =============================================================================
// Status writes
// =============================================================================

/// Writes to ProjectHelmCharts other than applying children
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartStatusClient: Send + Sync {
    /// Replace the chart's status
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ProjectHelmChartStatus,
    ) -> hpo_common::Result<()>;

    /// Drop the cleanup label from a chart
    async fn remove_cleanup_label(&self, namespace: &str, name: &str) -> hpo_common::Result<()>;
}

/// [`ChartStatusClient`] backed by the API server
pub struct KubeChartStatusClient {
    client: Client,
    field_manager: String,
}

impl KubeChartStatusClient {
    /// Client writing as `field_manager`
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }
}

#[async_trait]
impl ChartStatusClient for KubeChartStatusClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ProjectHelmChartStatus,
    ) -> hpo_common::Result<()> {
        let api: Api<ProjectHelmChart> = Api::namespaced(self.client.clone(), namespace);
        // server-side apply drops fields this manager no longer sets
        let patch = json!({
            "apiVersion": ProjectHelmChart::api_version(&()),
            "kind": ProjectHelmChart::kind(&()),
            "status": status,
        });
        api.patch_status(
            name,
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(&patch),
        )
        .await?;
        Ok(())
    }

    async fn remove_cleanup_label(&self, namespace: &str, name: &str) -> hpo_common::Result<()> {
        let api: Api<ProjectHelmChart> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "labels": { CLEANUP_LABEL: null } } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Shared state of the ProjectHelmChart controller
pub struct ProjectContext {
    reconciler: ProjectReconciler,
    applier: Arc<dyn ResourceApplier>,
    status: Arc<dyn ChartStatusClient>,
}

impl ProjectContext {
    /// Create the context
    pub fn new(
        reconciler: ProjectReconciler,
        applier: Arc<dyn ResourceApplier>,
        status: Arc<dyn ChartStatusClient>,
    ) -> Self {
        Self {
            reconciler,
            applier,
            status,
        }
    }

    /// The desired-state computation
    pub fn reconciler(&self) -> &ProjectReconciler {
        &self.reconciler
    }
}

/// Reconcile one ProjectHelmChart
pub async fn reconcile(
    chart: Arc<ProjectHelmChart>,
    ctx: Arc<ProjectContext>,
) -> Result<Action, ProjectError> {
    let namespace = chart.namespace_or_default();
    let name = chart.name_any();
    let previous = chart.status_or_default();

    match ctx.reconciler.reconcile(&chart, &previous) {
        Reconciled::Ignored => {}
        Reconciled::StatusOnly(status) => {
            write_status(&ctx, &chart, status).await?;
        }
        Reconciled::Desired { objects, status } => {
            debug!(
                chart = %name,
                namespace = %namespace,
                objects = objects.len(),
                "applying ProjectHelmChart objects"
            );
            let set = ApplySet::new(PROJECT_HELM_CHART_SET)
                .with_owner(ApplyOwner::of(chart.as_ref()))
                .with_prune(&PRUNED_KINDS);
            ctx.applier
                .apply(&set, objects)
                .await
                .map_err(|e| ProjectError::apply(&namespace, &name, e))?;
            write_status(&ctx, &chart, status).await?;
        }
    }
    Ok(Action::await_change())
}

async fn write_status(
    ctx: &ProjectContext,
    chart: &ProjectHelmChart,
    status: ProjectHelmChartStatus,
) -> Result<(), ProjectError> {
    if chart.status.as_ref() == Some(&status) {
        return Ok(());
    }
    info!(
        chart = %chart.name_any(),
        namespace = %chart.namespace_or_default(),
        status = %status.state(),
        "updating ProjectHelmChart status"
    );
    ctx.status
        .patch_status(&chart.namespace_or_default(), &chart.name_any(), &status)
        .await?;
    Ok(())
}

/// Error policy for the ProjectHelmChart controller
pub fn error_policy(
    chart: Arc<ProjectHelmChart>,
    error: &ProjectError,
    _ctx: Arc<ProjectContext>,
) -> Action {
    error!(
        ?error,
        chart = %chart.name_any(),
        namespace = %chart.namespace_or_default(),
        "ProjectHelmChart reconciliation failed"
    );
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}
