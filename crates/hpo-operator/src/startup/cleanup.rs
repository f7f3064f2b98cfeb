//! Cleanup label removal

use hpo_common::crd::ProjectHelmChart;
use hpo_project::ChartStatusClient;
use kube::api::{Api, ListParams};
use kube::Client;

/// Strip the cleanup label from every ProjectHelmChart in the cluster
pub async fn remove_cleanup_labels(
    client: &Client,
    status: &dyn ChartStatusClient,
) -> anyhow::Result<()> {
    let charts = Api::<ProjectHelmChart>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| anyhow::anyhow!("failed to list ProjectHelmCharts: {}", e))?;
    let removed = hpo_project::cleanup::remove_cleanup_labels(&charts.items, status)
        .await
        .map_err(|e| anyhow::anyhow!("unable to remove cleanup label: {}", e))?;
    tracing::info!(removed, "cleanup labels removed");
    Ok(())
}
