//! Startup removal of the cleanup label
//!
//! A chart labelled for cleanup has its children torn down until an operator
//! answering its `helmApiVersion` comes back. This is that operator coming
//! back, so the label goes.

use hpo_common::crd::ProjectHelmChart;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::ChartStatusClient;
use crate::error::ProjectError;

/// Remove the cleanup label from every labelled chart in `charts`.
///
/// Returns how many charts were updated. The first failure aborts.
pub async fn remove_cleanup_labels(
    charts: &[ProjectHelmChart],
    client: &dyn ChartStatusClient,
) -> Result<usize, ProjectError> {
    info!("removing cleanup label from all registered ProjectHelmCharts");
    let mut removed = 0;
    for chart in charts.iter().filter(|c| c.has_cleanup_label()) {
        let namespace = chart.namespace_or_default();
        let name = chart.name_any();
        client
            .remove_cleanup_label(&namespace, &name)
            .await
            .map_err(|source| ProjectError::CleanupLabel {
                namespace: namespace.clone(),
                name: name.clone(),
                source,
            })?;
        debug!(chart = %name, namespace = %namespace, "cleanup label removed");
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockChartStatusClient;
    use hpo_common::crd::ProjectHelmChartSpec;
    use hpo_common::labels::CLEANUP_LABEL;

    fn chart(name: &str, cleanup: bool) -> ProjectHelmChart {
        let mut chart = ProjectHelmChart::new(name, ProjectHelmChartSpec::default());
        chart.metadata.namespace = Some("cattle-project-p-1".to_string());
        if cleanup {
            chart
                .labels_mut()
                .insert(CLEANUP_LABEL.to_string(), "true".to_string());
        }
        chart
    }

    #[tokio::test]
    async fn only_labelled_charts_are_patched() {
        let mut client = MockChartStatusClient::new();
        client
            .expect_remove_cleanup_label()
            .withf(|namespace, name| namespace == "cattle-project-p-1" && name == "labelled")
            .times(1)
            .returning(|_, _| Ok(()));

        let removed = remove_cleanup_labels(&[chart("labelled", true), chart("plain", false)], &client)
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn failure_is_fatal_and_names_chart() {
        let mut client = MockChartStatusClient::new();
        client
            .expect_remove_cleanup_label()
            .times(1)
            .returning(|_, _| Err(hpo_common::Error::internal("forbidden")));

        let err = remove_cleanup_labels(&[chart("a", true), chart("b", true)], &client)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cattle-project-p-1/a"));
    }
}
