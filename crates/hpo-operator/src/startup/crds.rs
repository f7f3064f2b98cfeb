//! CRD installation using server-side apply

use hpo_common::crd::ProjectHelmChart;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

/// Name of the ProjectHelmChart CRD
pub const PROJECT_HELM_CHART_CRD: &str = "projecthelmcharts.helm.cattle.io";

/// Install or update the ProjectHelmChart CRD
pub async fn ensure_crds_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();

    tracing::info!("Installing {} CRD...", PROJECT_HELM_CHART_CRD);
    crds.patch(
        PROJECT_HELM_CHART_CRD,
        &params,
        &Patch::Apply(&ProjectHelmChart::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", PROJECT_HELM_CHART_CRD, e))?;
    tracing::info!("ProjectHelmChart CRD installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_name_matches_generated_definition() {
        let crd = ProjectHelmChart::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some(PROJECT_HELM_CHART_CRD));
    }
}
