//! Status values written back onto a ProjectHelmChart

use hpo_common::crd::{ChartStatus, ProjectHelmChartStatus, ValuesMap};
use hpo_common::labels::CLEANUP_LABEL;
use hpo_common::release::ReleaseAddress;
use hpo_common::MAX_NAMESPACE_NAME_LEN;

const NO_TARGETS_MESSAGE: &str = "There are no project namespaces to deploy a ProjectHelmChart.";
const VALIDATED_MESSAGE: &str = "ProjectHelmChart is valid. HelmChart and HelmRelease should be deployed.";
const WAITING_MESSAGE: &str = "Waiting for status.dashboardValues content to be provided by the deployed Helm release, but HelmChart and HelmRelease should be deployed.";
const DEPLOYED_MESSAGE: &str = "ProjectHelmChart has been successfully deployed!";

/// The chart carries the cleanup label
pub fn awaiting_redeployment(namespace: &str, helm_api_version: &str) -> ProjectHelmChartStatus {
    ProjectHelmChartStatus::with_state(
        ChartStatus::AwaitingOperatorRedeployment,
        format!(
            "ProjectHelmChart was marked with label {}=true, which indicates that the resource should be cleaned up \
             until the Project Operator that responds to ProjectHelmCharts in {} with spec.helmApiVersion={} \
             is redeployed onto the cluster. On redeployment, this label will automatically be removed by the operator.",
            CLEANUP_LABEL, namespace, helm_api_version
        ),
    )
}

/// An older chart already owns the release address
pub fn release_conflict(
    address: &ReleaseAddress,
    owner_namespace: &str,
    owner_name: &str,
) -> ProjectHelmChartStatus {
    ProjectHelmChartStatus::with_state(
        ChartStatus::UnableToCreateHelmRelease,
        format!(
            "Unable to create a release ({}) for ProjectHelmChart since ProjectHelmChart {}/{} already occupies it",
            address, owner_namespace, owner_name
        ),
    )
}

/// The dedicated release namespace name is not a valid namespace name
pub fn release_namespace_too_long(name: &str) -> ProjectHelmChartStatus {
    ProjectHelmChartStatus::with_state(
        ChartStatus::UnableToCreateHelmRelease,
        format!(
            "Unable to create a release namespace {} for ProjectHelmChart since its name is longer than {} characters",
            name, MAX_NAMESPACE_NAME_LEN
        ),
    )
}

/// The project has no member namespaces
pub fn no_targets() -> ProjectHelmChartStatus {
    ProjectHelmChartStatus::with_state(ChartStatus::NoTargetProjectNamespaces, NO_TARGETS_MESSAGE)
}

/// `spec.values` could not be rendered
pub fn unable_to_parse_values(error: &dyn std::fmt::Display) -> ProjectHelmChartStatus {
    ProjectHelmChartStatus::with_state(
        ChartStatus::UnableToParseValues,
        format!(
            "Unable to convert provided spec.values into valid configuration of ProjectHelmChart: {}",
            error
        ),
    )
}

/// Status after the full object set was computed.
///
/// Reported dashboard values mean Deployed. Without them the first pass is
/// Validated and later passes wait; the state is recomputed every pass, so a
/// release that stops reporting goes back to waiting.
pub fn applied(
    previous: &ProjectHelmChartStatus,
    system_namespace: &str,
    address: &ReleaseAddress,
    target_namespaces: Vec<String>,
    dashboard_values: Option<ValuesMap>,
) -> ProjectHelmChartStatus {
    let (state, message) = match (&dashboard_values, previous.state().has_deployed()) {
        (Some(_), _) => (ChartStatus::Deployed, DEPLOYED_MESSAGE),
        (None, true) => (ChartStatus::WaitingForDashboardValues, WAITING_MESSAGE),
        (None, false) => (ChartStatus::Validated, VALIDATED_MESSAGE),
    };
    ProjectHelmChartStatus {
        status: Some(state),
        status_message: Some(message.to_string()),
        system_namespace: Some(system_namespace.to_string()),
        release_namespace: Some(address.namespace.clone()),
        release_name: Some(address.name.clone()),
        target_namespaces,
        dashboard_values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ReleaseAddress {
        ReleaseAddress {
            namespace: "cattle-helm-system".to_string(),
            name: "project-monitoring".to_string(),
        }
    }

    #[test]
    fn applied_state_progression() {
        let first = applied(
            &ProjectHelmChartStatus::default(),
            "cattle-helm-system",
            &address(),
            vec!["team-a".to_string()],
            None,
        );
        assert_eq!(first.state(), ChartStatus::Validated);
        assert_eq!(first.release_name.as_deref(), Some("project-monitoring"));
        assert_eq!(first.target_namespaces, vec!["team-a"]);

        let second = applied(&first, "cattle-helm-system", &address(), vec![], None);
        assert_eq!(second.state(), ChartStatus::WaitingForDashboardValues);

        let values = ValuesMap::from([("a".to_string(), serde_json::json!(1))]);
        let deployed = applied(&second, "cattle-helm-system", &address(), vec![], Some(values));
        assert_eq!(deployed.state(), ChartStatus::Deployed);
        assert_eq!(deployed.status_message.as_deref(), Some(DEPLOYED_MESSAGE));

        let lost = applied(&deployed, "cattle-helm-system", &address(), vec![], None);
        assert_eq!(lost.state(), ChartStatus::WaitingForDashboardValues);
    }

    #[test]
    fn failure_states_clear_release_fields() {
        let status = awaiting_redeployment("cattle-project-p-1", "monitoring.cattle.io/v1alpha1");
        assert_eq!(status.state(), ChartStatus::AwaitingOperatorRedeployment);
        let message = status.status_message.unwrap();
        assert!(message.contains(CLEANUP_LABEL));
        assert!(message.contains("cattle-project-p-1"));
        assert!(message.contains("spec.helmApiVersion=monitoring.cattle.io/v1alpha1"));
        assert!(status.release_namespace.is_none());
        assert!(status.target_namespaces.is_empty());

        let status = release_conflict(&address(), "cattle-helm-system", "older");
        assert_eq!(status.state(), ChartStatus::UnableToCreateHelmRelease);
        assert!(status
            .status_message
            .unwrap()
            .contains("cattle-helm-system/project-monitoring"));
    }
}
