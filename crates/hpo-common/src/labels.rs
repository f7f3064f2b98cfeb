//! Labels and annotations the operator reads and writes
//!
//! These keys are a wire contract shared with the chart being deployed and
//! with other operator versions on the same cluster; do not rename them.

use std::collections::BTreeMap;

/// Marks every object the operator creates
pub const OPERATED_LABEL: &str = "helm.cattle.io/helm-project-operated";

/// Marks registration/release namespaces with no member namespaces left
pub const ORPHANED_LABEL: &str = "helm.cattle.io/helm-project-operator-orphaned";

/// On a ProjectHelmChart: tear down children until the operator is redeployed
pub const CLEANUP_LABEL: &str = "helm.cattle.io/helm-project-operator-cleanup";

/// Mirrored project id, present on every namespace of a project in system-project mode
pub const PROJECT_ID_LABEL: &str = "helm.cattle.io/projectId";

/// Operator API group (the part of `spec.helmApiVersion` before `/`)
pub const HELM_API_VERSION_LABEL: &str = "helm.cattle.io/helm-api-version";

/// Tags ConfigMaps whose `.json` keys feed `status.dashboardValues`; value is the release name
pub const DASHBOARD_VALUES_LABEL: &str = "helm.cattle.io/dashboard-values-configmap";

/// Tags Roles deployed by the chart for RBAC aggregation; value is the release name
pub const ROLE_LABEL: &str = "helm.cattle.io/project-helm-chart-role";

/// Default-role slot a chart Role aggregates from (`admin`, `edit`, `view`)
pub const ROLE_AGGREGATE_FROM_LABEL: &str = "helm.cattle.io/project-helm-chart-role-aggregate-from";

/// Marks RoleBindings emitted for a chart; value is the release name
pub const ROLE_BINDING_LABEL: &str = "helm.cattle.io/project-helm-chart-role-binding";

/// Prefix of project registration namespaces
pub const REGISTRATION_NAMESPACE_PREFIX: &str = "cattle-project-";

/// Name of the registration namespace for a project
pub fn registration_namespace_name(project_id: &str) -> String {
    format!("{}{}", REGISTRATION_NAMESPACE_PREFIX, project_id)
}

/// Labels carried by every operated object: `operated=true`, plus the project id when known
pub fn common_labels(project_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(OPERATED_LABEL.to_string(), "true".to_string())]);
    if !project_id.is_empty() {
        labels.insert(PROJECT_ID_LABEL.to_string(), project_id.to_string());
    }
    labels
}

/// Labels for a registration or release namespace
pub fn project_namespace_labels(
    project_id: &str,
    project_label: &str,
    project_label_value: &str,
    orphaned: bool,
) -> BTreeMap<String, String> {
    let mut labels = common_labels(project_id);
    if orphaned {
        labels.insert(ORPHANED_LABEL.to_string(), "true".to_string());
    }
    labels.insert(project_label.to_string(), project_label_value.to_string());
    labels
}

/// Annotations for a registration or release namespace.
///
/// Rancher expects the project annotation as `<clusterID>:<projectID>`.
pub fn project_namespace_annotations(
    project_id: &str,
    project_label: &str,
    cluster_id: Option<&str>,
) -> BTreeMap<String, String> {
    let value = match cluster_id {
        Some(cluster) if !cluster.is_empty() => format!("{}:{}", cluster, project_id),
        _ => project_id.to_string(),
    };
    BTreeMap::from([(project_label.to_string(), value)])
}

/// API group portion of a `helmApiVersion`
pub fn helm_api_group(helm_api_version: &str) -> &str {
    helm_api_version
        .split_once('/')
        .map_or(helm_api_version, |(group, _)| group)
}

/// Labels for HelmCharts and HelmReleases
pub fn helm_resource_labels(project_id: &str, helm_api_version: &str) -> BTreeMap<String, String> {
    let mut labels = common_labels(project_id);
    labels.insert(
        HELM_API_VERSION_LABEL.to_string(),
        helm_api_group(helm_api_version).to_string(),
    );
    labels
}

/// Labels for RoleBindings emitted for a release
pub fn role_binding_labels(project_id: &str, release_name: &str) -> BTreeMap<String, String> {
    let mut labels = common_labels(project_id);
    labels.insert(ROLE_BINDING_LABEL.to_string(), release_name.to_string());
    labels
}
