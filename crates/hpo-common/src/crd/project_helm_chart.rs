//! ProjectHelmChart CRD types
//!
//! A `ProjectHelmChart` is the only user-authored input: it asks for the
//! operator's embedded chart to be deployed for the project whose
//! registration namespace the chart lives in.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::labels::CLEANUP_LABEL;

/// Free-form values map (helm values, dashboard values)
pub type ValuesMap = BTreeMap<String, serde_json::Value>;

// =============================================================================
// Status
// =============================================================================

/// Reconciliation outcome recorded in `status.status`
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ChartStatus {
    /// The chart carries the cleanup label and waits for the operator to return
    AwaitingOperatorRedeployment,
    /// Another chart already owns this chart's release address
    UnableToCreateHelmRelease,
    /// The project has no member namespaces to deploy into
    NoTargetProjectNamespaces,
    /// `spec.values` could not be turned into a values.yaml
    UnableToParseValues,
    /// Child objects were computed for the first time
    Validated,
    /// Child objects are deployed but the release has not reported values yet
    WaitingForDashboardValues,
    /// Child objects are deployed and the release reported dashboard values
    Deployed,
    /// Any value written by another operator version
    #[default]
    #[serde(other)]
    Unknown,
}

impl ChartStatus {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingOperatorRedeployment => "AwaitingOperatorRedeployment",
            Self::UnableToCreateHelmRelease => "UnableToCreateHelmRelease",
            Self::NoTargetProjectNamespaces => "NoTargetProjectNamespaces",
            Self::UnableToParseValues => "UnableToParseValues",
            Self::Validated => "Validated",
            Self::WaitingForDashboardValues => "WaitingForDashboardValues",
            Self::Deployed => "Deployed",
            Self::Unknown => "Unknown",
        }
    }

    /// True once child objects have been emitted at least once
    pub fn has_deployed(&self) -> bool {
        matches!(
            self,
            Self::Validated | Self::WaitingForDashboardValues | Self::Deployed
        )
    }
}

impl std::fmt::Display for ChartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JsonSchema for ChartStatus {
    fn schema_name() -> String {
        "ChartStatus".to_string()
    }

    fn json_schema(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        // Plain string so values written by older operators still validate
        schemars::schema::Schema::Object(schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            metadata: Some(Box::new(schemars::schema::Metadata {
                description: Some("Reconciliation status of the ProjectHelmChart".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        })
    }
}

/// Observed state of a ProjectHelmChart
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectHelmChartStatus {
    /// Current status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChartStatus>,

    /// Human readable explanation of the status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    /// Namespace holding the HelmChart and HelmRelease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_namespace: Option<String>,

    /// Namespace the release is installed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_namespace: Option<String>,

    /// Name of the helm release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Namespaces the release targets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_namespaces: Vec<String>,

    /// Values reported back by the deployed release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub dashboard_values: Option<ValuesMap>,
}

impl ProjectHelmChartStatus {
    /// Status carrying only a state and message, every other field cleared
    pub fn with_state(status: ChartStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Current state, `Unknown` when never set
    pub fn state(&self) -> ChartStatus {
        self.status.unwrap_or_default()
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Request to deploy the operator's chart into a project
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "helm.cattle.io",
    version = "v1alpha1",
    kind = "ProjectHelmChart",
    plural = "projecthelmcharts",
    shortname = "phc",
    namespaced,
    status = "ProjectHelmChartStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"System Namespace","type":"string","jsonPath":".status.systemNamespace"}"#,
    printcolumn = r#"{"name":"Release Namespace","type":"string","jsonPath":".status.releaseNamespace"}"#,
    printcolumn = r#"{"name":"Release Name","type":"string","jsonPath":".status.releaseName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectHelmChartSpec {
    /// Operator API version this chart targets, e.g. `monitoring.cattle.io/v1alpha1`
    pub helm_api_version: String,

    /// Namespaces to target when no project label is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_namespace_selector: Option<LabelSelector>,

    /// Helm values overlaid on the operator defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub values: Option<ValuesMap>,
}

impl ProjectHelmChart {
    /// Namespace of the chart; charts are namespaced so this is never empty in practice
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    /// True once deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True if the chart carries the cleanup label
    pub fn has_cleanup_label(&self) -> bool {
        self.labels().contains_key(CLEANUP_LABEL)
    }

    /// Stored status, or an empty one
    pub fn status_or_default(&self) -> ProjectHelmChartStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn spec_parses_free_form_values() {
        let spec: ProjectHelmChartSpec = serde_json::from_value(serde_json::json!({
            "helmApiVersion": "dummy.cattle.io/v1alpha1",
            "values": {"a": {"b": [1, 2]}, "c": "d"}
        }))
        .unwrap();
        assert_eq!(spec.helm_api_version, "dummy.cattle.io/v1alpha1");
        let values = spec.values.unwrap();
        assert_eq!(values["c"], "d");
        assert_eq!(values["a"]["b"][1], 2);
        assert!(spec.project_namespace_selector.is_none());
    }

    #[test]
    fn status_round_trips_and_tolerates_unknown_values() {
        let status: ProjectHelmChartStatus = serde_json::from_value(serde_json::json!({
            "status": "Error",
            "statusMessage": "written by an old operator"
        }))
        .unwrap();
        assert_eq!(status.state(), ChartStatus::Unknown);

        let status = ProjectHelmChartStatus::with_state(ChartStatus::Deployed, "ok");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "Deployed");
        assert!(json.get("targetNamespaces").is_none());
    }

    #[test]
    fn deployed_states() {
        assert!(ChartStatus::Validated.has_deployed());
        assert!(ChartStatus::Deployed.has_deployed());
        assert!(!ChartStatus::NoTargetProjectNamespaces.has_deployed());
        assert!(!ChartStatus::Unknown.has_deployed());
    }

    #[test]
    fn crd_preserves_unknown_fields_in_values() {
        let crd = serde_json::to_value(ProjectHelmChart::crd()).unwrap();
        let schema = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"];
        assert_eq!(
            schema["properties"]["spec"]["properties"]["values"]["x-kubernetes-preserve-unknown-fields"],
            true
        );
        assert_eq!(crd["metadata"]["name"], "projecthelmcharts.helm.cattle.io");
    }

    #[test]
    fn cleanup_label_detection() {
        let mut chart = ProjectHelmChart::new("project-monitoring", Default::default());
        assert!(!chart.has_cleanup_label());
        chart
            .labels_mut()
            .insert(CLEANUP_LABEL.to_string(), "true".to_string());
        assert!(chart.has_cleanup_label());
    }
}
