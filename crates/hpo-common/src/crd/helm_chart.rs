//! Downstream resources emitted by the reconciler.
//!
//! `HelmChart` is consumed by helm-controller and `HelmRelease` by
//! helm-locker. Only the fields the operator writes are modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Deployment request for helm-controller
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "helm.cattle.io",
    version = "v1",
    kind = "HelmChart",
    plural = "helmcharts",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    /// Namespace the release is installed into
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,

    /// Chart name, also used as the release name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart: String,

    /// Image of the helm job
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_image: String,

    /// Base64 encoded chart archive
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart_content: String,

    /// values.yaml content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values_content: String,
}

/// Address of a helm release
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ReleaseKey {
    /// Release namespace
    pub namespace: String,
    /// Release name
    pub name: String,
}

/// Release-integrity lock for helm-locker
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "helm.cattle.io",
    version = "v1alpha1",
    kind = "HelmRelease",
    plural = "helmreleases",
    namespaced,
    derive = "PartialEq"
)]
pub struct HelmReleaseSpec {
    /// Release to lock
    pub release: ReleaseKey,
}
