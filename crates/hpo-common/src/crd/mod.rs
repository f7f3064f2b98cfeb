//! Custom Resource Definitions read or emitted by the operator

mod helm_chart;
mod project_helm_chart;

pub use helm_chart::{HelmChart, HelmChartSpec, HelmRelease, HelmReleaseSpec, ReleaseKey};
pub use project_helm_chart::{
    ChartStatus, ProjectHelmChart, ProjectHelmChartSpec, ProjectHelmChartStatus, ValuesMap,
};

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};

/// Schema for free-form objects (`spec.values`, `status.dashboardValues`).
///
/// The API server prunes unknown fields unless told otherwise, so these maps
/// carry `x-kubernetes-preserve-unknown-fields`.
pub(crate) fn preserve_unknown_fields(_gen: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
