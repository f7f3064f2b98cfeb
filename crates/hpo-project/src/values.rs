//! Helm values for the deployed chart and the dashboard values it reports back

use std::sync::Arc;

use hpo_common::crd::{ProjectHelmChart, ValuesMap};
use hpo_common::labels::PROJECT_ID_LABEL;
use hpo_common::options::{OperatorOptions, ProjectMode};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::warn;

// =============================================================================
// Merging
// =============================================================================

/// Deep merge `overlay` into `base`: maps merge, everything else is replaced
pub fn merge_maps(base: ValuesMap, overlay: ValuesMap) -> ValuesMap {
    merge_into(base, overlay, false)
}

/// Like [`merge_maps`], but arrays present on both sides are concatenated
pub fn merge_maps_concat_slices(base: ValuesMap, overlay: ValuesMap) -> ValuesMap {
    merge_into(base, overlay, true)
}

fn merge_into(mut base: ValuesMap, overlay: ValuesMap, concat: bool) -> ValuesMap {
    for (key, value) in overlay {
        let merged = match base.remove(&key) {
            Some(existing) => merge_value(existing, value, concat),
            None => value,
        };
        base.insert(key, merged);
    }
    base
}

fn merge_value(base: Value, overlay: Value, concat: bool) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_value(existing, value, concat),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (Value::Array(mut base), Value::Array(overlay)) if concat => {
            base.extend(overlay);
            Value::Array(base)
        }
        (_, overlay) => overlay,
    }
}

fn values_map(value: Value) -> ValuesMap {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => ValuesMap::new(),
    }
}

// =============================================================================
// Chart values
// =============================================================================

/// Values for the HelmChart: operator defaults, then `spec.values`, then the
/// project keys the user cannot override.
///
/// `project_namespaces` is the target set plus the dedicated release
/// namespace, if there is one.
pub fn chart_values(
    opts: &OperatorOptions,
    chart: &ProjectHelmChart,
    project_id: &str,
    project_namespaces: &[String],
) -> ValuesMap {
    let defaults = values_map(json!({
        "global": {
            "cattle": {
                "systemDefaultRegistry": opts.system_default_registry.clone().unwrap_or_default(),
                "url": opts.cattle_url.clone().unwrap_or_default(),
            }
        }
    }));
    let required = values_map(json!({
        "global": {
            "cattle": {
                "clusterId": opts.cluster_id().unwrap_or_default(),
                "projectNamespaces": project_namespaces,
                "projectID": project_id,
                "systemProjectID": opts.mode().system_project_value().unwrap_or_default(),
                "projectNamespaceSelector": project_namespace_selector(opts, chart, project_id),
            }
        }
    }));

    let user = chart.spec.values.clone().unwrap_or_default();
    merge_maps(merge_maps(defaults, user), required)
}

/// Selector the chart can use to match every namespace of its project
pub fn project_namespace_selector(
    opts: &OperatorOptions,
    chart: &ProjectHelmChart,
    project_id: &str,
) -> Value {
    match opts.mode() {
        ProjectMode::Namespaced => match &chart.spec.project_namespace_selector {
            Some(selector) => json!({
                "matchLabels": selector.match_labels,
                "matchExpressions": selector.match_expressions,
            }),
            None => json!({}),
        },
        ProjectMode::ProjectLabel { label } => json!({
            "matchLabels": { label: project_id }
        }),
        // release namespaces sit in the system project but keep the mirrored id
        ProjectMode::SystemProject { .. } => json!({
            "matchLabels": { PROJECT_ID_LABEL: project_id }
        }),
    }
}

/// Render values as the HelmChart's `valuesContent`
pub fn to_values_yaml(values: &ValuesMap) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(values)
}

// =============================================================================
// Dashboard values
// =============================================================================

/// Merge the `.json` keys of the release's dashboard ConfigMaps.
///
/// ConfigMaps are read in name order and keys in key order. Keys that do not
/// hold a JSON object are logged and skipped. Returns None when nothing was
/// reported.
pub fn dashboard_values(config_maps: &[Arc<ConfigMap>]) -> Option<ValuesMap> {
    let mut sorted: Vec<&Arc<ConfigMap>> = config_maps.iter().collect();
    sorted.sort_by_key(|cm| cm.name_any());

    let mut values = ValuesMap::new();
    for config_map in sorted {
        let Some(data) = &config_map.data else {
            continue;
        };
        for (key, content) in data {
            if !key.ends_with(".json") {
                warn!(
                    configmap = %config_map.name_any(),
                    namespace = %config_map.namespace().unwrap_or_default(),
                    key = %key,
                    "dashboard values configmap has non-JSON key, skipping"
                );
                continue;
            }
            match serde_json::from_str::<ValuesMap>(content) {
                Ok(reported) => values = merge_maps_concat_slices(values, reported),
                Err(e) => warn!(
                    configmap = %config_map.name_any(),
                    namespace = %config_map.namespace().unwrap_or_default(),
                    key = %key,
                    error = %e,
                    "could not parse dashboard values, skipping"
                ),
            }
        }
    }
    (!values.is_empty()).then_some(values)
}
