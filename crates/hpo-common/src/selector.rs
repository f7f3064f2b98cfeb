//! Label selector evaluation against cached labels

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// Evaluate `selector` against `labels`.
///
/// A missing selector matches nothing and an empty one matches everything,
/// mirroring how Kubernetes treats `namespaceSelector` fields. An unknown
/// operator never matches.
pub fn selector_matches(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = selector else {
        return false;
    };

    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    labels_match
        && selector
            .match_expressions
            .iter()
            .flatten()
            .all(|expr| requirement_matches(expr, labels))
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    let current = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => current.is_some_and(|v| values.contains(v)),
        "NotIn" => !current.is_some_and(|v| values.contains(v)),
        "Exists" => current.is_some(),
        "DoesNotExist" => current.is_none(),
        _ => false,
    }
}
