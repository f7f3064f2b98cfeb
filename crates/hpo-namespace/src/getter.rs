//! Project membership lookups
//!
//! A [`ProjectGetter`] answers the three questions the reconciler asks about
//! namespaces. Which strategy is used is fixed at startup by the operating
//! mode: with a project label, membership comes from the label value on the
//! chart's registration namespace; without one, from the chart's own
//! `spec.projectNamespaceSelector`.

use std::sync::Arc;

use hpo_common::cache::WatchCache;
use hpo_common::crd::ProjectHelmChart;
use hpo_common::labels::OPERATED_LABEL;
use hpo_common::options::OperatorOptions;
use hpo_common::selector::selector_matches;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use tracing::debug;

use crate::registry::NamespaceRegistry;

/// Namespace lookups for one operating mode
#[derive(Clone)]
pub enum ProjectGetter {
    /// Members share the project label value of the registration namespace
    LabelBased {
        /// Grouping label key
        project_label: String,
        /// Registration and system namespace state
        registry: Arc<NamespaceRegistry>,
        /// Namespace cache
        cache: Arc<dyn WatchCache>,
    },
    /// Members match the chart's namespace selector; charts live in one namespace
    Selector {
        /// The single registration namespace (the operator's own)
        registration_namespace: String,
        /// Registration and system namespace state
        registry: Arc<NamespaceRegistry>,
        /// Namespace cache
        cache: Arc<dyn WatchCache>,
    },
}

impl ProjectGetter {
    /// Strategy for the configured mode
    pub fn new(
        opts: &OperatorOptions,
        registry: Arc<NamespaceRegistry>,
        cache: Arc<dyn WatchCache>,
    ) -> Self {
        match opts.mode().project_label() {
            Some(label) => Self::LabelBased {
                project_label: label.to_string(),
                registry,
                cache,
            },
            None => Self::Selector {
                registration_namespace: opts.system_namespace.clone(),
                registry,
                cache,
            },
        }
    }

    /// Whether ProjectHelmCharts in `namespace` are handled by this instance
    pub fn is_project_registration_namespace(&self, namespace: &str) -> bool {
        match self {
            Self::LabelBased { registry, .. } => registry.is_registration(namespace),
            Self::Selector {
                registration_namespace,
                ..
            } => namespace == registration_namespace,
        }
    }

    /// Whether `namespace` is excluded from all project membership
    pub fn is_system_namespace(&self, namespace: &str) -> bool {
        match self {
            Self::LabelBased {
                registry, cache, ..
            } => match cache.get_namespace(namespace) {
                Some(ns) => registry.is_system(&ns),
                None => registry.is_explicit_system(namespace),
            },
            Self::Selector { registry, .. } => registry.is_explicit_system(namespace),
        }
    }

    /// Sorted, de-duplicated member namespaces a chart deploys to.
    ///
    /// An unknown registration namespace or a missing label is a soft miss
    /// and yields an empty list.
    pub fn target_project_namespaces(&self, chart: &ProjectHelmChart) -> Vec<String> {
        let chart_namespace = chart.namespace_or_default();
        let candidates: Vec<Arc<Namespace>> = match self {
            Self::LabelBased {
                project_label,
                registry,
                cache,
            } => {
                let registration = registry
                    .registration(&chart_namespace)
                    .or_else(|| cache.get_namespace(&chart_namespace));
                let Some(value) = registration
                    .as_ref()
                    .and_then(|ns| ns.labels().get(project_label).cloned())
                else {
                    debug!(
                        namespace = %chart_namespace,
                        label = %project_label,
                        "registration namespace has no project label"
                    );
                    return Vec::new();
                };
                cache
                    .namespaces_with_label(project_label, &value)
                    .into_iter()
                    .filter(|ns| !is_operated(ns))
                    .collect()
            }
            Self::Selector { cache, .. } => {
                let selector = chart.spec.project_namespace_selector.as_ref();
                cache
                    .list_namespaces()
                    .into_iter()
                    .filter(|ns| selector_matches(selector, ns.labels()))
                    .collect()
            }
        };

        let mut names: Vec<String> = candidates
            .iter()
            .map(|ns| ns.name_any())
            .filter(|name| !self.is_project_registration_namespace(name))
            .filter(|name| !self.is_system_namespace(name))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Registration and release namespaces are never members
pub(crate) fn is_operated(namespace: &Namespace) -> bool {
    namespace.labels().get(OPERATED_LABEL).map(String::as_str) == Some("true")
}
