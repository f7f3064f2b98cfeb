//! Release addressing
//!
//! Every place that needs to know where a chart's helm release lives (status,
//! object naming, the release-name index, removal handling, the namespace
//! resolver) goes through [`ReleaseAddressing::resolve`].

use crate::crd::ProjectHelmChart;
use crate::options::{OperatorOptions, ProjectMode};
use crate::MAX_NAMESPACE_NAME_LEN;

/// Namespace and name of a helm release
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseAddress {
    /// Namespace the release is installed into
    pub namespace: String,
    /// Release name
    pub name: String,
}

impl std::fmt::Display for ReleaseAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Maps a chart identity to its release address for the configured mode
#[derive(Clone, Debug)]
pub struct ReleaseAddressing {
    mode: ProjectMode,
    singleton: bool,
    system_namespace: String,
    release_name: String,
}

impl ReleaseAddressing {
    /// Build from validated options
    pub fn new(opts: &OperatorOptions) -> Self {
        Self {
            mode: opts.mode(),
            singleton: opts.singleton,
            system_namespace: opts.system_namespace.clone(),
            release_name: opts.release_name.clone(),
        }
    }

    /// Release address for the chart `chart_namespace/chart_name`
    pub fn resolve(&self, chart_namespace: &str, chart_name: &str) -> ReleaseAddress {
        let prefix = if self.singleton {
            chart_namespace
        } else {
            chart_name
        };
        let name = format!("{}-{}", prefix, self.release_name);
        let namespace = match self.mode {
            ProjectMode::Namespaced => self.system_namespace.clone(),
            ProjectMode::ProjectLabel { .. } => chart_namespace.to_string(),
            ProjectMode::SystemProject { .. } => name.clone(),
        };
        ReleaseAddress { namespace, name }
    }

    /// Release address of a chart object
    pub fn for_chart(&self, chart: &ProjectHelmChart) -> ReleaseAddress {
        self.resolve(
            &chart.namespace_or_default(),
            chart.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    /// The dedicated release namespace of a chart, if the mode creates one
    pub fn dedicated_namespace(&self, chart_namespace: &str, chart_name: &str) -> Option<String> {
        let address = self.resolve(chart_namespace, chart_name);
        (address.namespace != self.system_namespace && address.namespace != chart_namespace)
            .then_some(address.namespace)
    }

    /// Release namespace shared by every chart in a registration namespace.
    ///
    /// Only singleton system-project mode has one; it depends on nothing but
    /// the registration namespace name, so the namespace resolver can create
    /// it before any chart exists.
    pub fn singleton_release_namespace(&self, registration_namespace: &str) -> Option<String> {
        if !self.singleton || self.mode.system_project_value().is_none() {
            return None;
        }
        self.dedicated_namespace(registration_namespace, "")
    }

    /// Release namespace owned by the chart's own apply set.
    ///
    /// The singleton namespace is shared by every chart of a registration
    /// namespace and belongs to the namespace resolver instead.
    pub fn chart_release_namespace(&self, chart_namespace: &str, chart_name: &str) -> Option<String> {
        if self.singleton {
            return None;
        }
        self.dedicated_namespace(chart_namespace, chart_name)
    }

    /// True when a namespace name fits the Kubernetes limit
    pub fn is_valid_namespace_name(name: &str) -> bool {
        name.len() <= MAX_NAMESPACE_NAME_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addressing(project_label: bool, system_project: bool, singleton: bool) -> ReleaseAddressing {
        ReleaseAddressing::new(&OperatorOptions {
            release_name: "monitoring".to_string(),
            project_label: project_label.then(|| "field.cattle.io/projectId".to_string()),
            system_project_label_value: system_project.then(|| "p-system".to_string()),
            singleton,
            ..Default::default()
        })
    }

    fn address(namespace: &str, name: &str) -> ReleaseAddress {
        ReleaseAddress {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn no_project_label_uses_system_namespace() {
        let a = addressing(false, false, false);
        assert_eq!(
            a.resolve("cattle-helm-system", "project"),
            address("cattle-helm-system", "project-monitoring")
        );
        assert_eq!(a.dedicated_namespace("cattle-helm-system", "project"), None);

        let a = addressing(false, false, true);
        assert_eq!(
            a.resolve("cattle-helm-system", "project"),
            address("cattle-helm-system", "cattle-helm-system-monitoring")
        );
    }

    #[test]
    fn project_label_only_uses_registration_namespace() {
        let a = addressing(true, false, false);
        assert_eq!(
            a.resolve("cattle-project-p1", "project"),
            address("cattle-project-p1", "project-monitoring")
        );
        assert_eq!(a.dedicated_namespace("cattle-project-p1", "project"), None);
        assert_eq!(a.singleton_release_namespace("cattle-project-p1"), None);
    }

    #[test]
    fn system_project_gets_dedicated_namespace() {
        let a = addressing(true, true, false);
        assert_eq!(
            a.resolve("cattle-project-p1", "project"),
            address("project-monitoring", "project-monitoring")
        );
        assert_eq!(
            a.dedicated_namespace("cattle-project-p1", "project").as_deref(),
            Some("project-monitoring")
        );
        assert_eq!(a.singleton_release_namespace("cattle-project-p1"), None);
    }

    #[test]
    fn singleton_system_project_depends_only_on_registration_namespace() {
        let a = addressing(true, true, true);
        let expected = address("cattle-project-p1-monitoring", "cattle-project-p1-monitoring");
        assert_eq!(a.resolve("cattle-project-p1", "one"), expected);
        assert_eq!(a.resolve("cattle-project-p1", "two"), expected);
        assert_eq!(
            a.singleton_release_namespace("cattle-project-p1").as_deref(),
            Some("cattle-project-p1-monitoring")
        );
    }

    #[test]
    fn only_per_chart_release_namespaces_belong_to_the_chart() {
        let per_chart = addressing(true, true, false);
        assert_eq!(
            per_chart.chart_release_namespace("cattle-project-p1", "project").as_deref(),
            Some("project-monitoring")
        );

        let singleton = addressing(true, true, true);
        assert!(singleton.dedicated_namespace("cattle-project-p1", "one").is_some());
        assert_eq!(singleton.chart_release_namespace("cattle-project-p1", "one"), None);

        let project_label = addressing(true, false, false);
        assert_eq!(project_label.chart_release_namespace("cattle-project-p1", "project"), None);
    }

    #[test]
    fn resolve_is_referentially_transparent() {
        let a = addressing(true, true, false);
        assert_eq!(a.resolve("ns", "c"), a.resolve("ns", "c"));
    }

    #[test]
    fn namespace_name_length_limit() {
        assert!(ReleaseAddressing::is_valid_namespace_name(&"a".repeat(63)));
        assert!(!ReleaseAddressing::is_valid_namespace_name(&"a".repeat(64)));
    }
}
