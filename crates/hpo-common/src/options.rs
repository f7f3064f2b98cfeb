//! Operator configuration
//!
//! The binary parses flags into [`OperatorOptions`]; everything downstream
//! reads the validated struct and derives its operating mode from it.

use tracing::info;

use crate::roles::DefaultRole;
use crate::{Error, Result, DEFAULT_CONTROLLER_NAME, DEFAULT_JOB_IMAGE, DEFAULT_SYSTEM_NAMESPACE};

// =============================================================================
// Empty target policy
// =============================================================================

/// What the subject tracker returns when asked about zero target namespaces
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmptyTargetSubjects {
    /// No subjects at all
    #[default]
    NoSubjects,
    /// Only the subjects holding the slot cluster-wide
    ClusterScoped,
}

impl std::str::FromStr for EmptyTargetSubjects {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::NoSubjects),
            "cluster-scoped" => Ok(Self::ClusterScoped),
            other => Err(Error::config(format!(
                "unknown empty target subjects policy '{}', expected 'none' or 'cluster-scoped'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EmptyTargetSubjects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSubjects => write!(f, "none"),
            Self::ClusterScoped => write!(f, "cluster-scoped"),
        }
    }
}

// =============================================================================
// Mode
// =============================================================================

/// How namespaces are grouped into projects
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProjectMode {
    /// No project label: charts live in the system namespace and select namespaces themselves
    Namespaced,
    /// Namespaces are grouped by the value of `label`
    ProjectLabel {
        /// Grouping label key
        label: String,
    },
    /// Grouped by `label`; namespaces with `label=system_value` form the system project
    /// and every release gets a dedicated namespace inside it
    SystemProject {
        /// Grouping label key
        label: String,
        /// Project id of the system project
        system_value: String,
    },
}

impl ProjectMode {
    /// The grouping label, if any
    pub fn project_label(&self) -> Option<&str> {
        match self {
            Self::Namespaced => None,
            Self::ProjectLabel { label } | Self::SystemProject { label, .. } => Some(label),
        }
    }

    /// The system project id, if configured
    pub fn system_project_value(&self) -> Option<&str> {
        match self {
            Self::SystemProject { system_value, .. } => Some(system_value),
            _ => None,
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Validated operator configuration
#[derive(Clone, Debug)]
pub struct OperatorOptions {
    /// Namespace the operator runs in; holds HelmCharts and HelmReleases
    pub system_namespace: String,
    /// Release name suffix of the embedded chart
    pub release_name: String,
    /// `spec.helmApiVersion` this instance answers to
    pub helm_api_version: String,
    /// Base64 encoded chart archive
    pub chart_content: String,
    /// Additional namespaces never treated as project members
    pub system_namespaces: Vec<String>,
    /// Grouping label key
    pub project_label: Option<String>,
    /// Project id of the system project
    pub system_project_label_value: Option<String>,
    /// Cluster id prefixed onto project annotations and injected into values
    pub cluster_id: Option<String>,
    /// Cluster role backing the `admin` slot
    pub admin_cluster_role: Option<String>,
    /// Cluster role backing the `edit` slot
    pub edit_cluster_role: Option<String>,
    /// Cluster role backing the `view` slot
    pub view_cluster_role: Option<String>,
    /// Only one release per registration namespace
    pub singleton: bool,
    /// Override for the helm job image
    pub helm_job_image: Option<String>,
    /// Injected as `global.cattle.systemDefaultRegistry`
    pub system_default_registry: Option<String>,
    /// Injected as `global.cattle.url`
    pub cattle_url: Option<String>,
    /// Node the operator runs on
    pub node_name: Option<String>,
    /// Field manager and lease prefix
    pub controller_name: String,
    /// Subject tracker behavior for an empty target set
    pub empty_target_subjects: EmptyTargetSubjects,
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            release_name: String::new(),
            helm_api_version: String::new(),
            chart_content: String::new(),
            system_namespaces: Vec::new(),
            project_label: None,
            system_project_label_value: None,
            cluster_id: None,
            admin_cluster_role: None,
            edit_cluster_role: None,
            view_cluster_role: None,
            singleton: false,
            helm_job_image: None,
            system_default_registry: None,
            cattle_url: None,
            node_name: None,
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            empty_target_subjects: EmptyTargetSubjects::default(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl OperatorOptions {
    /// Check required settings and log the operating mode.
    ///
    /// Called once at startup; an error here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.release_name.is_empty() {
            return Err(Error::config("must provide a release name"));
        }
        if self.helm_api_version.is_empty() {
            return Err(Error::config(
                "must provide a spec.helmApiVersion that this operator is being initialized for",
            ));
        }
        if self.chart_content.is_empty() {
            return Err(Error::config(format!(
                "must provide a base64-encoded chart for ProjectHelmCharts with spec.helmApiVersion={}",
                self.helm_api_version
            )));
        }
        if self.system_namespace.is_empty() {
            return Err(Error::config("must provide a system namespace"));
        }
        if self.system_project_label_value.is_some() && self.project_label.is_none() {
            return Err(Error::config(
                "a system project label value requires a project label",
            ));
        }

        if !self.system_namespaces.is_empty() {
            info!(namespaces = ?self.system_namespaces, "marking namespaces as system namespaces");
        }

        match self.mode() {
            ProjectMode::Namespaced => {
                info!(
                    system_namespace = %self.system_namespace,
                    "no project label provided; releases deploy into the system namespace"
                );
            }
            ProjectMode::ProjectLabel { label } => {
                info!(
                    project_label = %label,
                    "creating project registration namespaces from the project label; these must be cleaned up manually"
                );
            }
            ProjectMode::SystemProject {
                label,
                system_value,
            } => {
                info!(
                    project_label = %label,
                    "creating project registration namespaces from the project label; these must be cleaned up manually"
                );
                info!(
                    project_label = %label,
                    system_project = %system_value,
                    "namespaces in the system project are system namespaces; dedicated release namespaces join it"
                );
            }
        }

        if let Some(cluster_id) = non_empty(&self.cluster_id) {
            info!(
                cluster_id,
                "project namespaces will be annotated with <clusterID>:<projectID>"
            );
        }
        if let Some(image) = non_empty(&self.helm_job_image) {
            info!(image, "using custom helm job image");
        }
        if let Some(node) = non_empty(&self.node_name) {
            info!(node, "operator running on node");
        }
        Ok(())
    }

    /// Operating mode derived from the project label settings
    pub fn mode(&self) -> ProjectMode {
        match (non_empty(&self.project_label), non_empty(&self.system_project_label_value)) {
            (None, _) => ProjectMode::Namespaced,
            (Some(label), None) => ProjectMode::ProjectLabel {
                label: label.to_string(),
            },
            (Some(label), Some(system_value)) => ProjectMode::SystemProject {
                label: label.to_string(),
                system_value: system_value.to_string(),
            },
        }
    }

    /// Explicit system namespaces, always including the operator's own
    pub fn all_system_namespaces(&self) -> Vec<String> {
        let mut namespaces = self.system_namespaces.clone();
        if !namespaces.contains(&self.system_namespace) {
            namespaces.push(self.system_namespace.clone());
        }
        namespaces
    }

    /// Helm job image, falling back to the default
    pub fn job_image(&self) -> &str {
        non_empty(&self.helm_job_image).unwrap_or(DEFAULT_JOB_IMAGE)
    }

    /// Configured cluster id, if non-empty
    pub fn cluster_id(&self) -> Option<&str> {
        non_empty(&self.cluster_id)
    }

    /// Cluster role name for a default-role slot, if configured
    pub fn cluster_role_for(&self, role: DefaultRole) -> Option<&str> {
        let value = match role {
            DefaultRole::Admin => &self.admin_cluster_role,
            DefaultRole::Edit => &self.edit_cluster_role,
            DefaultRole::View => &self.view_cluster_role,
        };
        non_empty(value)
    }

    /// Name of the leader election lease
    pub fn lease_name(&self) -> String {
        format!("{}-{}-lock", self.controller_name, self.release_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> OperatorOptions {
        OperatorOptions {
            release_name: "dummy".to_string(),
            helm_api_version: "dummy.cattle.io/v1alpha1".to_string(),
            chart_content: "H4sI".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_requires_release_name_version_and_chart() {
        assert!(valid().validate().is_ok());

        let opts = OperatorOptions {
            release_name: String::new(),
            ..valid()
        };
        assert!(opts.validate().is_err());

        let opts = OperatorOptions {
            helm_api_version: String::new(),
            ..valid()
        };
        assert!(opts.validate().is_err());

        let opts = OperatorOptions {
            chart_content: String::new(),
            ..valid()
        };
        assert!(opts.validate().is_err());

        let opts = OperatorOptions {
            system_namespace: String::new(),
            ..valid()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn system_project_value_without_label_is_rejected() {
        let opts = OperatorOptions {
            system_project_label_value: Some("p-system".to_string()),
            ..valid()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn mode_follows_project_label_settings() {
        assert_eq!(valid().mode(), ProjectMode::Namespaced);

        let opts = OperatorOptions {
            project_label: Some("field.cattle.io/projectId".to_string()),
            ..valid()
        };
        assert_eq!(
            opts.mode(),
            ProjectMode::ProjectLabel {
                label: "field.cattle.io/projectId".to_string()
            }
        );

        let opts = OperatorOptions {
            project_label: Some("field.cattle.io/projectId".to_string()),
            system_project_label_value: Some("p-system".to_string()),
            ..valid()
        };
        assert_eq!(opts.mode().system_project_value(), Some("p-system"));
        assert_eq!(opts.mode().project_label(), Some("field.cattle.io/projectId"));

        // empty strings count as unset
        let opts = OperatorOptions {
            project_label: Some(String::new()),
            ..valid()
        };
        assert_eq!(opts.mode(), ProjectMode::Namespaced);
    }

    #[test]
    fn system_namespace_always_listed() {
        let opts = OperatorOptions {
            system_namespaces: vec!["kube-system".to_string()],
            ..valid()
        };
        assert_eq!(
            opts.all_system_namespaces(),
            vec!["kube-system".to_string(), "cattle-helm-system".to_string()]
        );
    }

    #[test]
    fn defaults() {
        let opts = valid();
        assert_eq!(opts.job_image(), DEFAULT_JOB_IMAGE);
        assert_eq!(opts.lease_name(), "helm-project-operator-dummy-lock");
        assert_eq!(opts.empty_target_subjects, EmptyTargetSubjects::NoSubjects);
        assert_eq!(opts.cluster_role_for(DefaultRole::Admin), None);
    }

    #[test]
    fn empty_target_policy_parses() {
        assert_eq!(
            "cluster-scoped".parse::<EmptyTargetSubjects>().unwrap(),
            EmptyTargetSubjects::ClusterScoped
        );
        assert_eq!(
            "none".parse::<EmptyTargetSubjects>().unwrap(),
            EmptyTargetSubjects::NoSubjects
        );
        assert!("all".parse::<EmptyTargetSubjects>().is_err());
    }
}
