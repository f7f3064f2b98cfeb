//! ProjectHelmChart reconciler error types

/// Errors from reconciling a ProjectHelmChart
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Error from the shared operator plumbing (apply, serialization)
    #[error("{0}")]
    Common(#[from] hpo_common::Error),

    /// Applying the chart's desired objects failed
    #[error("unable to apply objects for ProjectHelmChart {namespace}/{name}: {source}")]
    Apply {
        /// Chart namespace
        namespace: String,
        /// Chart name
        name: String,
        /// Underlying failure
        #[source]
        source: hpo_common::Error,
    },

    /// The startup removal of the cleanup label failed
    #[error("unable to remove cleanup label from ProjectHelmChart {namespace}/{name}: {source}")]
    CleanupLabel {
        /// Chart namespace
        namespace: String,
        /// Chart name
        name: String,
        /// Underlying failure
        #[source]
        source: hpo_common::Error,
    },
}

impl ProjectError {
    /// Wrap an apply failure with the chart it was applied for
    pub fn apply(namespace: impl Into<String>, name: impl Into<String>, source: hpo_common::Error) -> Self {
        Self::Apply {
            namespace: namespace.into(),
            name: name.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_error_names_chart() {
        let err = ProjectError::apply(
            "cattle-project-p-1",
            "project-monitoring",
            hpo_common::Error::apply("project-helm-chart-applier", "conflict"),
        );
        let msg = err.to_string();
        assert!(msg.contains("cattle-project-p-1/project-monitoring"));
        assert!(msg.contains("conflict"));
    }
}
