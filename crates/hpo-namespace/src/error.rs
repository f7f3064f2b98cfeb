//! Namespace resolver error types

/// Errors from the namespace change handler
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Error from the shared operator plumbing (apply, serialization)
    #[error("{0}")]
    Common(#[from] hpo_common::Error),

    /// The startup replay over existing namespaces failed
    #[error("unable to initialize project registration namespaces (failed on {namespace}): {source}")]
    Replay {
        /// Namespace whose handler failed
        namespace: String,
        /// Underlying failure
        #[source]
        source: Box<NamespaceError>,
    },
}

impl NamespaceError {
    /// Wrap a handler failure hit during the startup replay
    pub fn replay(namespace: impl Into<String>, source: NamespaceError) -> Self {
        Self::Replay {
            namespace: namespace.into(),
            source: Box::new(source),
        }
    }
}
