//! Error types for the helm project operator

use thiserror::Error;

/// Default value for error context when not specified
const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for shared operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube error
        #[from]
        source: kube::Error,
    },

    /// Operator configuration is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Description of the invalid setting
        message: String,
    },

    /// Serialization error with optional kind context
    #[error("serialization error{}: {message}", kind.as_ref().map(|k| format!(" for {}", k)).unwrap_or_default())]
    Serialization {
        /// Description of the serialization error
        message: String,
        /// Resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The embedded chart archive could not be read
    #[error("chart content error: {message}")]
    ChartContent {
        /// Description of what is wrong with the archive
        message: String,
    },

    /// Applying or pruning an object set failed
    #[error("apply error for set {set_id}: {message}")]
    Apply {
        /// Apply set identifier
        set_id: String,
        /// Description of the failure
        message: String,
    },

    /// Internal error with context
    #[error("internal error{}: {message}", if context == UNKNOWN_CONTEXT { String::new() } else { format!(" in {}", context) })]
    Internal {
        /// Description of the internal error
        message: String,
        /// Where the error happened
        context: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a chart content error
    pub fn chart_content(msg: impl Into<String>) -> Self {
        Self::ChartContent {
            message: msg.into(),
        }
    }

    /// Create an apply error for the given set
    pub fn apply(set_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apply {
            set_id: set_id.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, serialization and chart content errors need an operator
    /// redeploy or a spec change; retrying them changes nothing.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
            Error::ChartContent { .. } => false,
            Error::Apply { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Returns true if this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
