//! Namespace classification state
//!
//! Holds the explicit system namespaces, the registration namespaces this
//! instance has applied and the project each member namespace was last seen in. Shared between the resolver (writer) and every
//! [`ProjectGetter`](crate::ProjectGetter) handed out (readers).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hpo_common::options::OperatorOptions;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use parking_lot::RwLock;
use tracing::debug;

/// Registered system and registration namespaces
pub struct NamespaceRegistry {
    project_label: Option<String>,
    system_project_value: Option<String>,
    system: RwLock<BTreeSet<String>>,
    registration: RwLock<BTreeMap<String, Arc<Namespace>>>,
    /// Member namespace -> project id
    members: RwLock<BTreeMap<String, String>>,
}

impl NamespaceRegistry {
    /// Registry seeded with every configured system namespace
    pub fn new(opts: &OperatorOptions) -> Self {
        let mode = opts.mode();
        Self {
            project_label: mode.project_label().map(str::to_string),
            system_project_value: mode.system_project_value().map(str::to_string),
            system: RwLock::new(opts.all_system_namespaces().into_iter().collect()),
            registration: RwLock::new(BTreeMap::new()),
            members: RwLock::new(BTreeMap::new()),
        }
    }

    /// Track a registration namespace after it was applied
    pub fn register(&self, namespace: Namespace) {
        let name = namespace.name_any();
        debug!(namespace = %name, "registration namespace registered");
        self.registration.write().insert(name, Arc::new(namespace));
    }

    /// Stop tracking a registration namespace
    pub fn unregister(&self, name: &str) {
        if self.registration.write().remove(name).is_some() {
            debug!(namespace = %name, "registration namespace unregistered");
        }
    }

    /// Whether `name` is a tracked registration namespace
    pub fn is_registration(&self, name: &str) -> bool {
        self.registration.read().contains_key(name)
    }

    /// The registration namespace as last applied
    pub fn registration(&self, name: &str) -> Option<Arc<Namespace>> {
        self.registration.read().get(name).cloned()
    }

    /// Names of all tracked registration namespaces
    pub fn registration_names(&self) -> Vec<String> {
        self.registration.read().keys().cloned().collect()
    }

    /// Project a member namespace belonged to when last handled
    pub fn member_project(&self, name: &str) -> Option<String> {
        self.members.read().get(name).cloned()
    }

    /// Remember the project of a member namespace
    pub fn track_member(&self, name: &str, project_id: &str) {
        self.members
            .write()
            .insert(name.to_string(), project_id.to_string());
    }

    /// Forget a namespace that is no longer a project member
    pub fn forget_member(&self, name: &str) {
        self.members.write().remove(name);
    }

    /// Whether `name` is one of the explicit system namespaces
    pub fn is_explicit_system(&self, name: &str) -> bool {
        self.system.read().contains(name)
    }

    /// Explicit system namespace, or a namespace labelled into the system project
    pub fn is_system(&self, namespace: &Namespace) -> bool {
        if self.is_explicit_system(&namespace.name_any()) {
            return true;
        }
        match (&self.project_label, &self.system_project_value) {
            (Some(label), Some(value)) => namespace.labels().get(label) == Some(value),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn opts() -> OperatorOptions {
        OperatorOptions {
            system_namespaces: vec!["kube-system".to_string()],
            project_label: Some("field.cattle.io/projectId".to_string()),
            system_project_label_value: Some("p-system".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_and_labelled_system_namespaces() {
        let registry = NamespaceRegistry::new(&opts());
        assert!(registry.is_system(&namespace("kube-system", &[])));
        assert!(registry.is_system(&namespace("cattle-helm-system", &[])));
        assert!(registry.is_system(&namespace(
            "cattle-monitoring",
            &[("field.cattle.io/projectId", "p-system")]
        )));
        assert!(!registry.is_system(&namespace(
            "team-a",
            &[("field.cattle.io/projectId", "p-1")]
        )));
    }

    #[test]
    fn system_label_ignored_without_system_project() {
        let registry = NamespaceRegistry::new(&OperatorOptions {
            system_project_label_value: None,
            ..opts()
        });
        assert!(!registry.is_system(&namespace(
            "cattle-monitoring",
            &[("field.cattle.io/projectId", "p-system")]
        )));
    }

    #[test]
    fn register_and_unregister() {
        let registry = NamespaceRegistry::new(&opts());
        registry.register(namespace("cattle-project-p-1", &[]));
        assert!(registry.is_registration("cattle-project-p-1"));
        assert_eq!(registry.registration_names(), vec!["cattle-project-p-1"]);

        registry.unregister("cattle-project-p-1");
        assert!(!registry.is_registration("cattle-project-p-1"));
        assert!(registry.registration("cattle-project-p-1").is_none());
    }

    #[test]
    fn member_project_follows_last_tracked_value() {
        let registry = NamespaceRegistry::new(&opts());
        assert_eq!(registry.member_project("team-a"), None);

        registry.track_member("team-a", "p-1");
        registry.track_member("team-a", "p-2");
        assert_eq!(registry.member_project("team-a").as_deref(), Some("p-2"));

        registry.forget_member("team-a");
        assert_eq!(registry.member_project("team-a"), None);
    }
}
