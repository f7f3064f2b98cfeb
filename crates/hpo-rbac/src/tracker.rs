//! Subject/role index

use std::collections::BTreeMap;

use hpo_common::options::EmptyTargetSubjects;
use hpo_common::roles::DefaultRole;
use k8s_openapi::api::rbac::v1::Subject;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use parking_lot::RwLock;
use tracing::trace;

/// Namespace sentinel for cluster-scoped grants
pub const CLUSTER_SCOPE: &str = "";

/// Identity of a binding subject
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectKey {
    /// `User`, `Group` or `ServiceAccount`
    pub kind: String,
    /// Subject name
    pub name: String,
    /// API group (`rbac.authorization.k8s.io` for users and groups)
    pub api_group: Option<String>,
    /// Namespace (service accounts only)
    pub namespace: Option<String>,
}

impl From<&Subject> for SubjectKey {
    fn from(s: &Subject) -> Self {
        Self {
            kind: s.kind.clone(),
            name: s.name.clone(),
            api_group: s.api_group.clone(),
            namespace: s.namespace.clone(),
        }
    }
}

impl From<&SubjectKey> for Subject {
    fn from(k: &SubjectKey) -> Self {
        Subject {
            kind: k.kind.clone(),
            name: k.name.clone(),
            api_group: k.api_group.clone(),
            namespace: k.namespace.clone(),
        }
    }
}

/// Which half of the index a bulk replacement covers
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Grants from RoleBindings
    Namespaced,
    /// Grants from ClusterRoleBindings
    Cluster,
}

/// Identity of the binding a set of grants came from
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingKey {
    /// RoleBinding or ClusterRoleBinding
    pub scope: Scope,
    /// Binding namespace, [`CLUSTER_SCOPE`] for ClusterRoleBindings
    pub namespace: String,
    /// Binding name
    pub name: String,
}

impl BindingKey {
    /// Key of a RoleBinding
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            scope: Scope::Namespaced,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key of a ClusterRoleBinding
    pub fn cluster(name: &str) -> Self {
        Self {
            scope: Scope::Cluster,
            namespace: CLUSTER_SCOPE.to_string(),
            name: name.to_string(),
        }
    }
}

/// One active slot held by a subject in a namespace (or at cluster scope)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Grant {
    /// Subject holding the slot
    pub subject: SubjectKey,
    /// Namespace, or [`CLUSTER_SCOPE`]
    pub namespace: String,
    /// Slot held
    pub role: DefaultRole,
}

/// Read access to the subject index
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait SubjectRoleGetter: Send + Sync {
    /// Subjects holding `role` in every one of `target_namespaces`, or cluster-wide.
    ///
    /// Sorted by kind, name, API group and namespace.
    fn get_subjects(&self, target_namespaces: &[String], role: DefaultRole) -> Vec<Subject>;
}

/// Number of live bindings granting each slot
type RoleCounts = BTreeMap<DefaultRole, usize>;

#[derive(Default)]
struct Index {
    /// Grants contributed by each live binding
    bindings: BTreeMap<BindingKey, Vec<Grant>>,
    /// Subject -> namespace -> slot reference counts
    subjects: BTreeMap<SubjectKey, BTreeMap<String, RoleCounts>>,
}

impl Index {
    fn add(&mut self, grant: &Grant) {
        *self
            .subjects
            .entry(grant.subject.clone())
            .or_default()
            .entry(grant.namespace.clone())
            .or_default()
            .entry(grant.role)
            .or_default() += 1;
    }

    fn remove(&mut self, grant: &Grant) {
        let Some(namespaces) = self.subjects.get_mut(&grant.subject) else {
            return;
        };
        if let Some(roles) = namespaces.get_mut(&grant.namespace) {
            if let Some(count) = roles.get_mut(&grant.role) {
                *count -= 1;
                if *count == 0 {
                    roles.remove(&grant.role);
                }
            }
            if roles.is_empty() {
                namespaces.remove(&grant.namespace);
            }
        }
        if namespaces.is_empty() {
            self.subjects.remove(&grant.subject);
        }
    }

    /// Swap the grants of one binding; returns the grants it held before
    fn replace(&mut self, key: BindingKey, mut grants: Vec<Grant>) -> Vec<Grant> {
        grants.sort();
        grants.dedup();
        let previous = self.bindings.remove(&key).unwrap_or_default();
        for grant in &previous {
            self.remove(grant);
        }
        for grant in &grants {
            self.add(grant);
        }
        if !grants.is_empty() {
            self.bindings.insert(key, grants);
        }
        previous
    }
}

/// Index of default-role slots per subject and namespace.
///
/// Each binding's grants are kept separately and a slot is held while at
/// least one live binding grants it, so editing or deleting one binding
/// never affects grants coming from another.
pub struct SubjectRoleTracker {
    empty_targets: EmptyTargetSubjects,
    index: RwLock<Index>,
}

impl SubjectRoleTracker {
    /// Empty tracker using `empty_targets` for queries over zero namespaces
    pub fn new(empty_targets: EmptyTargetSubjects) -> Self {
        Self {
            empty_targets,
            index: RwLock::new(Index::default()),
        }
    }

    /// Record the current grants of a binding, replacing what it granted before.
    ///
    /// An empty list forgets the binding. Returns true when the binding
    /// granted anything before or grants anything now.
    pub fn set_binding(&self, key: BindingKey, grants: Vec<Grant>) -> bool {
        let granted = !grants.is_empty();
        trace!(binding = %key.name, namespace = %key.namespace, grants = grants.len(), "binding grants updated");
        let previous = self.index.write().replace(key, grants);
        granted || !previous.is_empty()
    }

    /// Forget a binding; returns true when it granted anything
    pub fn remove_binding(&self, key: &BindingKey) -> bool {
        self.set_binding(key.clone(), Vec::new())
    }

    /// Replace every binding in `scope` with `bindings`.
    ///
    /// Used after a watch relist so bindings deleted while the watch was
    /// down do not linger.
    pub fn replace_scope(&self, scope: Scope, bindings: Vec<(BindingKey, Vec<Grant>)>) {
        let mut index = self.index.write();
        let stale: Vec<BindingKey> = index
            .bindings
            .keys()
            .filter(|key| key.scope == scope)
            .cloned()
            .collect();
        for key in stale {
            index.replace(key, Vec::new());
        }
        for (key, grants) in bindings {
            if key.scope == scope {
                index.replace(key, grants);
            }
        }
    }

    /// Number of tracked subjects
    pub fn len(&self) -> usize {
        self.index.read().subjects.len()
    }

    /// True when no subject holds any slot
    pub fn is_empty(&self) -> bool {
        self.index.read().subjects.is_empty()
    }
}

impl SubjectRoleGetter for SubjectRoleTracker {
    fn get_subjects(&self, target_namespaces: &[String], role: DefaultRole) -> Vec<Subject> {
        if target_namespaces.is_empty() && self.empty_targets == EmptyTargetSubjects::NoSubjects {
            return Vec::new();
        }

        let index = self.index.read();
        index
            .subjects
            .iter()
            .filter(|(_, namespaces)| {
                let holds = |ns: &str| namespaces.get(ns).is_some_and(|roles| roles.contains_key(&role));
                let cluster_wide = holds(CLUSTER_SCOPE);
                let everywhere = !target_namespaces.is_empty()
                    && target_namespaces.iter().all(|ns| holds(ns));
                cluster_wide || everywhere
            })
            .map(|(key, _)| Subject::from(key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> Subject {
        Subject {
            api_group: Some("rbac.authorization.k8s.io".to_string()),
            kind: "User".to_string(),
            name: name.to_string(),
            namespace: None,
        }
    }

    fn grant(name: &str, namespace: &str, role: DefaultRole) -> Grant {
        Grant {
            subject: SubjectKey::from(&user(name)),
            namespace: namespace.to_string(),
            role,
        }
    }

    /// RoleBinding `binding` in `namespace` granting `role` to `users`
    fn bind(
        tracker: &SubjectRoleTracker,
        namespace: &str,
        binding: &str,
        role: DefaultRole,
        users: &[&str],
    ) -> bool {
        tracker.set_binding(
            BindingKey::namespaced(namespace, binding),
            users.iter().map(|u| grant(u, namespace, role)).collect(),
        )
    }

    fn names(subjects: Vec<Subject>) -> Vec<String> {
        subjects.into_iter().map(|s| s.name).collect()
    }

    fn ns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn subject_must_hold_role_in_every_target_namespace() {
        let tracker = SubjectRoleTracker::new(EmptyTargetSubjects::NoSubjects);
        bind(&tracker, "ns-a", "edit", DefaultRole::Edit, &["alice", "bob"]);
        bind(&tracker, "ns-b", "edit", DefaultRole::Edit, &["alice"]);
        bind(&tracker, "ns-b", "view", DefaultRole::View, &["carol"]);

        assert_eq!(
            names(tracker.get_subjects(&ns(&["ns-a", "ns-b"]), DefaultRole::Edit)),
            vec!["alice"]
        );
        assert_eq!(
            names(tracker.get_subjects(&ns(&["ns-a"]), DefaultRole::Edit)),
            vec!["alice", "bob"]
        );
    }

    #[test]
    fn cluster_scoped_grant_counts_everywhere() {
        let tracker = SubjectRoleTracker::new(EmptyTargetSubjects::NoSubjects);
        tracker.set_binding(
            BindingKey::cluster("admins"),
            vec![grant("admin", CLUSTER_SCOPE, DefaultRole::Admin)],
        );
        bind(&tracker, "ns-a", "admin", DefaultRole::Admin, &["alice"]);

        assert_eq!(
            names(tracker.get_subjects(&ns(&["ns-a", "ns-b"]), DefaultRole::Admin)),
            vec!["admin"]
        );
        assert!(tracker
            .get_subjects(&ns(&["ns-a"]), DefaultRole::View)
            .is_empty());
    }

    #[test]
    fn empty_targets_follow_policy() {
        let none = SubjectRoleTracker::new(EmptyTargetSubjects::NoSubjects);
        none.set_binding(
            BindingKey::cluster("admins"),
            vec![grant("admin", CLUSTER_SCOPE, DefaultRole::Admin)],
        );
        assert!(none.get_subjects(&[], DefaultRole::Admin).is_empty());

        let cluster = SubjectRoleTracker::new(EmptyTargetSubjects::ClusterScoped);
        cluster.set_binding(
            BindingKey::cluster("admins"),
            vec![grant("admin", CLUSTER_SCOPE, DefaultRole::Admin)],
        );
        bind(&cluster, "ns-a", "admin", DefaultRole::Admin, &["alice"]);
        assert_eq!(names(cluster.get_subjects(&[], DefaultRole::Admin)), vec!["admin"]);
    }

    #[test]
    fn subject_dropped_from_binding_loses_slot() {
        let tracker = SubjectRoleTracker::new(EmptyTargetSubjects::NoSubjects);
        bind(&tracker, "ns-a", "b", DefaultRole::Edit, &["alice", "bob"]);
        bind(&tracker, "ns-a", "b", DefaultRole::Edit, &["alice"]);

        assert_eq!(
            names(tracker.get_subjects(&ns(&["ns-a"]), DefaultRole::Edit)),
            vec!["alice"]
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn slot_survives_while_another_binding_grants_it() {
        let tracker = SubjectRoleTracker::new(EmptyTargetSubjects::NoSubjects);
        bind(&tracker, "ns-a", "b1", DefaultRole::Edit, &["alice"]);
        bind(&tracker, "ns-a", "b2", DefaultRole::Edit, &["alice"]);

        assert!(tracker.remove_binding(&BindingKey::namespaced("ns-a", "b1")));
        assert_eq!(
            names(tracker.get_subjects(&ns(&["ns-a"]), DefaultRole::Edit)),
            vec!["alice"]
        );

        assert!(tracker.remove_binding(&BindingKey::namespaced("ns-a", "b2")));
        assert!(tracker.get_subjects(&ns(&["ns-a"]), DefaultRole::Edit).is_empty());
    }

    #[test]
    fn forgetting_last_binding_garbage_collects_subject() {
        let tracker = SubjectRoleTracker::new(EmptyTargetSubjects::NoSubjects);
        bind(&tracker, "ns-a", "edit", DefaultRole::Edit, &["alice", "alice"]);
        bind(&tracker, "ns-a", "view", DefaultRole::View, &["alice"]);

        tracker.remove_binding(&BindingKey::namespaced("ns-a", "edit"));
        assert_eq!(tracker.len(), 1);
        tracker.remove_binding(&BindingKey::namespaced("ns-a", "view"));
        assert!(tracker.is_empty());

        // forgetting something never recorded changes nothing
        assert!(!tracker.remove_binding(&BindingKey::namespaced("ns-b", "admin")));
        assert!(tracker.is_empty());
    }

    #[test]
    fn replace_scope_only_touches_its_half() {
        let tracker = SubjectRoleTracker::new(EmptyTargetSubjects::NoSubjects);
        bind(&tracker, "ns-a", "old", DefaultRole::Edit, &["stale"]);
        tracker.set_binding(
            BindingKey::cluster("edits"),
            vec![grant("admin", CLUSTER_SCOPE, DefaultRole::Edit)],
        );

        tracker.replace_scope(
            Scope::Namespaced,
            vec![(
                BindingKey::namespaced("ns-a", "new"),
                vec![grant("fresh", "ns-a", DefaultRole::Edit)],
            )],
        );

        assert_eq!(
            names(tracker.get_subjects(&ns(&["ns-a"]), DefaultRole::Edit)),
            vec!["admin", "fresh"]
        );

        tracker.replace_scope(Scope::Cluster, Vec::new());
        assert_eq!(
            names(tracker.get_subjects(&ns(&["ns-a"]), DefaultRole::Edit)),
            vec!["fresh"]
        );
        assert_eq!(tracker.len(), 1);
    }
}
