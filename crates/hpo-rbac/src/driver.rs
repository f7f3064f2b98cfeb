//! Binding watch driver
//!
//! Feeds RoleBinding and ClusterRoleBinding events into the
//! [`SubjectRoleTracker`] and re-enqueues the namespaces whose registration
//! data depends on them.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use hpo_common::cache::WatchCache;
use hpo_common::enqueue::Enqueuer;
use hpo_common::options::OperatorOptions;
use hpo_common::roles::{filter_to_users_and_groups, DefaultRole};
use hpo_common::WATCH_TIMEOUT_SECS;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use kube::api::Api;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::tracker::{BindingKey, Grant, Scope, SubjectKey, SubjectRoleTracker, CLUSTER_SCOPE};

/// A permission binding the tracker understands
pub trait Binding: Resource<DynamicType = ()> + ResourceExt {
    /// Half of the index this binding kind populates
    const SCOPE: Scope;

    /// Namespace the grant applies to, [`CLUSTER_SCOPE`] for cluster bindings
    fn grant_namespace(&self) -> String;

    /// Tracker key of this binding
    fn binding_key(&self) -> BindingKey;

    /// Referenced role
    fn role_ref(&self) -> &RoleRef;

    /// Bound subjects
    fn subjects(&self) -> &[Subject];
}

impl Binding for RoleBinding {
    const SCOPE: Scope = Scope::Namespaced;

    fn grant_namespace(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    fn binding_key(&self) -> BindingKey {
        BindingKey::namespaced(&self.grant_namespace(), &self.name_any())
    }

    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }
}

impl Binding for ClusterRoleBinding {
    const SCOPE: Scope = Scope::Cluster;

    fn grant_namespace(&self) -> String {
        CLUSTER_SCOPE.to_string()
    }

    fn binding_key(&self) -> BindingKey {
        BindingKey::cluster(&self.name_any())
    }

    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }
}

/// Bindings buffered between `Init` and `InitDone` of a relist
type Relist = Option<Vec<(BindingKey, Vec<Grant>)>>;

/// Watches bindings and keeps the subject index current
pub struct BindingDriver {
    tracker: Arc<SubjectRoleTracker>,
    cache: Arc<dyn WatchCache>,
    namespaces: Enqueuer<Namespace>,
    cluster_roles: BTreeMap<String, DefaultRole>,
}

impl BindingDriver {
    /// Driver for the default-role slots configured in `opts`
    pub fn new(
        opts: &OperatorOptions,
        tracker: Arc<SubjectRoleTracker>,
        cache: Arc<dyn WatchCache>,
        namespaces: Enqueuer<Namespace>,
    ) -> Self {
        let cluster_roles = DefaultRole::ALL
            .into_iter()
            .filter_map(|role| opts.cluster_role_for(role).map(|name| (name.to_string(), role)))
            .collect();
        Self {
            tracker,
            cache,
            namespaces,
            cluster_roles,
        }
    }

    /// Watch RoleBindings and ClusterRoleBindings until both streams end
    pub async fn run(self: Arc<Self>, client: Client) {
        if self.cluster_roles.is_empty() {
            info!("no default cluster roles configured, binding driver idle");
            return;
        }
        info!(slots = self.cluster_roles.len(), "starting binding driver");
        tokio::join!(
            self.drive(Api::<RoleBinding>::all(client.clone())),
            self.drive(Api::<ClusterRoleBinding>::all(client)),
        );
    }

    async fn drive<K>(&self, api: Api<K>)
    where
        K: Binding + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    {
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let mut stream = watcher(api, config).default_backoff().boxed();
        let mut relist: Relist = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle(&mut relist, event),
                Err(e) => warn!(error = %e, kind = %K::kind(&()), "binding watch error"),
            }
        }
        debug!(kind = %K::kind(&()), "binding watch stream ended");
    }

    /// Apply one watch event to the tracker
    pub fn handle<K: Binding>(&self, relist: &mut Relist, event: Event<K>) {
        match event {
            Event::Init => {
                *relist = Some(Vec::new());
            }
            Event::InitApply(binding) => {
                if binding.meta().deletion_timestamp.is_some() {
                    return;
                }
                let entry = (binding.binding_key(), self.grants(&binding));
                if let Some(buffer) = relist.as_mut() {
                    buffer.push(entry);
                } else {
                    self.tracker.set_binding(entry.0, entry.1);
                }
            }
            Event::InitDone => {
                let bindings = relist.take().unwrap_or_default();
                debug!(kind = %K::kind(&()), bindings = bindings.len(), "binding relist complete");
                self.tracker.replace_scope(K::SCOPE, bindings);
                self.enqueue_all();
            }
            Event::Apply(binding) => {
                let changed = if binding.meta().deletion_timestamp.is_some() {
                    self.tracker.remove_binding(&binding.binding_key())
                } else {
                    self.tracker.set_binding(binding.binding_key(), self.grants(&binding))
                };
                self.enqueue_affected(&binding, changed);
            }
            Event::Delete(binding) => {
                let changed = self.tracker.remove_binding(&binding.binding_key());
                self.enqueue_affected(&binding, changed);
            }
        }
    }

    fn enqueue_affected<K: Binding>(&self, binding: &K, changed: bool) {
        if !changed {
            return;
        }
        match K::SCOPE {
            Scope::Namespaced => self.namespaces.enqueue(None, &binding.grant_namespace()),
            Scope::Cluster => self.enqueue_all(),
        }
    }

    /// Slot grants carried by a binding; empty when its role is not a default role
    fn grants<K: Binding>(&self, binding: &K) -> Vec<Grant> {
        let role_ref = binding.role_ref();
        if role_ref.kind != "ClusterRole" {
            return Vec::new();
        }
        let Some(role) = self.cluster_roles.get(&role_ref.name).copied() else {
            return Vec::new();
        };
        let namespace = binding.grant_namespace();
        filter_to_users_and_groups(binding.subjects())
            .iter()
            .map(|subject| Grant {
                subject: SubjectKey::from(subject),
                namespace: namespace.clone(),
                role,
            })
            .collect()
    }

    fn enqueue_all(&self) {
        for ns in self.cache.list_namespaces() {
            self.namespaces.enqueue(None, &ns.name_any());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::UnboundedReceiver;
    use hpo_common::cache::MemoryCache;
    use hpo_common::options::EmptyTargetSubjects;
    use hpo_common::roles::RBAC_API_GROUP;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use kube::runtime::reflector::ObjectRef;

    use crate::tracker::SubjectRoleGetter;

    fn opts() -> OperatorOptions {
        OperatorOptions {
            admin_cluster_role: Some("admin".to_string()),
            edit_cluster_role: Some("edit".to_string()),
            ..Default::default()
        }
    }

    fn subject(kind: &str, name: &str) -> Subject {
        Subject {
            api_group: (kind != "ServiceAccount").then(|| RBAC_API_GROUP.to_string()),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: (kind == "ServiceAccount").then(|| "default".to_string()),
        }
    }

    fn role_binding(ns: &str, name: &str, role: &str, subjects: Vec<Subject>) -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: role.to_string(),
            },
            subjects: Some(subjects),
        }
    }

    fn cluster_binding(name: &str, role: &str, subjects: Vec<Subject>) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: role.to_string(),
            },
            subjects: Some(subjects),
        }
    }

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Harness {
        driver: BindingDriver,
        tracker: Arc<SubjectRoleTracker>,
        rx: UnboundedReceiver<ObjectRef<Namespace>>,
    }

    fn harness(cache: MemoryCache) -> Harness {
        let tracker = Arc::new(SubjectRoleTracker::new(EmptyTargetSubjects::NoSubjects));
        let (enqueuer, rx) = Enqueuer::channel();
        let driver = BindingDriver::new(&opts(), tracker.clone(), Arc::new(cache), enqueuer);
        Harness {
            driver,
            tracker,
            rx,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ObjectRef<Namespace>>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(Some(r)) = rx.try_next() {
            names.push(r.name);
        }
        names
    }

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn role_binding_grants_users_and_groups_only() {
        let mut h = harness(MemoryCache::new());
        let rb = role_binding(
            "ns-a",
            "edit-binding",
            "edit",
            vec![
                subject("User", "alice"),
                subject("Group", "devs"),
                subject("ServiceAccount", "bot"),
            ],
        );
        h.driver.handle(&mut None, Event::Apply(rb));

        let subjects = h.tracker.get_subjects(&targets(&["ns-a"]), DefaultRole::Edit);
        let names: Vec<_> = subjects.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["devs", "alice"]);
        assert_eq!(drain(&mut h.rx), vec!["ns-a"]);
    }

    #[test]
    fn unrelated_role_refs_are_ignored() {
        let mut h = harness(MemoryCache::new());
        h.driver.handle(
            &mut None,
            Event::Apply(role_binding("ns-a", "b", "view", vec![subject("User", "alice")])),
        );
        let mut namespaced = role_binding("ns-a", "c", "edit", vec![subject("User", "bob")]);
        namespaced.role_ref.kind = "Role".to_string();
        h.driver.handle(&mut None, Event::Apply(namespaced));

        assert!(h.tracker.is_empty());
        assert!(drain(&mut h.rx).is_empty());
    }

    #[test]
    fn deleting_or_deleted_binding_clears_grant() {
        let h = harness(MemoryCache::new());
        let rb = role_binding("ns-a", "b", "admin", vec![subject("User", "alice")]);
        h.driver.handle(&mut None, Event::Apply(rb.clone()));
        assert_eq!(h.tracker.len(), 1);

        let mut terminating = rb.clone();
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        h.driver.handle(&mut None, Event::Apply(terminating));
        assert!(h.tracker.is_empty());

        h.driver.handle(&mut None, Event::Apply(rb.clone()));
        h.driver.handle(&mut None, Event::Delete(rb));
        assert!(h.tracker.is_empty());
    }

    #[test]
    fn subject_removed_from_binding_loses_slot() {
        let mut h = harness(MemoryCache::new());
        h.driver.handle(
            &mut None,
            Event::Apply(role_binding(
                "ns-a",
                "b",
                "edit",
                vec![subject("User", "alice"), subject("User", "bob")],
            )),
        );
        h.driver.handle(
            &mut None,
            Event::Apply(role_binding("ns-a", "b", "edit", vec![subject("User", "alice")])),
        );

        let subjects = h.tracker.get_subjects(&targets(&["ns-a"]), DefaultRole::Edit);
        let names: Vec<_> = subjects.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alice"]);
        assert_eq!(drain(&mut h.rx), vec!["ns-a", "ns-a"]);
    }

    #[test]
    fn role_ref_change_revokes_previous_slot() {
        let mut h = harness(MemoryCache::new());
        h.driver.handle(
            &mut None,
            Event::Apply(role_binding("ns-a", "b", "edit", vec![subject("User", "alice")])),
        );
        h.driver.handle(
            &mut None,
            Event::Apply(role_binding("ns-a", "b", "view", vec![subject("User", "alice")])),
        );

        assert!(h.tracker.is_empty());
        assert_eq!(drain(&mut h.rx), vec!["ns-a", "ns-a"]);
    }

    #[test]
    fn second_binding_still_grants_after_first_is_deleted() {
        let mut h = harness(MemoryCache::new());
        let b1 = role_binding("ns-a", "b1", "edit", vec![subject("User", "alice")]);
        let b2 = role_binding("ns-a", "b2", "edit", vec![subject("User", "alice")]);
        h.driver.handle(&mut None, Event::Apply(b1.clone()));
        h.driver.handle(&mut None, Event::Apply(b2));
        h.driver.handle(&mut None, Event::Delete(b1));

        let subjects = h.tracker.get_subjects(&targets(&["ns-a"]), DefaultRole::Edit);
        let names: Vec<_> = subjects.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alice"]);
        assert_eq!(drain(&mut h.rx), vec!["ns-a", "ns-a", "ns-a"]);
    }

    #[test]
    fn cluster_binding_enqueues_every_namespace() {
        let cache = MemoryCache::new();
        cache.put_namespace(namespace("ns-a"));
        cache.put_namespace(namespace("ns-b"));
        let mut h = harness(cache);

        h.driver.handle(
            &mut None,
            Event::Apply(cluster_binding("admins", "admin", vec![subject("User", "root")])),
        );

        let subjects = h.tracker.get_subjects(&targets(&["ns-a", "ns-b"]), DefaultRole::Admin);
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].name, "root");
        assert_eq!(drain(&mut h.rx), vec!["ns-a", "ns-b"]);
    }

    #[test]
    fn relist_replaces_stale_grants() {
        let h = harness(MemoryCache::new());
        h.driver.handle(
            &mut None,
            Event::Apply(role_binding("ns-a", "old", "edit", vec![subject("User", "stale")])),
        );

        let mut relist = None;
        h.driver.handle::<RoleBinding>(&mut relist, Event::Init);
        h.driver.handle(
            &mut relist,
            Event::InitApply(role_binding("ns-a", "new", "edit", vec![subject("User", "fresh")])),
        );
        // nothing changes until the relist completes
        assert_eq!(
            h.tracker.get_subjects(&targets(&["ns-a"]), DefaultRole::Edit)[0].name,
            "stale"
        );
        h.driver.handle::<RoleBinding>(&mut relist, Event::InitDone);

        let subjects = h.tracker.get_subjects(&targets(&["ns-a"]), DefaultRole::Edit);
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].name, "fresh");
        assert!(relist.is_none());
    }
}
