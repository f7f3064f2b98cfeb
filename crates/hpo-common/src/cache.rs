//! Read-side watch cache
//!
//! Handlers never list from the API server directly; they read from a
//! [`WatchCache`]. In the operator that is a [`StoreCache`] fed by kube
//! reflectors, in tests a [`MemoryCache`] filled by hand. Reads are
//! infallible and eventually consistent.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::api::rbac::v1::Role;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::crd::ProjectHelmChart;
use crate::labels::{DASHBOARD_VALUES_LABEL, ROLE_LABEL};
use crate::{Error, Result, WATCH_TIMEOUT_SECS};

/// Future driving one reflector; must be polled for the cache to fill
pub type CacheFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Eventually consistent reads over cluster objects.
///
/// The derived lookups are linear scans over the cached objects.
pub trait WatchCache: Send + Sync {
    /// Namespace by name
    fn get_namespace(&self, name: &str) -> Option<Arc<Namespace>>;

    /// All namespaces, sorted by name
    fn list_namespaces(&self) -> Vec<Arc<Namespace>>;

    /// All ProjectHelmCharts in the cluster
    fn list_project_helm_charts(&self) -> Vec<Arc<ProjectHelmChart>>;

    /// Dashboard values ConfigMaps in a namespace
    fn list_config_maps(&self, namespace: &str) -> Vec<Arc<ConfigMap>>;

    /// Chart-deployed Roles in a namespace
    fn list_roles(&self, namespace: &str) -> Vec<Arc<Role>>;

    /// Namespaces whose label `key` equals `value`, by scanning every namespace
    fn namespaces_with_label(&self, key: &str, value: &str) -> Vec<Arc<Namespace>> {
        self.list_namespaces()
            .into_iter()
            .filter(|ns| ns.labels().get(key).map(String::as_str) == Some(value))
            .collect()
    }

    /// ProjectHelmCharts in one namespace
    fn project_helm_charts_in(&self, namespace: &str) -> Vec<Arc<ProjectHelmChart>> {
        self.list_project_helm_charts()
            .into_iter()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .collect()
    }
}

/// Charts for which `projection` yields `key`, by scanning every cached chart
pub fn charts_matching_key<F>(cache: &dyn WatchCache, key: &str, projection: F) -> Vec<Arc<ProjectHelmChart>>
where
    F: Fn(&ProjectHelmChart) -> Vec<String>,
{
    cache
        .list_project_helm_charts()
        .into_iter()
        .filter(|chart| projection(chart).iter().any(|k| k == key))
        .collect()
}

// =============================================================================
// Reflector-backed cache
// =============================================================================

/// [`WatchCache`] backed by kube reflector stores
#[derive(Clone)]
pub struct StoreCache {
    namespaces: Store<Namespace>,
    charts: Store<ProjectHelmChart>,
    config_maps: Store<ConfigMap>,
    roles: Store<Role>,
}

impl StoreCache {
    /// Create the stores and the futures that feed them.
    ///
    /// ConfigMaps and Roles are only cached when they carry the dashboard
    /// or role label, which keeps memory bounded on large clusters.
    pub fn new(client: Client) -> (Self, Vec<CacheFuture>) {
        let (namespaces, ns_writer) = reflector::store::<Namespace>();
        let (charts, chart_writer) = reflector::store::<ProjectHelmChart>();
        let (config_maps, cm_writer) = reflector::store::<ConfigMap>();
        let (roles, role_writer) = reflector::store::<Role>();

        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let futures = vec![
            drive(
                Api::<Namespace>::all(client.clone()),
                config.clone(),
                ns_writer,
                "Namespace",
            ),
            drive(
                Api::<ProjectHelmChart>::all(client.clone()),
                config.clone(),
                chart_writer,
                "ProjectHelmChart",
            ),
            drive(
                Api::<ConfigMap>::all(client.clone()),
                config.clone().labels(DASHBOARD_VALUES_LABEL),
                cm_writer,
                "ConfigMap",
            ),
            drive(
                Api::<Role>::all(client),
                config.labels(ROLE_LABEL),
                role_writer,
                "Role",
            ),
        ];

        (
            Self {
                namespaces,
                charts,
                config_maps,
                roles,
            },
            futures,
        )
    }

    /// Wait until every store has completed its initial list
    pub async fn wait_until_ready(&self) -> Result<()> {
        let dropped = |e: reflector::store::WriterDropped| {
            Error::internal_with_context("watch cache", e.to_string())
        };
        self.namespaces.wait_until_ready().await.map_err(dropped)?;
        self.charts.wait_until_ready().await.map_err(dropped)?;
        self.config_maps.wait_until_ready().await.map_err(dropped)?;
        self.roles.wait_until_ready().await.map_err(dropped)?;
        debug!("watch cache synced");
        Ok(())
    }
}

fn drive<K>(api: Api<K>, config: watcher::Config, writer: reflector::store::Writer<K>, kind: &'static str) -> CacheFuture
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    Box::pin(
        reflector::reflector(writer, watcher::watcher(api, config))
            .default_backoff()
            .for_each(move |event| {
                if let Err(e) = event {
                    warn!(kind, error = %e, "watch cache stream error");
                }
                std::future::ready(())
            }),
    )
}

fn in_namespace<K: Resource>(objects: Vec<Arc<K>>, namespace: &str) -> Vec<Arc<K>> {
    objects
        .into_iter()
        .filter(|o| o.meta().namespace.as_deref() == Some(namespace))
        .collect()
}

fn sorted_by_name<K: Resource>(mut objects: Vec<Arc<K>>) -> Vec<Arc<K>> {
    objects.sort_by(|a, b| {
        (a.meta().namespace.as_deref(), a.meta().name.as_deref())
            .cmp(&(b.meta().namespace.as_deref(), b.meta().name.as_deref()))
    });
    objects
}

impl WatchCache for StoreCache {
    fn get_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.get(&ObjectRef::new(name))
    }

    fn list_namespaces(&self) -> Vec<Arc<Namespace>> {
        sorted_by_name(self.namespaces.state())
    }

    fn list_project_helm_charts(&self) -> Vec<Arc<ProjectHelmChart>> {
        sorted_by_name(self.charts.state())
    }

    fn list_config_maps(&self, namespace: &str) -> Vec<Arc<ConfigMap>> {
        sorted_by_name(in_namespace(self.config_maps.state(), namespace))
    }

    fn list_roles(&self, namespace: &str) -> Vec<Arc<Role>> {
        sorted_by_name(in_namespace(self.roles.state(), namespace))
    }
}

// =============================================================================
// In-memory cache
// =============================================================================

type Key = (String, String);

fn key_of<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

/// [`WatchCache`] over plain maps, for tests and tools
#[derive(Default)]
pub struct MemoryCache {
    namespaces: RwLock<BTreeMap<String, Arc<Namespace>>>,
    charts: RwLock<BTreeMap<Key, Arc<ProjectHelmChart>>>,
    config_maps: RwLock<BTreeMap<Key, Arc<ConfigMap>>>,
    roles: RwLock<BTreeMap<Key, Arc<Role>>>,
}

impl MemoryCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a namespace
    pub fn put_namespace(&self, ns: Namespace) {
        let name = ns.name_any();
        self.namespaces.write().insert(name, Arc::new(ns));
    }

    /// Remove a namespace
    pub fn remove_namespace(&self, name: &str) {
        self.namespaces.write().remove(name);
    }

    /// Insert or replace a ProjectHelmChart
    pub fn put_project_helm_chart(&self, chart: ProjectHelmChart) {
        self.charts.write().insert(key_of(&chart), Arc::new(chart));
    }

    /// Insert or replace a ConfigMap
    pub fn put_config_map(&self, cm: ConfigMap) {
        self.config_maps.write().insert(key_of(&cm), Arc::new(cm));
    }

    /// Insert or replace a Role
    pub fn put_role(&self, role: Role) {
        self.roles.write().insert(key_of(&role), Arc::new(role));
    }
}

impl WatchCache for MemoryCache {
    fn get_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().get(name).cloned()
    }

    fn list_namespaces(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.read().values().cloned().collect()
    }

    fn list_project_helm_charts(&self) -> Vec<Arc<ProjectHelmChart>> {
        self.charts.read().values().cloned().collect()
    }

    fn list_config_maps(&self, namespace: &str) -> Vec<Arc<ConfigMap>> {
        in_namespace(self.config_maps.read().values().cloned().collect(), namespace)
    }

    fn list_roles(&self, namespace: &str) -> Vec<Arc<Role>> {
        in_namespace(self.roles.read().values().cloned().collect(), namespace)
    }
}
