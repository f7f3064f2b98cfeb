//! Resource applier
//!
//! Handlers compute a complete list of desired objects for an apply set and
//! hand it to a [`ResourceApplier`]. The applier creates or updates every
//! listed object with server-side apply and deletes objects it previously
//! applied under the same set that are no longer listed. Namespaces are
//! never deleted.
//!
//! Objects are tagged with the `objectset.rio.cattle.io` label and
//! annotations, so objects written by earlier operator versions are
//! recognised and the owner of a cross-namespace child can be recovered
//! from its metadata.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{HelmChart, HelmRelease};
use crate::{Error, Result};

/// Hash of the apply set identity, used to find previously applied objects
pub const HASH_LABEL: &str = "objectset.rio.cattle.io/hash";

/// Apply set id
pub const SET_ID_ANNOTATION: &str = "objectset.rio.cattle.io/id";

/// `<apiVersion>, Kind=<kind>` of the set owner
pub const OWNER_GVK_ANNOTATION: &str = "objectset.rio.cattle.io/owner-gvk";

/// Namespace of the set owner
pub const OWNER_NAMESPACE_ANNOTATION: &str = "objectset.rio.cattle.io/owner-namespace";

/// Name of the set owner
pub const OWNER_NAME_ANNOTATION: &str = "objectset.rio.cattle.io/owner-name";

// =============================================================================
// Desired objects
// =============================================================================

/// Kinds the operator emits
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    /// core/v1 Namespace
    Namespace,
    /// helm.cattle.io/v1 HelmChart
    HelmChart,
    /// helm.cattle.io/v1alpha1 HelmRelease
    HelmRelease,
    /// rbac/v1 RoleBinding
    RoleBinding,
    /// rbac/v1 Role
    Role,
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 ServiceAccount
    ServiceAccount,
    /// networking/v1 NetworkPolicy
    NetworkPolicy,
}

impl ObjectKind {
    /// Erased API resource for dynamic calls
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Namespace => ApiResource::erase::<Namespace>(&()),
            Self::HelmChart => ApiResource::erase::<HelmChart>(&()),
            Self::HelmRelease => ApiResource::erase::<HelmRelease>(&()),
            Self::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            Self::Role => ApiResource::erase::<Role>(&()),
            Self::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            Self::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            Self::NetworkPolicy => ApiResource::erase::<NetworkPolicy>(&()),
        }
    }

    /// Kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::HelmChart => "HelmChart",
            Self::HelmRelease => "HelmRelease",
            Self::RoleBinding => "RoleBinding",
            Self::Role => "Role",
            Self::ConfigMap => "ConfigMap",
            Self::ServiceAccount => "ServiceAccount",
            Self::NetworkPolicy => "NetworkPolicy",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object a handler wants to exist
#[derive(Clone, Debug, PartialEq)]
pub enum DesiredObject {
    /// Namespace
    Namespace(Namespace),
    /// HelmChart
    HelmChart(HelmChart),
    /// HelmRelease
    HelmRelease(HelmRelease),
    /// RoleBinding
    RoleBinding(RoleBinding),
    /// Role
    Role(Role),
    /// ConfigMap
    ConfigMap(ConfigMap),
    /// ServiceAccount
    ServiceAccount(ServiceAccount),
    /// NetworkPolicy
    NetworkPolicy(NetworkPolicy),
}

impl DesiredObject {
    /// Kind of the object
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Namespace(_) => ObjectKind::Namespace,
            Self::HelmChart(_) => ObjectKind::HelmChart,
            Self::HelmRelease(_) => ObjectKind::HelmRelease,
            Self::RoleBinding(_) => ObjectKind::RoleBinding,
            Self::Role(_) => ObjectKind::Role,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
            Self::ServiceAccount(_) => ObjectKind::ServiceAccount,
            Self::NetworkPolicy(_) => ObjectKind::NetworkPolicy,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Namespace(o) => o.meta(),
            Self::HelmChart(o) => o.meta(),
            Self::HelmRelease(o) => o.meta(),
            Self::RoleBinding(o) => o.meta(),
            Self::Role(o) => o.meta(),
            Self::ConfigMap(o) => o.meta(),
            Self::ServiceAccount(o) => o.meta(),
            Self::NetworkPolicy(o) => o.meta(),
        }
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Namespace(o) => o.meta_mut(),
            Self::HelmChart(o) => o.meta_mut(),
            Self::HelmRelease(o) => o.meta_mut(),
            Self::RoleBinding(o) => o.meta_mut(),
            Self::Role(o) => o.meta_mut(),
            Self::ConfigMap(o) => o.meta_mut(),
            Self::ServiceAccount(o) => o.meta_mut(),
            Self::NetworkPolicy(o) => o.meta_mut(),
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace (None for cluster-scoped objects)
    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    /// Labels, empty if unset
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    /// Serialize with `apiVersion` and `kind` set from the API resource
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let kind = self.kind();
        let mut value = match self {
            Self::Namespace(o) => serde_json::to_value(o),
            Self::HelmChart(o) => serde_json::to_value(o),
            Self::HelmRelease(o) => serde_json::to_value(o),
            Self::RoleBinding(o) => serde_json::to_value(o),
            Self::Role(o) => serde_json::to_value(o),
            Self::ConfigMap(o) => serde_json::to_value(o),
            Self::ServiceAccount(o) => serde_json::to_value(o),
            Self::NetworkPolicy(o) => serde_json::to_value(o),
        }
        .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?;

        let ar = kind.api_resource();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("apiVersion".to_string(), json!(ar.api_version));
            obj.insert("kind".to_string(), json!(ar.kind));
        }
        Ok(value)
    }
}

// =============================================================================
// Apply sets
// =============================================================================

/// Logical owner of an apply set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOwner {
    /// Owner apiVersion
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner namespace (None for cluster-scoped owners)
    pub namespace: Option<String>,
    /// Owner name
    pub name: String,
    /// Owner uid; when known an ownerReference is added to children in the owner's namespace
    pub uid: Option<String>,
}

impl ApplyOwner {
    /// Owner descriptor for a typed resource
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
            uid: obj.meta().uid.clone(),
        }
    }

    /// Value of the owner-gvk annotation
    pub fn gvk(&self) -> String {
        format!("{}, Kind={}", self.api_version, self.kind)
    }
}

/// Identity of a group of objects applied and pruned together
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplySet {
    /// Set id
    pub id: String,
    /// Owner of the set
    pub owner: Option<ApplyOwner>,
    /// Kinds pruned when no longer desired
    pub prune: Vec<ObjectKind>,
}

impl ApplySet {
    /// New set with no owner and nothing to prune
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: None,
            prune: Vec::new(),
        }
    }

    /// Set the owner
    pub fn with_owner(mut self, owner: ApplyOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Kinds to prune; namespaces are ignored
    pub fn with_prune(mut self, kinds: &[ObjectKind]) -> Self {
        self.prune = kinds
            .iter()
            .copied()
            .filter(|k| *k != ObjectKind::Namespace)
            .collect();
        self
    }

    /// Hash identifying this set and owner
    pub fn hash(&self) -> String {
        let owner = self
            .owner
            .as_ref()
            .map(|o| {
                format!(
                    "{}/{}/{}",
                    o.gvk(),
                    o.namespace.as_deref().unwrap_or_default(),
                    o.name
                )
            })
            .unwrap_or_default();
        deterministic_hash(&format!("{}/{}", self.id, owner))
    }

    /// Add the set label, annotations and, where allowed, an ownerReference
    pub fn decorate(&self, object: &mut DesiredObject) {
        let hash = self.hash();
        let namespace = object.namespace().map(str::to_string);
        let meta = object.meta_mut();

        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(HASH_LABEL.to_string(), hash);

        let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(SET_ID_ANNOTATION.to_string(), self.id.clone());

        let Some(owner) = &self.owner else {
            return;
        };
        annotations.insert(OWNER_GVK_ANNOTATION.to_string(), owner.gvk());
        annotations.insert(OWNER_NAME_ANNOTATION.to_string(), owner.name.clone());
        if let Some(ns) = &owner.namespace {
            annotations.insert(OWNER_NAMESPACE_ANNOTATION.to_string(), ns.clone());
        }

        // ownerReferences cannot cross namespaces
        if let (Some(uid), Some(owner_ns)) = (&owner.uid, &owner.namespace) {
            if namespace.as_deref() == Some(owner_ns.as_str()) {
                meta.owner_references = Some(vec![OwnerReference {
                    api_version: owner.api_version.clone(),
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                    uid: uid.clone(),
                    ..Default::default()
                }]);
            }
        }
    }
}

/// Owner `(namespace, name)` recorded on an applied object
pub fn owner_of(meta: &ObjectMeta) -> Option<(String, String)> {
    let annotations = meta.annotations.as_ref()?;
    let namespace = annotations.get(OWNER_NAMESPACE_ANNOTATION)?;
    let name = annotations.get(OWNER_NAME_ANNOTATION)?;
    Some((namespace.clone(), name.clone()))
}

/// Compute a short deterministic hash of `input` (SHA-256, first 8 bytes as hex)
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

// =============================================================================
// Applier
// =============================================================================

/// Converges the cluster to a desired object list
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Create or update `objects` and prune objects of the set no longer listed
    async fn apply(&self, set: &ApplySet, objects: Vec<DesiredObject>) -> Result<()>;

    /// Merge labels into a namespace; `None` removes the label
    async fn merge_namespace_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()>;
}

type ApplyFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

/// [`ResourceApplier`] using forced server-side apply with one field manager
pub struct KubeApplier {
    client: Client,
    params: PatchParams,
}

impl KubeApplier {
    /// Create an applier writing as `field_manager`
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            params: PatchParams::apply(field_manager).force(),
        }
    }

    fn api_for(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn patch_future(&self, object: &DesiredObject) -> Result<ApplyFuture> {
        let json = object.to_json()?;
        let api = self.api_for(&object.kind().api_resource(), object.namespace());
        let params = self.params.clone();
        let name = object.name().to_string();
        let kind = object.kind();
        Ok(Box::pin(async move {
            debug!(name = %name, kind = %kind, "applying resource");
            api.patch(&name, &params, &Patch::Apply(&json)).await?;
            Ok(())
        }))
    }

    async fn run(set_id: &str, futures: Vec<ApplyFuture>) -> Result<usize> {
        use futures::future::join_all;

        let count = futures.len();
        if count == 0 {
            return Ok(0);
        }
        let results = join_all(futures).await;
        let mut errors: Vec<_> = results.into_iter().filter_map(|r| r.err()).collect();
        if !errors.is_empty() {
            for (i, err) in errors.iter().enumerate() {
                tracing::error!(error = %err, index = i, set = set_id, "resource application failed");
            }
            return Err(errors.swap_remove(0));
        }
        Ok(count)
    }

    async fn prune(&self, set: &ApplySet, keep: &BTreeSet<(ObjectKind, Option<String>, String)>) -> Result<usize> {
        let selector = format!("{}={}", HASH_LABEL, set.hash());
        let mut deleted = 0;
        for kind in &set.prune {
            let ar = kind.api_resource();
            let list = Api::<DynamicObject>::all_with(self.client.clone(), &ar)
                .list(&ListParams::default().labels(&selector))
                .await?;
            for obj in list.items {
                if obj.annotations().get(SET_ID_ANNOTATION) != Some(&set.id) {
                    continue;
                }
                let key = (*kind, obj.namespace(), obj.name_any());
                if keep.contains(&key) {
                    continue;
                }
                let api = self.api_for(&ar, obj.namespace().as_deref());
                match api.delete(&obj.name_any(), &DeleteParams::background()).await {
                    Ok(_) => {
                        info!(kind = %kind, name = %obj.name_any(), namespace = ?obj.namespace(), set = %set.id, "pruned resource");
                        deleted += 1;
                    }
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ResourceApplier for KubeApplier {
    async fn apply(&self, set: &ApplySet, objects: Vec<DesiredObject>) -> Result<()> {
        let mut keep = BTreeSet::new();
        let mut namespaces = Vec::new();
        let mut rest = Vec::new();
        for mut object in objects {
            set.decorate(&mut object);
            keep.insert((object.kind(), object.namespace().map(str::to_string), object.name().to_string()));
            let future = self.patch_future(&object)?;
            if object.kind() == ObjectKind::Namespace {
                namespaces.push(future);
            } else {
                rest.push(future);
            }
        }

        // namespaced children need their namespace first
        let applied = Self::run(&set.id, namespaces).await? + Self::run(&set.id, rest).await?;
        let pruned = self.prune(set, &keep).await?;
        debug!(set = %set.id, applied, pruned, "apply set converged");
        Ok(())
    }

    async fn merge_namespace_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace = %name, "merged namespace labels");
        Ok(())
    }
}
