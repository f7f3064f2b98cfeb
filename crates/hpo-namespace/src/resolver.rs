//! Namespace change handler
//!
//! Classifies every namespace event as registration, system or member (in
//! that order) and keeps the derived objects converged:
//!
//! - operated namespaces are hardened
//! - a member namespace materializes its project's registration namespace
//!   (and, in singleton system-project mode, the shared release namespace)
//!   together with the registration data, then re-enqueues the project's
//!   charts
//! - a registration namespace re-enqueues its members so it is recreated
//!   if it disappears

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hpo_common::apply::{ApplyOwner, ApplySet, DesiredObject, ObjectKind, ResourceApplier};
use hpo_common::cache::WatchCache;
use hpo_common::chart::ChartFiles;
use hpo_common::crd::ProjectHelmChart;
use hpo_common::enqueue::Enqueuer;
use hpo_common::labels::{registration_namespace_name, PROJECT_ID_LABEL};
use hpo_common::options::{OperatorOptions, ProjectMode};
use hpo_common::release::ReleaseAddressing;
use hpo_rbac::SubjectRoleGetter;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::error::NamespaceError;
use crate::getter::{is_operated, ProjectGetter};
use crate::registry::NamespaceRegistry;
use crate::resources::{
    hardening_objects, registration_data, registration_data_set_id, registration_namespace,
    release_namespace, HARDENING_SET, REGISTRATION_NAMESPACE_SET,
};

/// Requeue interval after a failed pass
const REQUEUE_ERROR_SECS: u64 = 30;

/// Shared state of the namespace controller
pub struct NamespaceContext {
    opts: Arc<OperatorOptions>,
    addressing: ReleaseAddressing,
    files: ChartFiles,
    registry: Arc<NamespaceRegistry>,
    cache: Arc<dyn WatchCache>,
    applier: Arc<dyn ResourceApplier>,
    subjects: Arc<dyn SubjectRoleGetter>,
    namespaces: Enqueuer<Namespace>,
    charts: Enqueuer<ProjectHelmChart>,
}

impl NamespaceContext {
    /// Create the context; the registry is seeded from `opts`
    pub fn new(
        opts: Arc<OperatorOptions>,
        files: ChartFiles,
        cache: Arc<dyn WatchCache>,
        applier: Arc<dyn ResourceApplier>,
        subjects: Arc<dyn SubjectRoleGetter>,
        namespaces: Enqueuer<Namespace>,
        charts: Enqueuer<ProjectHelmChart>,
    ) -> Self {
        Self {
            addressing: ReleaseAddressing::new(&opts),
            registry: Arc::new(NamespaceRegistry::new(&opts)),
            opts,
            files,
            cache,
            applier,
            subjects,
            namespaces,
            charts,
        }
    }

    /// Membership lookups backed by this resolver's registry
    pub fn project_getter(&self) -> ProjectGetter {
        ProjectGetter::new(&self.opts, self.registry.clone(), self.cache.clone())
    }

    /// Classification state
    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    /// Run the change handler over every namespace before anything reads the registry.
    ///
    /// The first failure aborts the replay.
    pub async fn replay(&self, namespaces: &[Namespace]) -> Result<(), NamespaceError> {
        info!(count = namespaces.len(), "identifying and registering project registration namespaces");
        for namespace in namespaces {
            self.on_change(namespace)
                .await
                .map_err(|e| NamespaceError::replay(namespace.name_any(), e))?;
        }
        info!(
            registered = self.registry.registration_names().len(),
            "project registration namespaces initialized"
        );
        Ok(())
    }

    /// Handle one namespace create, update or termination
    pub async fn on_change(&self, namespace: &Namespace) -> Result<(), NamespaceError> {
        let name = namespace.name_any();
        let deleting = namespace.metadata.deletion_timestamp.is_some();

        if is_operated(namespace) && !deleting {
            self.harden(namespace).await?;
        }

        let getter = self.project_getter();
        if getter.is_project_registration_namespace(&name) {
            return self.on_registration_namespace(namespace).await;
        }
        if self.registry.is_system(namespace) {
            debug!(namespace = %name, "ignoring system namespace");
            return Ok(());
        }
        self.on_member_namespace(namespace).await
    }

    async fn harden(&self, namespace: &Namespace) -> Result<(), NamespaceError> {
        let set = ApplySet::new(HARDENING_SET).with_owner(ApplyOwner::of(namespace));
        self.applier
            .apply(&set, hardening_objects(&namespace.name_any())?)
            .await?;
        Ok(())
    }

    async fn on_registration_namespace(&self, namespace: &Namespace) -> Result<(), NamespaceError> {
        let name = namespace.name_any();
        let Some(label) = self.opts.mode().project_label().map(str::to_string) else {
            // single registration namespace: the operator's own
            self.apply_registration_data(namespace, "", &[]).await?;
            self.enqueue_charts(&name);
            return Ok(());
        };

        let project_id = self
            .registry
            .registration(&name)
            .and_then(|registered| registered.labels().get(&label).cloned());
        match project_id {
            Some(project_id) => {
                for member in self.members(&label, &project_id, None) {
                    self.namespaces.enqueue(None, &member);
                }
            }
            None => warn!(namespace = %name, label = %label, "registration namespace is not tied to a project"),
        }

        if namespace.metadata.deletion_timestamp.is_some() {
            info!(namespace = %name, "registration namespace is being deleted");
            self.registry.unregister(&name);
        }
        Ok(())
    }

    async fn on_member_namespace(&self, namespace: &Namespace) -> Result<(), NamespaceError> {
        let mode = self.opts.mode();
        let Some(label) = mode.project_label() else {
            return Ok(());
        };
        let name = namespace.name_any();
        let deleting = namespace.metadata.deletion_timestamp.is_some();
        let project_id = namespace
            .labels()
            .get(label)
            .filter(|id| !id.is_empty())
            .cloned();

        if matches!(mode, ProjectMode::SystemProject { .. }) && !deleting {
            self.mirror_project_id(namespace, project_id.as_deref()).await?;
        }

        let project_id = project_id.filter(|_| !is_operated(namespace));
        if let Some(previous) = self.registry.member_project(&name) {
            if project_id.as_ref() != Some(&previous) {
                info!(namespace = %name, from = %previous, to = ?project_id, "namespace left project");
                self.sync_project(label, &previous, &name, false).await?;
            }
        }

        let Some(project_id) = project_id else {
            self.registry.forget_member(&name);
            return Ok(());
        };
        self.sync_project(label, &project_id, &name, !deleting).await?;
        if deleting {
            self.registry.forget_member(&name);
        } else {
            self.registry.track_member(&name, &project_id);
        }
        Ok(())
    }

    /// Converge a project's registration namespace and data after `member` changed.
    ///
    /// `member` counts as a target only when `include_member` is set.
    async fn sync_project(
        &self,
        label: &str,
        project_id: &str,
        member: &str,
        include_member: bool,
    ) -> Result<(), NamespaceError> {
        let registration_name = registration_namespace_name(project_id);
        if !ReleaseAddressing::is_valid_namespace_name(&registration_name) {
            error!(
                namespace = %registration_name,
                "could not apply namespace: name is above 63 characters"
            );
            return Ok(());
        }
        if registration_name == member {
            return Ok(());
        }

        let mut targets = self.members(label, project_id, Some(member));
        if include_member {
            targets.push(member.to_string());
            targets.sort();
        }
        let orphaned = targets.is_empty();
        if orphaned {
            warn!(project = %project_id, namespace = %registration_name, "project has no member namespaces, marking orphaned");
        }

        let registration = registration_namespace(&self.opts, label, project_id, orphaned);
        let mut objects = vec![DesiredObject::Namespace(registration.clone())];
        if let Some(release_name) = self.addressing.singleton_release_namespace(&registration_name) {
            if ReleaseAddressing::is_valid_namespace_name(&release_name) {
                if let Some(release) =
                    release_namespace(&self.opts, &release_name, project_id, orphaned)
                {
                    objects.push(DesiredObject::Namespace(release));
                }
            } else {
                error!(namespace = %release_name, "could not apply release namespace: name is above 63 characters");
            }
        }
        self.applier
            .apply(&ApplySet::new(REGISTRATION_NAMESPACE_SET), objects)
            .await?;

        self.apply_registration_data(&registration, project_id, &targets)
            .await?;
        self.registry.register(registration);
        self.enqueue_charts(&registration_name);
        Ok(())
    }

    /// Keep `helm.cattle.io/projectId` on a member equal to its project label
    async fn mirror_project_id(
        &self,
        namespace: &Namespace,
        project_id: Option<&str>,
    ) -> Result<(), NamespaceError> {
        let current = namespace.labels().get(PROJECT_ID_LABEL).map(String::as_str);
        if current == project_id {
            return Ok(());
        }
        if current.is_none() && project_id.is_none() {
            return Ok(());
        }
        let labels = BTreeMap::from([(
            PROJECT_ID_LABEL.to_string(),
            project_id.map(str::to_string),
        )]);
        debug!(namespace = %namespace.name_any(), project = ?project_id, "updating mirrored project id label");
        self.applier
            .merge_namespace_labels(&namespace.name_any(), labels)
            .await?;
        Ok(())
    }

    async fn apply_registration_data(
        &self,
        registration: &Namespace,
        project_id: &str,
        targets: &[String],
    ) -> Result<(), NamespaceError> {
        let name = registration.name_any();
        let set = ApplySet::new(registration_data_set_id(&name, &self.opts.release_name))
            .with_owner(ApplyOwner::of(registration))
            .with_prune(&[ObjectKind::ConfigMap, ObjectKind::Role, ObjectKind::RoleBinding]);
        let objects = registration_data(
            &self.opts,
            &self.files,
            self.subjects.as_ref(),
            &name,
            project_id,
            targets,
        );
        self.applier.apply(&set, objects).await?;
        Ok(())
    }

    /// Current member namespaces of a project, sorted, optionally without one name
    fn members(&self, label: &str, project_id: &str, except: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .cache
            .namespaces_with_label(label, project_id)
            .into_iter()
            .filter(|ns| !is_operated(ns))
            .filter(|ns| !self.registry.is_system(ns))
            .map(|ns| ns.name_any())
            .filter(|name| !self.registry.is_registration(name))
            .filter(|name| Some(name.as_str()) != except)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn enqueue_charts(&self, registration_namespace: &str) {
        for chart in self.cache.project_helm_charts_in(registration_namespace) {
            self.charts
                .enqueue(chart.namespace().as_deref(), &chart.name_any());
        }
    }
}

/// Reconcile one namespace
pub async fn reconcile(
    namespace: Arc<Namespace>,
    ctx: Arc<NamespaceContext>,
) -> Result<Action, NamespaceError> {
    ctx.on_change(&namespace).await?;
    Ok(Action::await_change())
}

/// Log the failure and retry later
pub fn error_policy(
    namespace: Arc<Namespace>,
    error: &NamespaceError,
    _ctx: Arc<NamespaceContext>,
) -> Action {
    error!(?error, namespace = %namespace.name_any(), "namespace reconciliation failed");
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}
