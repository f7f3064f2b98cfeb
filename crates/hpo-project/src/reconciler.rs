//! Desired state of a ProjectHelmChart
//!
//! [`ProjectReconciler::reconcile`] reads only the watch cache, the
//! project getter and the subject tracker. It never writes to the cluster;
//! the controller applies what it returns.
//!
//! Gates run in a fixed order:
//! 1. deleting charts are left to the removal handler
//! 2. charts outside this instance's registration namespaces are ignored
//! 3. charts for another `helmApiVersion` are ignored
//! 4. the cleanup label tears the children down
//! 5. an older chart on the same release address blocks this one
//! 6. a project without members keeps only its orphaned release namespace
//! 7. otherwise the full object set is emitted

use std::sync::Arc;

use hpo_common::apply::DesiredObject;
use hpo_common::cache::WatchCache;
use hpo_common::crd::{ChartStatus, ProjectHelmChart, ProjectHelmChartStatus};
use hpo_common::labels::DASHBOARD_VALUES_LABEL;
use hpo_common::options::OperatorOptions;
use hpo_common::release::{ReleaseAddress, ReleaseAddressing};
use hpo_namespace::resources::release_namespace;
use hpo_namespace::ProjectGetter;
use hpo_rbac::SubjectRoleGetter;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::resources::{helm_chart, helm_release, role_bindings};
use crate::status;
use crate::values::{chart_values, dashboard_values, to_values_yaml};

/// Outcome of one reconcile pass
#[derive(Clone, Debug, PartialEq)]
pub enum Reconciled {
    /// Not ours to handle; touch nothing
    Ignored,
    /// Only the status changes; previously applied objects stay as they are
    StatusOnly(ProjectHelmChartStatus),
    /// The complete object set for the chart; anything applied before and
    /// missing here is pruned (namespaces excepted)
    Desired {
        /// Objects in apply order
        objects: Vec<DesiredObject>,
        /// New status
        status: ProjectHelmChartStatus,
    },
}

/// Computes child objects and status for ProjectHelmCharts
pub struct ProjectReconciler {
    opts: Arc<OperatorOptions>,
    addressing: ReleaseAddressing,
    getter: ProjectGetter,
    subjects: Arc<dyn SubjectRoleGetter>,
    cache: Arc<dyn WatchCache>,
}

impl ProjectReconciler {
    /// Create a reconciler for the configured mode
    pub fn new(
        opts: Arc<OperatorOptions>,
        getter: ProjectGetter,
        subjects: Arc<dyn SubjectRoleGetter>,
        cache: Arc<dyn WatchCache>,
    ) -> Self {
        Self {
            addressing: ReleaseAddressing::new(&opts),
            opts,
            getter,
            subjects,
            cache,
        }
    }

    /// Release addressing shared with the resolvers and removal handler
    pub fn addressing(&self) -> &ReleaseAddressing {
        &self.addressing
    }

    /// Compute the desired objects and status for `chart`
    pub fn reconcile(&self, chart: &ProjectHelmChart, previous: &ProjectHelmChartStatus) -> Reconciled {
        let namespace = chart.namespace_or_default();
        let name = chart.name_any();

        if chart.is_deleting() {
            return Reconciled::Ignored;
        }
        if !self.getter.is_project_registration_namespace(&namespace) {
            debug!(chart = %name, namespace = %namespace, "not in a project registration namespace");
            return Reconciled::Ignored;
        }
        if chart.spec.helm_api_version != self.opts.helm_api_version {
            debug!(
                chart = %name,
                namespace = %namespace,
                helm_api_version = %chart.spec.helm_api_version,
                "helmApiVersion handled by another operator"
            );
            return Reconciled::Ignored;
        }
        if chart.has_cleanup_label() {
            info!(chart = %name, namespace = %namespace, "cleaning up HelmChart and HelmRelease");
            return Reconciled::Desired {
                objects: Vec::new(),
                status: status::awaiting_redeployment(&namespace, &chart.spec.helm_api_version),
            };
        }

        let address = self.addressing.resolve(&namespace, &name);
        if let Some(owner) = self.release_owner(chart, &address) {
            info!(
                chart = %name,
                namespace = %namespace,
                release = %address,
                owner = %owner.name_any(),
                "release already claimed by an older ProjectHelmChart"
            );
            return Reconciled::Desired {
                objects: Vec::new(),
                status: status::release_conflict(
                    &address,
                    &owner.namespace_or_default(),
                    &owner.name_any(),
                ),
            };
        }

        let dedicated = self.addressing.dedicated_namespace(&namespace, &name);
        if let Some(too_long) = dedicated
            .as_deref()
            .filter(|ns| !ReleaseAddressing::is_valid_namespace_name(ns))
        {
            return Reconciled::Desired {
                objects: Vec::new(),
                status: status::release_namespace_too_long(too_long),
            };
        }

        // the shared singleton namespace is applied by the namespace resolver
        let owned = self.addressing.chart_release_namespace(&namespace, &name);
        let project_id = self.project_id(&namespace);
        let targets = self.getter.target_project_namespaces(chart);
        if targets.is_empty() {
            // keep an existing release namespace around, marked orphaned
            let objects = owned
                .filter(|ns| self.cache.get_namespace(ns).is_some())
                .and_then(|ns| release_namespace(&self.opts, &ns, &project_id, true))
                .map(DesiredObject::Namespace)
                .into_iter()
                .collect();
            return Reconciled::Desired {
                objects,
                status: status::no_targets(),
            };
        }

        let mut project_namespaces = targets.clone();
        project_namespaces.extend(dedicated.iter().cloned());

        let values = chart_values(&self.opts, chart, &project_id, &project_namespaces);
        let values_content = match to_values_yaml(&values) {
            Ok(yaml) => yaml,
            Err(e) => {
                warn!(chart = %name, namespace = %namespace, error = %e, "unable to render spec.values");
                return Reconciled::StatusOnly(status::unable_to_parse_values(&e));
            }
        };

        let mut objects = Vec::new();
        if let Some(ns) = owned
            .as_deref()
            .and_then(|ns| release_namespace(&self.opts, ns, &project_id, false))
        {
            objects.push(DesiredObject::Namespace(ns));
        }
        objects.extend(
            role_bindings(
                &self.opts,
                self.cache.as_ref(),
                self.subjects.as_ref(),
                &address,
                &project_id,
                &targets,
            )
            .into_iter()
            .map(DesiredObject::RoleBinding),
        );
        objects.push(DesiredObject::HelmChart(helm_chart(
            &self.opts,
            &address,
            &project_id,
            values_content,
        )));
        objects.push(DesiredObject::HelmRelease(helm_release(
            &self.opts,
            &address,
            &project_id,
        )));

        let status = status::applied(
            previous,
            &self.opts.system_namespace,
            &address,
            project_namespaces,
            dashboard_values(&self.dashboard_config_maps(&address)),
        );
        Reconciled::Desired { objects, status }
    }

    /// Project id recorded on the chart's registration namespace; empty without a project label
    pub fn project_id(&self, chart_namespace: &str) -> String {
        registration_project_id(&self.opts, self.cache.as_ref(), chart_namespace)
    }

    /// Oldest other live chart resolving to the same release address.
    ///
    /// Charts already blocked themselves never block others, so exactly one
    /// chart per address wins.
    fn release_owner(
        &self,
        chart: &ProjectHelmChart,
        address: &ReleaseAddress,
    ) -> Option<Arc<ProjectHelmChart>> {
        let own_key = age_key(chart);
        self.cache
            .list_project_helm_charts()
            .into_iter()
            .filter(|other| {
                other.namespace_or_default() != chart.namespace_or_default()
                    || other.name_any() != chart.name_any()
            })
            .filter(|other| other.spec.helm_api_version == chart.spec.helm_api_version)
            .filter(|other| !other.is_deleting())
            .filter(|other| {
                other.status.as_ref().map(ProjectHelmChartStatus::state)
                    != Some(ChartStatus::UnableToCreateHelmRelease)
            })
            .filter(|other| self.addressing.for_chart(other) == *address)
            .filter(|other| age_key(other) < own_key)
            .min_by_key(|other| age_key(other))
    }

    fn dashboard_config_maps(&self, address: &ReleaseAddress) -> Vec<Arc<ConfigMap>> {
        self.cache
            .list_config_maps(&address.namespace)
            .into_iter()
            .filter(|cm| cm.labels().get(DASHBOARD_VALUES_LABEL) == Some(&address.name))
            .collect()
    }
}

/// Project id label value of a registration namespace, empty when unknown
pub(crate) fn registration_project_id(
    opts: &OperatorOptions,
    cache: &dyn WatchCache,
    registration_namespace: &str,
) -> String {
    let mode = opts.mode();
    let Some(label) = mode.project_label() else {
        return String::new();
    };
    cache
        .get_namespace(registration_namespace)
        .and_then(|ns| ns.labels().get(label).cloned())
        .unwrap_or_default()
}

/// Creation time, then namespace, then name
fn age_key(chart: &ProjectHelmChart) -> (Option<DateTime<Utc>>, String, String) {
    (
        chart.metadata.creation_timestamp.as_ref().map(|t| t.0),
        chart.namespace_or_default(),
        chart.name_any(),
    )
}
