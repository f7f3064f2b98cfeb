//! Fan-out from related objects to the ProjectHelmCharts they affect
//!
//! Each mapper is handed to `Controller::watches` for one related kind.

use std::sync::Arc;

use hpo_common::apply::owner_of;
use hpo_common::cache::{charts_matching_key, WatchCache};
use hpo_common::crd::ProjectHelmChart;
use hpo_common::labels::{DASHBOARD_VALUES_LABEL, ROLE_BINDING_LABEL, ROLE_LABEL};
use hpo_common::options::OperatorOptions;
use hpo_common::release::ReleaseAddressing;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};

/// Maps related objects to chart keys
pub struct ChartResolvers {
    addressing: ReleaseAddressing,
    system_namespace: String,
    cache: Arc<dyn WatchCache>,
}

impl ChartResolvers {
    /// Resolvers reading the chart index from `cache`
    pub fn new(opts: &OperatorOptions, cache: Arc<dyn WatchCache>) -> Self {
        Self {
            addressing: ReleaseAddressing::new(opts),
            system_namespace: opts.system_namespace.clone(),
            cache,
        }
    }

    /// Charts whose release is named `release_name`
    pub fn charts_for_release(&self, release_name: &str) -> Vec<Arc<ProjectHelmChart>> {
        charts_matching_key(self.cache.as_ref(), release_name, |chart| {
            vec![self.addressing.for_chart(chart).name]
        })
    }

    /// HelmCharts and HelmReleases map to the chart recorded by the applier.
    ///
    /// Owner references cannot cross namespaces, so the owner comes from
    /// the apply set annotations.
    pub fn owner<K: Resource>(&self, obj: &K) -> Vec<ObjectRef<ProjectHelmChart>> {
        if obj.meta().namespace.as_deref() != Some(self.system_namespace.as_str()) {
            return Vec::new();
        }
        owner_of(obj.meta())
            .map(|(namespace, name)| ObjectRef::new(&name).within(&namespace))
            .into_iter()
            .collect()
    }

    /// Dashboard values ConfigMaps
    pub fn config_map(&self, config_map: &ConfigMap) -> Vec<ObjectRef<ProjectHelmChart>> {
        self.labelled(config_map, DASHBOARD_VALUES_LABEL)
    }

    /// Roles deployed by a release
    pub fn role(&self, role: &Role) -> Vec<ObjectRef<ProjectHelmChart>> {
        self.labelled(role, ROLE_LABEL)
    }

    /// RoleBindings emitted for a release
    pub fn role_binding(&self, binding: &RoleBinding) -> Vec<ObjectRef<ProjectHelmChart>> {
        self.labelled(binding, ROLE_BINDING_LABEL)
    }

    /// Release namespaces, which in system-project mode share the release name
    pub fn namespace(&self, namespace: &Namespace) -> Vec<ObjectRef<ProjectHelmChart>> {
        self.charts_for_release(&namespace.name_any())
            .iter()
            .map(|chart| ObjectRef::from_obj(chart.as_ref()))
            .collect()
    }

    fn labelled<K: Resource>(&self, obj: &K, label: &str) -> Vec<ObjectRef<ProjectHelmChart>> {
        let Some(release_name) = obj.meta().labels.as_ref().and_then(|l| l.get(label)) else {
            return Vec::new();
        };
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        self.charts_for_release(release_name)
            .iter()
            .filter(|chart| {
                namespace == self.system_namespace
                    || self.addressing.for_chart(chart).namespace == namespace
            })
            .map(|chart| ObjectRef::from_obj(chart.as_ref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_common::apply::{ApplyOwner, ApplySet, DesiredObject};
    use hpo_common::cache::MemoryCache;
    use hpo_common::crd::{HelmChart, ProjectHelmChartSpec};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn opts() -> OperatorOptions {
        OperatorOptions {
            release_name: "monitoring".to_string(),
            project_label: Some("field.cattle.io/projectId".to_string()),
            system_project_label_value: Some("p-system".to_string()),
            ..Default::default()
        }
    }

    fn chart(namespace: &str, name: &str) -> ProjectHelmChart {
        let mut chart = ProjectHelmChart::new(name, ProjectHelmChartSpec::default());
        chart.metadata.namespace = Some(namespace.to_string());
        chart
    }

    fn meta(namespace: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("obj".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn resolvers() -> ChartResolvers {
        let cache = MemoryCache::new();
        cache.put_project_helm_chart(chart("cattle-project-p-1", "project"));
        cache.put_project_helm_chart(chart("cattle-project-p-2", "other"));
        ChartResolvers::new(&opts(), Arc::new(cache))
    }

    #[test]
    fn applied_children_map_to_owner() {
        let owner = chart("cattle-project-p-1", "project");
        let mut object = DesiredObject::HelmChart(HelmChart::new("project-monitoring", Default::default()));
        if let DesiredObject::HelmChart(c) = &mut object {
            c.metadata.namespace = Some("cattle-helm-system".to_string());
        }
        ApplySet::new("project-helm-chart-applier")
            .with_owner(ApplyOwner::of(&owner))
            .decorate(&mut object);
        let DesiredObject::HelmChart(helm_chart) = object else {
            panic!("expected a HelmChart");
        };

        let refs = resolvers().owner(&helm_chart);
        assert_eq!(refs, vec![ObjectRef::from_obj(&owner)]);

        let mut elsewhere = helm_chart.clone();
        elsewhere.metadata.namespace = Some("team-a".to_string());
        assert!(resolvers().owner(&elsewhere).is_empty());
    }

    #[test]
    fn labelled_objects_resolve_through_release_index() {
        let r = resolvers();
        let cm = ConfigMap {
            metadata: meta("project-monitoring", &[(DASHBOARD_VALUES_LABEL, "project-monitoring")]),
            ..Default::default()
        };
        assert_eq!(
            r.config_map(&cm),
            vec![ObjectRef::from_obj(&chart("cattle-project-p-1", "project"))]
        );

        // outside the release and system namespaces
        let role = Role {
            metadata: meta("team-a", &[(ROLE_LABEL, "project-monitoring")]),
            ..Default::default()
        };
        assert!(r.role(&role).is_empty());

        let binding = RoleBinding {
            metadata: meta("cattle-helm-system", &[(ROLE_BINDING_LABEL, "other-monitoring")]),
            ..Default::default()
        };
        assert_eq!(
            r.role_binding(&binding),
            vec![ObjectRef::from_obj(&chart("cattle-project-p-2", "other"))]
        );

        let unlabelled = ConfigMap {
            metadata: meta("project-monitoring", &[]),
            ..Default::default()
        };
        assert!(r.config_map(&unlabelled).is_empty());
    }

    #[test]
    fn release_namespace_maps_to_its_chart() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("project-monitoring".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(resolvers().namespace(&ns).len(), 1);
    }
}
