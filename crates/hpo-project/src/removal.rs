//! Handling for deleted ProjectHelmCharts
//!
//! Deletion is observed through a plain watch rather than a finalizer, so
//! removing a chart is never held up by the operator. The chart's apply set
//! is re-applied with nothing but its orphaned release namespace (if it has
//! one), which prunes the HelmChart, HelmRelease and RoleBindings it created.
//! Charts waiting on the freed release address are then retried.

use std::sync::Arc;

use futures::StreamExt;
use hpo_common::apply::{ApplyOwner, ApplySet, DesiredObject, ResourceApplier};
use hpo_common::cache::{charts_matching_key, WatchCache};
use hpo_common::crd::ProjectHelmChart;
use hpo_common::enqueue::Enqueuer;
use hpo_common::options::OperatorOptions;
use hpo_common::release::ReleaseAddressing;
use hpo_common::WATCH_TIMEOUT_SECS;
use hpo_namespace::resources::release_namespace;
use kube::api::Api;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::{PROJECT_HELM_CHART_SET, PRUNED_KINDS};
use crate::error::ProjectError;
use crate::reconciler::registration_project_id;

/// Reacts to ProjectHelmChart deletions
pub struct RemovalHandler {
    opts: Arc<OperatorOptions>,
    addressing: ReleaseAddressing,
    cache: Arc<dyn WatchCache>,
    applier: Arc<dyn ResourceApplier>,
    charts: Enqueuer<ProjectHelmChart>,
}

impl RemovalHandler {
    /// Create the handler
    pub fn new(
        opts: Arc<OperatorOptions>,
        cache: Arc<dyn WatchCache>,
        applier: Arc<dyn ResourceApplier>,
        charts: Enqueuer<ProjectHelmChart>,
    ) -> Self {
        Self {
            addressing: ReleaseAddressing::new(&opts),
            opts,
            cache,
            applier,
            charts,
        }
    }

    /// Watch ProjectHelmCharts and handle every deletion until the stream ends
    pub async fn run(self: Arc<Self>, client: Client) {
        let api: Api<ProjectHelmChart> = Api::all(client);
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let mut stream = watcher(api, config).default_backoff().boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Delete(chart)) => {
                    if let Err(e) = self.on_remove(&chart).await {
                        error!(
                            error = %e,
                            chart = %chart.name_any(),
                            namespace = %chart.namespace_or_default(),
                            "failed to handle ProjectHelmChart removal"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ProjectHelmChart removal watch error"),
            }
        }
        debug!("ProjectHelmChart removal watch stream ended");
    }

    /// Handle one deleted chart
    pub async fn on_remove(&self, chart: &ProjectHelmChart) -> Result<(), ProjectError> {
        if chart.spec.helm_api_version != self.opts.helm_api_version {
            return Ok(());
        }
        let namespace = chart.namespace_or_default();
        let name = chart.name_any();

        let address = self.addressing.resolve(&namespace, &name);
        let waiting = charts_matching_key(self.cache.as_ref(), &address.name, |c| {
            vec![self.addressing.for_chart(c).name]
        });
        for other in waiting {
            let other_namespace = other.namespace_or_default();
            let other_name = other.name_any();
            if other_namespace != namespace || other_name != name {
                self.charts.enqueue(Some(&other_namespace), &other_name);
            }
        }

        let mut objects = Vec::new();
        if let Some(owned) = self
            .addressing
            .chart_release_namespace(&namespace, &name)
            .filter(|owned| self.cache.get_namespace(owned).is_some())
        {
            let project_id = registration_project_id(&self.opts, self.cache.as_ref(), &namespace);
            if let Some(release_ns) = release_namespace(&self.opts, &owned, &project_id, true) {
                info!(
                    chart = %name,
                    namespace = %namespace,
                    release_namespace = %owned,
                    "marking project release namespace as orphaned"
                );
                objects.push(DesiredObject::Namespace(release_ns));
            }
        }

        debug!(chart = %name, namespace = %namespace, "pruning ProjectHelmChart children");
        let set = ApplySet::new(PROJECT_HELM_CHART_SET)
            .with_owner(ApplyOwner::of(chart))
            .with_prune(&PRUNED_KINDS);
        self.applier
            .apply(&set, objects)
            .await
            .map_err(|e| ProjectError::apply(&namespace, &name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_common::apply::MockResourceApplier;
    use hpo_common::cache::MemoryCache;
    use hpo_common::crd::ProjectHelmChartSpec;
    use hpo_common::labels::{ORPHANED_LABEL, PROJECT_ID_LABEL};
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    const LABEL: &str = "field.cattle.io/projectId";
    const API_VERSION: &str = "monitoring.cattle.io/v1alpha1";

    fn opts(system_project: bool, singleton: bool) -> OperatorOptions {
        OperatorOptions {
            release_name: "monitoring".to_string(),
            helm_api_version: API_VERSION.to_string(),
            project_label: Some(LABEL.to_string()),
            system_project_label_value: system_project.then(|| "p-system".to_string()),
            singleton,
            ..Default::default()
        }
    }

    fn chart(name: &str) -> ProjectHelmChart {
        let mut chart = ProjectHelmChart::new(
            name,
            ProjectHelmChartSpec {
                helm_api_version: API_VERSION.to_string(),
                ..Default::default()
            },
        );
        chart.metadata.namespace = Some("cattle-project-p-1".to_string());
        chart
    }

    fn handler(
        opts: OperatorOptions,
        applier: MockResourceApplier,
        cache: MemoryCache,
    ) -> (RemovalHandler, hpo_common::enqueue::EnqueueReceiver<ProjectHelmChart>) {
        cache.put_namespace(Namespace {
            metadata: ObjectMeta {
                name: Some("cattle-project-p-1".to_string()),
                labels: Some(BTreeMap::from([(LABEL.to_string(), "p-1".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        });
        let (charts, rx) = Enqueuer::channel();
        (
            RemovalHandler::new(Arc::new(opts), Arc::new(cache), Arc::new(applier), charts),
            rx,
        )
    }

    fn named(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn release_namespace_is_orphaned_and_children_pruned() {
        let mut applier = MockResourceApplier::new();
        applier
            .expect_apply()
            .withf(|set, objects| {
                let [DesiredObject::Namespace(ns)] = objects.as_slice() else {
                    return false;
                };
                let labels = ns.labels();
                set.id == PROJECT_HELM_CHART_SET
                    && set.prune == PRUNED_KINDS.to_vec()
                    && set.owner.as_ref().map(|o| o.name.as_str()) == Some("project")
                    && ns.name_any() == "project-monitoring"
                    && labels.get(ORPHANED_LABEL).map(String::as_str) == Some("true")
                    && labels.get(PROJECT_ID_LABEL).map(String::as_str) == Some("p-1")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let cache = MemoryCache::new();
        cache.put_namespace(named("project-monitoring"));
        let (handler, _rx) = handler(opts(true, false), applier, cache);

        handler.on_remove(&chart("project")).await.unwrap();
    }

    #[tokio::test]
    async fn missing_release_namespace_is_not_recreated() {
        let mut applier = MockResourceApplier::new();
        applier
            .expect_apply()
            .withf(|set, objects| objects.is_empty() && set.prune == PRUNED_KINDS.to_vec())
            .times(1)
            .returning(|_, _| Ok(()));
        let (handler, _rx) = handler(opts(true, false), applier, MemoryCache::new());

        handler.on_remove(&chart("project")).await.unwrap();
    }

    #[tokio::test]
    async fn children_pruned_without_system_project() {
        let mut applier = MockResourceApplier::new();
        applier
            .expect_apply()
            .withf(|set, objects| {
                set.id == PROJECT_HELM_CHART_SET
                    && set.prune == PRUNED_KINDS.to_vec()
                    && set.owner.as_ref().map(|o| o.name.as_str()) == Some("project")
                    && objects.is_empty()
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (handler, _rx) = handler(opts(false, false), applier, MemoryCache::new());

        handler.on_remove(&chart("project")).await.unwrap();
    }

    #[tokio::test]
    async fn shared_singleton_release_namespace_is_left_alone() {
        let mut applier = MockResourceApplier::new();
        applier
            .expect_apply()
            .withf(|_, objects| objects.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));
        let cache = MemoryCache::new();
        cache.put_namespace(named("cattle-project-p-1-monitoring"));
        let (handler, _rx) = handler(opts(true, true), applier, cache);

        handler.on_remove(&chart("project")).await.unwrap();
    }

    #[tokio::test]
    async fn charts_waiting_on_release_are_requeued() {
        let mut applier = MockResourceApplier::new();
        applier.expect_apply().returning(|_, _| Ok(()));
        let cache = MemoryCache::new();
        cache.put_project_helm_chart(chart("first"));
        cache.put_project_helm_chart(chart("second"));
        let (handler, mut rx) = handler(opts(true, true), applier, cache);

        handler.on_remove(&chart("first")).await.unwrap();

        let queued = rx.try_next().unwrap().unwrap();
        assert_eq!(queued.name, "second");
        assert_eq!(queued.namespace.as_deref(), Some("cattle-project-p-1"));
        assert!(rx.try_next().is_err());
    }

    #[tokio::test]
    async fn other_api_versions_are_ignored() {
        let mut applier = MockResourceApplier::new();
        applier.expect_apply().never();
        let (handler, _rx) = handler(opts(true, false), applier, MemoryCache::new());
        let mut chart = chart("project");
        chart.spec.helm_api_version = "logging.cattle.io/v1alpha1".to_string();

        handler.on_remove(&chart).await.unwrap();
    }
}
