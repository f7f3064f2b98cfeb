//! Controller runner - builds the controller futures
//!
//! Each `build_*` function returns a boxed future that runs one controller
//! until shutdown. Construction is kept free of side effects; the caller
//! decides how the futures are composed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use hpo_common::crd::{HelmChart, HelmRelease, ProjectHelmChart};
use hpo_common::enqueue::EnqueueReceiver;
use hpo_common::labels::{DASHBOARD_VALUES_LABEL, ROLE_BINDING_LABEL, ROLE_LABEL};
use hpo_common::WATCH_TIMEOUT_SECS;
use hpo_namespace::NamespaceContext;
use hpo_project::{ChartResolvers, ProjectContext};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

/// A controller driven to completion by the caller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Inputs of the ProjectHelmChart controller
pub struct ProjectControllerParams {
    /// Namespace holding HelmCharts and HelmReleases
    pub system_namespace: String,
    /// Watch Namespaces as well (dedicated release namespaces)
    pub watch_release_namespaces: bool,
    /// Maps watched objects back to charts
    pub resolvers: Arc<ChartResolvers>,
    /// Keys queued by the other handlers
    pub triggers: EnqueueReceiver<ProjectHelmChart>,
}

/// Build the ProjectHelmChart controller.
///
/// Changes to the objects a chart produces or reads (HelmCharts,
/// HelmReleases, dashboard ConfigMaps, aggregating Roles, emitted
/// RoleBindings and release namespaces) map back to the chart through
/// [`ChartResolvers`].
pub fn build_project_controller(
    client: Client,
    ctx: Arc<ProjectContext>,
    params: ProjectControllerParams,
) -> ControllerFuture {
    let ProjectControllerParams {
        system_namespace,
        watch_release_namespaces,
        resolvers,
        triggers,
    } = params;

    let charts: Api<ProjectHelmChart> = Api::all(client.clone());
    let helm_charts: Api<HelmChart> = Api::namespaced(client.clone(), &system_namespace);
    let helm_releases: Api<HelmRelease> = Api::namespaced(client.clone(), &system_namespace);

    tracing::info!("- ProjectHelmChart controller");

    let by_helm_chart = resolvers.clone();
    let by_helm_release = resolvers.clone();
    let by_config_map = resolvers.clone();
    let by_role = resolvers.clone();
    let by_role_binding = resolvers.clone();

    let mut controller = Controller::new(charts, watcher_config())
        .watches(helm_charts, watcher_config(), move |helm_chart| {
            by_helm_chart.owner(&helm_chart)
        })
        .watches(helm_releases, watcher_config(), move |helm_release| {
            by_helm_release.owner(&helm_release)
        })
        .watches(
            Api::<ConfigMap>::all(client.clone()),
            watcher_config().labels(DASHBOARD_VALUES_LABEL),
            move |config_map| by_config_map.config_map(&config_map),
        )
        .watches(
            Api::<Role>::all(client.clone()),
            watcher_config().labels(ROLE_LABEL),
            move |role| by_role.role(&role),
        )
        .watches(
            Api::<RoleBinding>::all(client.clone()),
            watcher_config().labels(ROLE_BINDING_LABEL),
            move |binding| by_role_binding.role_binding(&binding),
        );

    if watch_release_namespaces {
        let by_namespace = resolvers;
        controller = controller.watches(
            Api::<Namespace>::all(client),
            watcher_config(),
            move |namespace| by_namespace.namespace(&namespace),
        );
    }

    Box::pin(
        controller
            .reconcile_on(triggers)
            .shutdown_on_signal()
            .run(hpo_project::reconcile, hpo_project::error_policy, ctx)
            .for_each(log_reconcile_result("ProjectHelmChart")),
    )
}

/// Build the Namespace controller
pub fn build_namespace_controller(
    client: Client,
    ctx: Arc<NamespaceContext>,
    triggers: EnqueueReceiver<Namespace>,
) -> ControllerFuture {
    let namespaces: Api<Namespace> = Api::all(client);

    tracing::info!("- Namespace controller");

    Box::pin(
        Controller::new(namespaces, watcher_config())
            .reconcile_on(triggers)
            .shutdown_on_signal()
            .run(hpo_namespace::reconcile, hpo_namespace::error_policy, ctx)
            .for_each(log_reconcile_result("Namespace")),
    )
}

/// Create a closure that logs reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
