//! Helm project operator - deploys one embedded Helm chart per project
//!
//! Startup order:
//! 1. CLI, logging, `--crd`
//! 2. option validation and chart extraction
//! 3. CRD install, health server, leader election
//! 4. watch caches and binding driver
//! 5. registration namespace replay (label-based modes) and cleanup label removal
//! 6. controllers and removal watcher, then ready

mod controller_runner;
mod health;
mod startup;

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use hpo_common::apply::{KubeApplier, ResourceApplier};
use hpo_common::cache::{StoreCache, WatchCache};
use hpo_common::chart::ChartFiles;
use hpo_common::crd::ProjectHelmChart;
use hpo_common::enqueue::Enqueuer;
use hpo_common::leader_election::LeaderElector;
use hpo_common::options::{OperatorOptions, ProjectMode};
use hpo_common::telemetry::{init_telemetry, TelemetryConfig};
use hpo_common::{DEFAULT_CONTROLLER_NAME, DEFAULT_SYSTEM_NAMESPACE};
use hpo_namespace::NamespaceContext;
use hpo_project::{
    ChartResolvers, ChartStatusClient, KubeChartStatusClient, ProjectContext, ProjectReconciler,
    RemovalHandler,
};
use hpo_rbac::{BindingDriver, SubjectRoleGetter, SubjectRoleTracker};
use kube::{Client, CustomResourceExt};

use controller_runner::{build_namespace_controller, build_project_controller, ProjectControllerParams};
use health::{start_health_server, Readiness};

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Parser, Debug)]
#[command(name = "helm-project-operator", version, about = "Deploys a Helm chart into every project that asks for it")]
struct Cli {
    /// Print the ProjectHelmChart CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Namespace the operator runs in
    #[arg(long, env = "NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    namespace: String,

    /// Release name suffix of the embedded chart
    #[arg(long, env = "RELEASE_NAME", default_value = "")]
    release_name: String,

    /// spec.helmApiVersion handled by this operator
    #[arg(long, env = "HELM_API_VERSION", default_value = "")]
    helm_api_version: String,

    /// Base64 encoded chart archive
    #[arg(long, env = "CHART_CONTENT", default_value = "", hide_env_values = true)]
    chart_content: String,

    /// Additional namespaces that never belong to a project
    #[arg(long, env = "SYSTEM_NAMESPACES", value_delimiter = ',')]
    system_namespaces: Vec<String>,

    /// Label grouping namespaces into projects
    #[arg(long, env = "PROJECT_LABEL")]
    project_label: Option<String>,

    /// Project id of the system project
    #[arg(long, env = "SYSTEM_PROJECT_LABEL_VALUE")]
    system_project_label_value: Option<String>,

    /// Cluster id prefixed onto project annotations
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Cluster role backing the admin slot
    #[arg(long, env = "ADMIN_CLUSTER_ROLE")]
    admin_cluster_role: Option<String>,

    /// Cluster role backing the edit slot
    #[arg(long, env = "EDIT_CLUSTER_ROLE")]
    edit_cluster_role: Option<String>,

    /// Cluster role backing the view slot
    #[arg(long, env = "VIEW_CLUSTER_ROLE")]
    view_cluster_role: Option<String>,

    /// Allow only one release per registration namespace
    #[arg(long, env = "SINGLETON")]
    singleton: bool,

    /// Image of the helm job
    #[arg(long, env = "HELM_JOB_IMAGE")]
    helm_job_image: Option<String>,

    /// Registry injected into the chart values
    #[arg(long, env = "SYSTEM_DEFAULT_REGISTRY")]
    system_default_registry: Option<String>,

    /// Rancher URL injected into the chart values
    #[arg(long, env = "CATTLE_URL")]
    cattle_url: Option<String>,

    /// Node the operator runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Field manager and lease prefix
    #[arg(long, env = "CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    /// Subjects returned for an empty target set: none or cluster-scoped
    #[arg(long, env = "EMPTY_TARGET_SUBJECTS", default_value = "none")]
    empty_target_subjects: String,

    /// Leader election identity (defaults to the pod hostname)
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Port of the health endpoints
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl Cli {
    /// Convert the flags into operator options (not yet validated)
    fn options(&self) -> anyhow::Result<OperatorOptions> {
        Ok(OperatorOptions {
            system_namespace: self.namespace.clone(),
            release_name: self.release_name.clone(),
            helm_api_version: self.helm_api_version.clone(),
            chart_content: self.chart_content.clone(),
            system_namespaces: self
                .system_namespaces
                .iter()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect(),
            project_label: self.project_label.clone(),
            system_project_label_value: self.system_project_label_value.clone(),
            cluster_id: self.cluster_id.clone(),
            admin_cluster_role: self.admin_cluster_role.clone(),
            edit_cluster_role: self.edit_cluster_role.clone(),
            view_cluster_role: self.view_cluster_role.clone(),
            singleton: self.singleton,
            helm_job_image: self.helm_job_image.clone(),
            system_default_registry: self.system_default_registry.clone(),
            cattle_url: self.cattle_url.clone(),
            node_name: self.node_name.clone(),
            controller_name: self.controller_name.clone(),
            empty_target_subjects: self.empty_target_subjects.parse()?,
        })
    }

    fn identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("{}-{}", self.controller_name, std::process::id()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&ProjectHelmChart::crd())?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: cli.log_format == LogFormat::Json,
        ..Default::default()
    })?;

    let opts = Arc::new(cli.options()?);
    opts.validate()?;
    let files = ChartFiles::from_base64_tgz(&opts.chart_content)?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    startup::ensure_crds_installed(&client, &opts.controller_name).await?;

    let readiness = Readiness::default();
    tokio::spawn(start_health_server(cli.health_port, readiness.clone()));

    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        &opts.lease_name(),
        &opts.system_namespace,
        &cli.identity(),
        &opts.controller_name,
    ));
    let mut guard = elector.acquire().await?;

    // Watch caches and the subject index
    let (store, cache_futures) = StoreCache::new(client.clone());
    for future in cache_futures {
        tokio::spawn(future);
    }
    store.wait_until_ready().await?;
    let cache: Arc<dyn WatchCache> = Arc::new(store);

    let (namespace_queue, namespace_triggers) = Enqueuer::channel();
    let (chart_queue, chart_triggers) = Enqueuer::channel();

    let tracker = Arc::new(SubjectRoleTracker::new(opts.empty_target_subjects));
    let driver = Arc::new(BindingDriver::new(
        &opts,
        tracker.clone(),
        cache.clone(),
        namespace_queue.clone(),
    ));
    tokio::spawn(driver.run(client.clone()));
    let subjects: Arc<dyn SubjectRoleGetter> = tracker;

    let applier: Arc<dyn ResourceApplier> =
        Arc::new(KubeApplier::new(client.clone(), &opts.controller_name));

    let namespace_ctx = Arc::new(NamespaceContext::new(
        opts.clone(),
        files,
        cache.clone(),
        applier.clone(),
        subjects.clone(),
        namespace_queue,
        chart_queue.clone(),
    ));
    if opts.mode().project_label().is_some() {
        startup::register_project_namespaces(&client, &namespace_ctx).await?;
    }

    let status: Arc<dyn ChartStatusClient> =
        Arc::new(KubeChartStatusClient::new(client.clone(), &opts.controller_name));
    startup::remove_cleanup_labels(&client, status.as_ref()).await?;

    let reconciler = ProjectReconciler::new(
        opts.clone(),
        namespace_ctx.project_getter(),
        subjects,
        cache.clone(),
    );
    let project_ctx = Arc::new(ProjectContext::new(reconciler, applier.clone(), status));

    let removal = Arc::new(RemovalHandler::new(
        opts.clone(),
        cache.clone(),
        applier,
        chart_queue,
    ));
    tokio::spawn(removal.run(client.clone()));

    tracing::info!("Starting controllers:");
    let controllers = vec![
        build_project_controller(
            client.clone(),
            project_ctx,
            ProjectControllerParams {
                system_namespace: opts.system_namespace.clone(),
                watch_release_namespaces: matches!(opts.mode(), ProjectMode::SystemProject { .. }),
                resolvers: Arc::new(ChartResolvers::new(&opts, cache)),
                triggers: chart_triggers,
            },
        ),
        build_namespace_controller(client, namespace_ctx, namespace_triggers),
    ];

    readiness.mark_ready();
    tracing::info!(release = %opts.release_name, "helm project operator ready");

    tokio::select! {
        _ = guard.lost() => {
            tracing::error!("leadership lost, stopping");
            return Err(anyhow::anyhow!("leader election lost"));
        }
        _ = futures::future::join_all(controllers) => {
            tracing::info!("controllers stopped");
        }
    }

    if let Err(e) = guard.release_leadership().await {
        tracing::warn!(error = %e, "failed to release leadership");
    }
    tracing::info!("helm project operator shutting down");
    Ok(())
}
