//! Registration namespace discovery

use hpo_namespace::NamespaceContext;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::Client;

/// Run the namespace handler over a fresh listing so the registry is
/// complete before any ProjectHelmChart is reconciled
pub async fn register_project_namespaces(
    client: &Client,
    ctx: &NamespaceContext,
) -> anyhow::Result<()> {
    let namespaces = Api::<Namespace>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| anyhow::anyhow!("failed to list namespaces: {}", e))?;
    ctx.replay(&namespaces.items).await?;
    Ok(())
}
