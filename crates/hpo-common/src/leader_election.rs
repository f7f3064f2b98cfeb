//! Leader election using Kubernetes Leases
//!
//! Only one operator instance per release may run the reconcile loops. The
//! instance holding the coordination.k8s.io/v1 Lease
//! `<controllerName>-<releaseName>-lock` in the system namespace is the
//! leader; everyone else waits.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Returns true if a lease last renewed at `renew_time` has run out at `now`
pub fn is_lease_expired(
    renew_time: Option<DateTime<Utc>>,
    duration_secs: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    field_manager: String,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new leader elector (30s lease, 10s renew, 5s retry)
    pub fn new(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        field_manager: &str,
    ) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            field_manager: field_manager.to_string(),
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this instance currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease. When a renewal fails the guard's
    /// `lost()` future resolves.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard, LeaderElectionError> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = RETRY_INTERVAL.as_secs(),
                        "lease held by another instance"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = RETRY_INTERVAL.as_secs(),
                        "failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return self.create_lease(&api, now).await,
            Err(e) => return Err(e.into()),
        };

        let spec = existing.spec.as_ref();
        if spec.and_then(|s| s.holder_identity.as_ref()) == Some(&self.identity) {
            return self.write_lease(&api, &existing, now, false).await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref()).map(|t| t.0);
        let duration = spec.and_then(|s| s.lease_duration_seconds);
        if is_lease_expired(renew_time, duration, now) {
            self.write_lease(&api, &existing, now, true).await
        } else {
            Ok(false)
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew our own lease, or take over an expired one
    async fn write_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: DateTime<Utc>,
        take_over: bool,
    ) -> Result<bool, LeaderElectionError> {
        if existing.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::MissingResourceVersion(
                self.lease_name.clone(),
            ));
        }

        let mut updated = existing.clone();
        let spec = updated.spec.get_or_insert_with(LeaseSpec::default);
        spec.renew_time = Some(MicroTime(now));
        if take_over {
            spec.holder_identity = Some(self.identity.clone());
            spec.lease_duration_seconds = Some(LEASE_DURATION.as_secs() as i32);
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }

        match api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                if take_over {
                    info!(identity = %self.identity, "took over expired lease");
                } else {
                    debug!(identity = %self.identity, "lease renewed");
                }
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, take_over, "lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past)
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder (graceful shutdown)
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        debug!(identity = %self.elector.identity, "leader guard dropped");
    }
}
