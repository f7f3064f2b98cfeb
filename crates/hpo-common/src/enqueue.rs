//! Cross-controller re-enqueue handles
//!
//! A controller that learns about a change relevant to objects owned by
//! another controller pushes their keys through an [`Enqueuer`]. The
//! receiving controller feeds the stream to `Controller::reconcile_on`.

use futures::channel::mpsc;
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use tracing::trace;

/// Sending side of a reconcile trigger channel
pub struct Enqueuer<K: Resource<DynamicType = ()>> {
    tx: mpsc::UnboundedSender<ObjectRef<K>>,
}

impl<K: Resource<DynamicType = ()>> Clone for Enqueuer<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Receiving side, handed to `Controller::reconcile_on`
pub type EnqueueReceiver<K> = mpsc::UnboundedReceiver<ObjectRef<K>>;

impl<K: Resource<DynamicType = ()>> Enqueuer<K> {
    /// New trigger channel
    pub fn channel() -> (Self, EnqueueReceiver<K>) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }

    /// Queue a reconcile of `namespace/name` (`namespace` is None for cluster-scoped kinds)
    pub fn enqueue(&self, namespace: Option<&str>, name: &str) {
        let mut obj_ref = ObjectRef::<K>::new(name);
        if let Some(ns) = namespace {
            obj_ref = obj_ref.within(ns);
        }
        trace!(object = %obj_ref, "enqueue");
        // A closed receiver means the controller is shutting down
        let _ = self.tx.unbounded_send(obj_ref);
    }
}
