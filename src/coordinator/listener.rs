use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::CoordinatorContext;
use crate::error::Result;
use crate::event::{MemberEvent, MemberEventListener, MembershipEventType};
use crate::node::NodeDetail;

/// Listeners registered on one strategy instance.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn MemberEventListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, listener: Arc<dyn MemberEventListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub async fn unregister(&self, listener: &Arc<dyn MemberEventListener>) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Copy of the current list, so dispatch does not hold the lock while
    /// callbacks run.
    async fn snapshot(&self) -> Vec<Arc<dyn MemberEventListener>> {
        self.listeners.read().await.clone()
    }
}

pub(crate) async fn listener_tick(ctx: Arc<CoordinatorContext>) {
    if !ctx.state.read().await.joined {
        return;
    }
    if let Err(e) = poll_events(&ctx).await {
        tracing::warn!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            error = %e,
            "Failed to read membership events"
        );
    }
}

/// Drain this node's event queue and dispatch it. Returns the number of
/// events taken from the store.
pub(crate) async fn poll_events(ctx: &CoordinatorContext) -> Result<usize> {
    let events = ctx
        .store
        .read_membership_events(ctx.node_id(), ctx.group_id())
        .await?;

    if events.is_empty() {
        tracing::trace!(node_id = %ctx.node_id(), "No membership events to sync");
        return Ok(0);
    }

    let listeners = ctx.listeners.snapshot().await;
    for event in &events {
        dispatch(ctx, &listeners, event).await;
    }
    Ok(events.len())
}

async fn dispatch(
    ctx: &CoordinatorContext,
    listeners: &[Arc<dyn MemberEventListener>],
    event: &MemberEvent,
) {
    let interested: Vec<&Arc<dyn MemberEventListener>> = listeners
        .iter()
        .filter(|l| l.group_id() == event.target_group_id)
        .collect();
    if interested.is_empty() {
        return;
    }

    let Some(node) = resolve_subject(ctx, event).await else {
        return;
    };

    tracing::debug!(
        node_id = %ctx.node_id(),
        sequence = event.sequence,
        event_type = %event.event_type,
        subject = %event.subject_node_id,
        listeners = interested.len(),
        "Dispatching membership event"
    );

    for listener in interested {
        let outcome = catch_unwind(AssertUnwindSafe(|| match event.event_type {
            MembershipEventType::MemberAdded => listener.member_added(&node),
            MembershipEventType::MemberRemoved => listener.member_removed(&node),
            MembershipEventType::CoordinatorChanged => listener.coordinator_changed(&node),
        }));
        if outcome.is_err() {
            tracing::error!(
                node_id = %ctx.node_id(),
                event_type = %event.event_type,
                subject = %event.subject_node_id,
                "Membership listener panicked"
            );
        }
    }
}

/// Build the `NodeDetail` handed to listeners.
///
/// Removed nodes are already gone from the registry, so their detail comes
/// from the snapshot stored with the event. For the other kinds the subject is
/// looked up; if it has left in the meantime the event is skipped.
async fn resolve_subject(ctx: &CoordinatorContext, event: &MemberEvent) -> Option<NodeDetail> {
    if event.event_type == MembershipEventType::MemberRemoved {
        let properties = event.subject_properties.clone().unwrap_or_default();
        return Some(
            NodeDetail::new(&event.subject_node_id, &event.target_group_id)
                .with_properties(properties),
        );
    }

    match ctx
        .store
        .get_node_data(&event.subject_node_id, &event.target_group_id)
        .await
    {
        Ok(Some(node)) => Some(node),
        Ok(None) => {
            tracing::debug!(
                node_id = %ctx.node_id(),
                subject = %event.subject_node_id,
                event_type = %event.event_type,
                "Event subject no longer registered, skipping"
            );
            None
        }
        Err(e) => {
            tracing::warn!(
                node_id = %ctx.node_id(),
                subject = %event.subject_node_id,
                error = %e,
                "Failed to resolve event subject"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Named {
        group: String,
        seen: Mutex<Vec<String>>,
    }

    impl MemberEventListener for Named {
        fn group_id(&self) -> &str {
            &self.group
        }
        fn member_added(&self, node: &NodeDetail) {
            self.seen.lock().unwrap().push(node.node_id.clone());
        }
        fn member_removed(&self, _node: &NodeDetail) {}
        fn coordinator_changed(&self, _node: &NodeDetail) {}
    }

    fn named(group: &str) -> Arc<dyn MemberEventListener> {
        Arc::new(Named {
            group: group.to_string(),
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let registry = ListenerRegistry::new();
        assert!(registry.snapshot().await.is_empty());

        let a = named("G");
        let b = named("G");
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;
        assert_eq!(registry.snapshot().await.len(), 2);

        assert!(registry.unregister(&a).await);
        assert!(!registry.unregister(&a).await);
        let remaining = registry.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &b));
    }
}
