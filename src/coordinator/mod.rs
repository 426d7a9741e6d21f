//! Membership and coordinator election driven entirely through the shared store.
//!
//! Each [`RdbmsCoordinationStrategy`] runs three periodic tasks once it joins:
//!
//! - **heartbeat**: refreshes this node's heartbeat (and the coordinator lock
//!   while holding it), then evicts peers whose heartbeat is older than the
//!   failure threshold and announces newly joined peers
//! - **election**: claims the coordinator lock when it is vacant or its holder
//!   is dead
//! - **listener**: drains this node's membership events and hands them to the
//!   registered [`MemberEventListener`]s
//!
//! The tasks never talk to each other in-process; everything they agree on
//! goes through the store, so the same rules hold across process boundaries.

mod election;
mod heartbeat;
mod listener;
pub mod state;
mod strategy;
pub mod timer;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinationConfig;
use crate::error::Result;
use crate::event::MemberEventListener;
use crate::node::{NodeDetail, PropertiesMap};
use crate::storage::RdbmsStore;

pub use listener::ListenerRegistry;
pub use state::{CoordinatorRole, CoordinatorState};
pub use strategy::RdbmsCoordinationStrategy;

/// Contract shared by every coordination backend.
#[async_trait]
pub trait CoordinationStrategy: Send + Sync {
    /// Members of this node's group
    async fn get_all_node_details(&self) -> Result<Vec<NodeDetail>>;

    /// Current coordinator of the group, if any
    async fn get_leader_node(&self) -> Option<NodeDetail>;

    async fn is_leader_node(&self) -> bool;

    async fn register_event_listener(&self, listener: Arc<dyn MemberEventListener>);

    /// Join with the properties last given to `set_properties_map` (empty by default)
    async fn join_group(&self) -> Result<()>;

    async fn join_group_with_properties(&self, properties: PropertiesMap) -> Result<()>;

    /// Replace the local node's published properties
    async fn set_properties_map(&self, properties: PropertiesMap) -> Result<()>;

    /// Leave the group and halt background work
    async fn stop(&self) -> Result<()>;
}

/// State shared between the façade and its background tasks
pub(crate) struct CoordinatorContext {
    pub config: CoordinationConfig,
    pub store: RdbmsStore,
    pub state: RwLock<CoordinatorState>,
    pub properties: RwLock<PropertiesMap>,
    pub listeners: ListenerRegistry,
}

impl CoordinatorContext {
    pub fn new(config: CoordinationConfig, store: RdbmsStore) -> Self {
        Self {
            config,
            store,
            state: RwLock::new(CoordinatorState::new()),
            properties: RwLock::new(PropertiesMap::new()),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn failure_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.failure_threshold_ms as i64)
    }
}

/// Run `tick` every `period` until `token` is cancelled.
///
/// Each tick runs as its own task, so a panic inside it is logged and the
/// schedule carries on. Cancellation is only observed between ticks: an
/// in-flight tick always completes.
pub(crate) async fn run_periodic<F, Fut>(
    name: &'static str,
    ctx: Arc<CoordinatorContext>,
    token: CancellationToken,
    period: impl Fn() -> Duration + Send,
    tick: F,
) where
    F: Fn(Arc<CoordinatorContext>) -> Fut + Send,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period()) => {}
        }

        if let Err(e) = tokio::spawn(tick(ctx.clone())).await {
            tracing::error!(
                task = name,
                node_id = %ctx.node_id(),
                group_id = %ctx.group_id(),
                error = %e,
                "Coordination task tick panicked"
            );
        }
    }

    tracing::debug!(
        task = name,
        node_id = %ctx.node_id(),
        group_id = %ctx.group_id(),
        "Coordination task stopped"
    );
}
