use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::election::{election_tick, run_election_round};
use super::heartbeat::heartbeat_tick;
use super::listener::listener_tick;
use super::timer::jittered;
use super::{run_periodic, CoordinationStrategy, CoordinatorContext, CoordinatorRole};
use crate::config::CoordinationConfig;
use crate::error::{CoordinationError, Result};
use crate::event::MemberEventListener;
use crate::node::{NodeDetail, PropertiesMap};
use crate::storage::RdbmsStore;

struct TaskSet {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Coordination backend built on the shared relational store.
///
/// One instance represents one node in one group. Construct it, optionally
/// register listeners, then `join_group`. Background tasks run until `stop`.
pub struct RdbmsCoordinationStrategy {
    ctx: Arc<CoordinatorContext>,
    tasks: Mutex<Option<TaskSet>>,
}

impl RdbmsCoordinationStrategy {
    pub fn new(config: CoordinationConfig, store: RdbmsStore) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            ctx: Arc::new(CoordinatorContext::new(config, store)),
            tasks: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    pub fn group_id(&self) -> &str {
        self.ctx.group_id()
    }

    pub fn store(&self) -> &RdbmsStore {
        &self.ctx.store
    }

    pub async fn role(&self) -> CoordinatorRole {
        self.ctx.state.read().await.role
    }

    pub async fn is_joined(&self) -> bool {
        self.ctx.state.read().await.joined
    }

    /// Coordinator id as last seen by this node's election task
    pub async fn known_leader_id(&self) -> Option<String> {
        self.ctx.state.read().await.leader_id.clone()
    }

    pub async fn remove_event_listener(&self, listener: &Arc<dyn MemberEventListener>) -> bool {
        self.ctx.listeners.unregister(listener).await
    }

    async fn register(&self, properties: &PropertiesMap) -> Result<()> {
        match self
            .ctx
            .store
            .add_node(self.node_id(), self.group_id(), properties)
            .await
        {
            Ok(()) => Ok(()),
            Err(CoordinationError::DuplicateNode { .. }) => {
                tracing::warn!(
                    node_id = %self.node_id(),
                    group_id = %self.group_id(),
                    "Node already registered, treating as joined"
                );
                self.ctx
                    .store
                    .update_properties_map(self.node_id(), self.group_id(), properties)
                    .await?;
                self.ctx
                    .store
                    .update_heartbeat(self.node_id(), self.group_id(), Utc::now())
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_tasks(&self) -> TaskSet {
        let token = CancellationToken::new();
        let config = &self.ctx.config;

        let heartbeat_period = config.heartbeat_interval();
        let heartbeat = tokio::spawn(run_periodic(
            "heartbeat",
            self.ctx.clone(),
            token.child_token(),
            move || heartbeat_period,
            heartbeat_tick,
        ));

        let election_period = config.election_interval();
        let election = tokio::spawn(run_periodic(
            "election",
            self.ctx.clone(),
            token.child_token(),
            move || jittered(election_period),
            election_tick,
        ));

        let listener_period = config.listener_poll_interval();
        let listener = tokio::spawn(run_periodic(
            "listener",
            self.ctx.clone(),
            token.child_token(),
            move || listener_period,
            listener_tick,
        ));

        TaskSet {
            token,
            handles: vec![heartbeat, election, listener],
        }
    }

    async fn load_leader(&self) -> Result<Option<NodeDetail>> {
        let Some(lock) = self.ctx.store.get_coordinator_lock(self.group_id()).await? else {
            return Ok(None);
        };
        self.ctx
            .store
            .get_node_data(&lock.coordinator_node_id, self.group_id())
            .await
    }
}

#[async_trait]
impl CoordinationStrategy for RdbmsCoordinationStrategy {
    async fn get_all_node_details(&self) -> Result<Vec<NodeDetail>> {
        self.ctx.store.get_all_node_details(self.group_id()).await
    }

    /// Falls back to the last coordinator seen when the store is unreachable.
    async fn get_leader_node(&self) -> Option<NodeDetail> {
        match self.load_leader().await {
            Ok(leader) => {
                self.ctx.state.write().await.last_known_leader = leader.clone();
                leader
            }
            Err(e) => {
                tracing::warn!(
                    node_id = %self.node_id(),
                    group_id = %self.group_id(),
                    error = %e,
                    "Coordinator lookup failed, returning last known coordinator"
                );
                self.ctx.state.read().await.last_known_leader.clone()
            }
        }
    }

    async fn is_leader_node(&self) -> bool {
        self.ctx.state.read().await.is_coordinator()
    }

    async fn register_event_listener(&self, listener: Arc<dyn MemberEventListener>) {
        if listener.group_id() != self.group_id() {
            tracing::warn!(
                node_id = %self.node_id(),
                group_id = %self.group_id(),
                listener_group = %listener.group_id(),
                "Listener subscribes to a different group and will not receive events"
            );
        }
        self.ctx.listeners.register(listener).await;
    }

    async fn join_group(&self) -> Result<()> {
        let properties = self.ctx.properties.read().await.clone();
        self.join_group_with_properties(properties).await
    }

    async fn join_group_with_properties(&self, properties: PropertiesMap) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        *self.ctx.properties.write().await = properties.clone();

        if tasks.is_some() {
            tracing::debug!(
                node_id = %self.node_id(),
                group_id = %self.group_id(),
                "Already joined, updating properties only"
            );
            self.ctx
                .store
                .update_properties_map(self.node_id(), self.group_id(), &properties)
                .await?;
            return Ok(());
        }

        self.register(&properties).await?;
        self.ctx.state.write().await.join();

        tracing::info!(
            node_id = %self.node_id(),
            group_id = %self.group_id(),
            heartbeat_interval_ms = self.ctx.config.heartbeat_interval_ms,
            failure_threshold_ms = self.ctx.config.failure_threshold_ms,
            "Joined group"
        );

        // First attempt right away; the election task keeps trying afterwards
        if let Err(e) = run_election_round(&self.ctx).await {
            tracing::warn!(
                node_id = %self.node_id(),
                group_id = %self.group_id(),
                error = %e,
                "Initial election attempt failed"
            );
        }

        *tasks = Some(self.spawn_tasks());
        Ok(())
    }

    async fn set_properties_map(&self, properties: PropertiesMap) -> Result<()> {
        *self.ctx.properties.write().await = properties.clone();

        if !self.is_joined().await {
            return Ok(());
        }

        // A missing row means we were evicted; the heartbeat task re-registers
        // with the properties cached above
        if !self
            .ctx
            .store
            .update_properties_map(self.node_id(), self.group_id(), &properties)
            .await?
        {
            tracing::debug!(
                node_id = %self.node_id(),
                "Node row missing while updating properties"
            );
        }
        Ok(())
    }

    /// Graceful leave: halt the tasks, deregister, tell the remaining members,
    /// then give up the coordinator lock.
    ///
    /// The node only counts as left once the store has been cleaned up. If that
    /// fails the error is returned and calling `stop` again retries it.
    async fn stop(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        if let Some(task_set) = tasks.take() {
            task_set.token.cancel();
            for handle in task_set.handles {
                if let Err(e) = handle.await {
                    tracing::warn!(
                        node_id = %self.node_id(),
                        error = %e,
                        "Coordination task ended abnormally"
                    );
                }
            }
            // Nothing keeps the lock fresh any more
            self.ctx.state.write().await.become_follower(None);
        }

        if !self.is_joined().await {
            return Ok(());
        }

        let store = &self.ctx.store;
        let properties = self.ctx.properties.read().await.clone();

        store
            .deregister_node(self.node_id(), self.group_id(), &properties)
            .await?;

        // Released after deregistering so the next coordinator's announcement
        // does not target this node
        if store
            .release_coordinator_lock(self.group_id(), self.node_id())
            .await?
        {
            tracing::info!(
                node_id = %self.node_id(),
                group_id = %self.group_id(),
                "Released coordinator lock"
            );
        }

        // Anything queued for us in the meantime has no reader any more
        store
            .read_membership_events(self.node_id(), self.group_id())
            .await?;

        self.ctx.state.write().await.leave();
        tracing::info!(
            node_id = %self.node_id(),
            group_id = %self.group_id(),
            "Left group"
        );
        Ok(())
    }
}
