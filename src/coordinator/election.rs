use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{CoordinatorContext, CoordinatorRole};
use crate::error::Result;
use crate::event::MembershipEventType;
use crate::storage::CoordinatorLock;

pub(crate) async fn election_tick(ctx: Arc<CoordinatorContext>) {
    if !ctx.state.read().await.joined {
        return;
    }
    if let Err(e) = run_election_round(&ctx).await {
        tracing::warn!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            error = %e,
            "Election round failed"
        );
    }
}

/// One pass of the election state machine.
///
/// - lock held by us: stay (or become) coordinator
/// - lock held by a live peer: follow it
/// - lock vacant, or holder dead: become candidate and try a conditional write;
///   the first write to land wins, everyone else falls back to follower
/// - own heartbeat failing repeatedly: follow without standing
pub(crate) async fn run_election_round(ctx: &CoordinatorContext) -> Result<()> {
    let now = Utc::now();
    let current = ctx.store.get_coordinator_lock(ctx.group_id()).await?;

    // A node that cannot keep its own heartbeat up must not grab the lock it
    // would only have to give up again
    let unhealthy = ctx.state.read().await.consecutive_heartbeat_failures
        >= ctx.config.max_heartbeat_failures;
    if unhealthy && current.as_ref().map(|l| l.coordinator_node_id.as_str()) != Some(ctx.node_id()) {
        tracing::debug!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            "Heartbeat failing, not standing for election"
        );
        follow(ctx, current.map(|l| l.coordinator_node_id)).await;
        return Ok(());
    }

    let won = match current {
        Some(lock) if lock.coordinator_node_id == ctx.node_id() => {
            let previous = ctx.state.write().await.become_coordinator(ctx.node_id());
            if previous != CoordinatorRole::Coordinator {
                tracing::info!(
                    node_id = %ctx.node_id(),
                    group_id = %ctx.group_id(),
                    "Resumed coordinator role from existing lock"
                );
            }
            return Ok(());
        }
        Some(lock) => {
            if holder_is_alive(ctx, &lock, now).await? {
                follow(ctx, Some(lock.coordinator_node_id)).await;
                return Ok(());
            }

            ctx.state.write().await.become_candidate();
            tracing::info!(
                node_id = %ctx.node_id(),
                group_id = %ctx.group_id(),
                stale_coordinator = %lock.coordinator_node_id,
                "Coordinator is dead, attempting takeover"
            );
            ctx.store
                .take_over_coordinator_lock(&lock, ctx.node_id(), now)
                .await?
        }
        None => {
            ctx.state.write().await.become_candidate();
            tracing::debug!(
                node_id = %ctx.node_id(),
                group_id = %ctx.group_id(),
                "No coordinator recorded, attempting to acquire lock"
            );
            ctx.store
                .try_acquire_coordinator_lock(ctx.group_id(), ctx.node_id(), now)
                .await?
        }
    };

    if won {
        ctx.state.write().await.become_coordinator(ctx.node_id());
        let notified = ctx
            .store
            .write_membership_event_for_all(
                ctx.group_id(),
                MembershipEventType::CoordinatorChanged,
                ctx.node_id(),
                None,
            )
            .await?;
        tracing::info!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            notified,
            "Became coordinator"
        );
    } else {
        // Someone else's write landed first; learn who on the way out
        let winner = ctx
            .store
            .get_coordinator_lock(ctx.group_id())
            .await
            .ok()
            .flatten()
            .map(|lock| lock.coordinator_node_id);
        tracing::debug!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            winner = ?winner,
            "Lost coordinator election"
        );
        follow(ctx, winner).await;
    }

    Ok(())
}

/// The holder counts as alive while its heartbeat row exists and is fresh.
async fn holder_is_alive(
    ctx: &CoordinatorContext,
    lock: &CoordinatorLock,
    now: DateTime<Utc>,
) -> Result<bool> {
    let holder = ctx
        .store
        .get_node_data(&lock.coordinator_node_id, ctx.group_id())
        .await?;

    Ok(match holder.and_then(|h| h.heartbeat_age(now)) {
        Some(age) => age <= ctx.failure_threshold(),
        None => false,
    })
}

async fn follow(ctx: &CoordinatorContext, leader_id: Option<String>) {
    let previous = ctx.state.write().await.become_follower(leader_id);
    if previous == CoordinatorRole::Coordinator {
        tracing::warn!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            "Coordinator lock now belongs to another node, stepping down"
        );
    }
}
