use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::CoordinatorContext;
use crate::error::{CoordinationError, Result};
use crate::event::MembershipEventType;
use crate::node::NodeDetail;

pub(crate) async fn heartbeat_tick(ctx: Arc<CoordinatorContext>) {
    if !ctx.state.read().await.joined {
        return;
    }

    match beat(&ctx).await {
        Ok(()) => ctx.state.write().await.record_heartbeat_success(),
        Err(e) => {
            let failures = ctx.state.write().await.record_heartbeat_failure();
            tracing::warn!(
                node_id = %ctx.node_id(),
                group_id = %ctx.group_id(),
                failures,
                error = %e,
                "Failed to update heartbeat"
            );
            relinquish_if_unhealthy(&ctx).await;
        }
    }

    if let Err(e) = detect_failures(&ctx).await {
        tracing::warn!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            error = %e,
            "Failure detection scan failed"
        );
    }
}

/// Write our own heartbeat and, while coordinator, keep the lock fresh.
async fn beat(ctx: &CoordinatorContext) -> Result<()> {
    let now = Utc::now();

    if !ctx
        .store
        .update_heartbeat(ctx.node_id(), ctx.group_id(), now)
        .await?
    {
        rejoin(ctx).await?;
    }

    let is_coordinator = ctx.state.read().await.is_coordinator();
    if is_coordinator
        && !ctx
            .store
            .refresh_coordinator_lock(ctx.group_id(), ctx.node_id(), now)
            .await?
    {
        ctx.state.write().await.become_follower(None);
        tracing::warn!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            "Coordinator lock lost, stepping down"
        );
    }

    Ok(())
}

/// Our heartbeat row is gone: a peer declared us dead while we were stalled.
/// Register again so the group picks us back up as a new member.
async fn rejoin(ctx: &CoordinatorContext) -> Result<()> {
    tracing::warn!(
        node_id = %ctx.node_id(),
        group_id = %ctx.group_id(),
        "Heartbeat row missing, node was evicted; re-registering"
    );

    let properties = ctx.properties.read().await.clone();
    ctx.store.remove_node(ctx.node_id(), ctx.group_id()).await?;
    match ctx
        .store
        .add_node(ctx.node_id(), ctx.group_id(), &properties)
        .await
    {
        Ok(()) | Err(CoordinationError::DuplicateNode { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Step down after too many consecutive heartbeat failures so that a healthy
/// peer can take the lock instead of waiting on a coordinator that cannot
/// reach the store.
async fn relinquish_if_unhealthy(ctx: &CoordinatorContext) {
    let mut state = ctx.state.write().await;
    if !state.should_relinquish(ctx.config.max_heartbeat_failures) {
        return;
    }
    state.become_follower(None);
    drop(state);

    tracing::warn!(
        node_id = %ctx.node_id(),
        group_id = %ctx.group_id(),
        max_failures = ctx.config.max_heartbeat_failures,
        "Relinquishing coordinator role after repeated heartbeat failures"
    );

    // Best effort: the store is likely unreachable, peers fall back to
    // detecting our stale heartbeat
    if let Err(e) = ctx
        .store
        .release_coordinator_lock(ctx.group_id(), ctx.node_id())
        .await
    {
        tracing::debug!(
            node_id = %ctx.node_id(),
            group_id = %ctx.group_id(),
            error = %e,
            "Could not release coordinator lock"
        );
    }
}

/// Evict peers with stale heartbeats and announce peers not yet announced.
///
/// Several nodes may run this at once. Removal and announcement are both
/// compare-and-swap writes, so each dead or new node produces exactly one
/// round of events no matter how many detectors saw it. A failure on one peer
/// is logged and the scan moves on to the next.
pub(crate) async fn detect_failures(ctx: &CoordinatorContext) -> Result<()> {
    let now = Utc::now();
    let threshold = ctx.failure_threshold();
    let members = ctx.store.get_all_node_details(ctx.group_id()).await?;

    for member in members.iter().filter(|m| m.node_id != ctx.node_id()) {
        let Some(last_heartbeat) = member.last_heartbeat else {
            continue;
        };
        if now - last_heartbeat <= threshold {
            continue;
        }
        if let Err(e) = evict(ctx, member, last_heartbeat, now).await {
            tracing::warn!(
                node_id = %ctx.node_id(),
                group_id = %ctx.group_id(),
                peer_id = %member.node_id,
                error = %e,
                "Failed to evict stale peer"
            );
        }
    }

    for member in members.iter().filter(|m| m.is_new_node) {
        if let Err(e) = announce(ctx, member).await {
            tracing::warn!(
                node_id = %ctx.node_id(),
                group_id = %ctx.group_id(),
                peer_id = %member.node_id,
                error = %e,
                "Failed to announce new member"
            );
        }
    }

    Ok(())
}

async fn evict(
    ctx: &CoordinatorContext,
    member: &NodeDetail,
    last_heartbeat: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    if !ctx
        .store
        .remove_stale_node(&member.node_id, ctx.group_id(), last_heartbeat)
        .await?
    {
        tracing::debug!(
            node_id = %ctx.node_id(),
            peer_id = %member.node_id,
            "Stale peer already handled elsewhere"
        );
        return Ok(());
    }

    tracing::warn!(
        node_id = %ctx.node_id(),
        group_id = %ctx.group_id(),
        peer_id = %member.node_id,
        heartbeat_age_ms = (now - last_heartbeat).num_milliseconds(),
        "Removed node with stale heartbeat"
    );

    // The row is gone, so no other detector will ever send this notice
    ctx.store
        .write_membership_event_for_all(
            ctx.group_id(),
            MembershipEventType::MemberRemoved,
            &member.node_id,
            Some(&member.properties),
        )
        .await?;

    // Best effort: a lock left behind is taken over once its holder has no heartbeat
    match ctx
        .store
        .release_coordinator_lock(ctx.group_id(), &member.node_id)
        .await
    {
        Ok(true) => tracing::info!(
            group_id = %ctx.group_id(),
            peer_id = %member.node_id,
            "Cleared coordinator lock held by dead node"
        ),
        Ok(false) => {}
        Err(e) => tracing::debug!(
            group_id = %ctx.group_id(),
            peer_id = %member.node_id,
            error = %e,
            "Could not clear coordinator lock of dead node"
        ),
    }

    Ok(())
}

async fn announce(ctx: &CoordinatorContext, member: &NodeDetail) -> Result<()> {
    if !ctx
        .store
        .mark_node_observed(&member.node_id, ctx.group_id())
        .await?
    {
        return Ok(());
    }

    let notified = ctx
        .store
        .write_membership_event_for_all(
            ctx.group_id(),
            MembershipEventType::MemberAdded,
            &member.node_id,
            None,
        )
        .await?;
    tracing::info!(
        group_id = %ctx.group_id(),
        peer_id = %member.node_id,
        notified,
        "Announced new member"
    );
    Ok(())
}
