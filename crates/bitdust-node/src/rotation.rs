//! Rotation fan-out: the event-driven remapping that keeps data and
//! relationships alive when an identity URL changes.
//!
//! The rotator (and the identity responder, for peers) only emit
//! events; this subscriber performs the actual renames. Everything here
//! keys on the `nickname@host_port` user part embedded in global ids:
//! key ids, group files, queue ids and customer directories all carry
//! it and all move together.

use std::sync::Arc;

use tracing::{info, warn};

use bitdust_id::IdentityEvent;
use bitdust_shared::types::IdUrl;

use crate::context::NodeContext;

pub fn spawn_rotation_fanout(ctx: Arc<NodeContext>) {
    let mut events = ctx.bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(IdentityEvent::RotateComplete { old, new }) => {
                    local_rotation(&ctx, &old, &new).await;
                }
                Ok(IdentityEvent::PeerRotated { old, new }) => {
                    peer_rotation(&ctx, &old, &new).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "rotation fan-out lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Our own IDURL changed. Same key pair, new name everywhere.
async fn local_rotation(ctx: &Arc<NodeContext>, old: &IdUrl, new: &IdUrl) {
    let (Ok(old_user), Ok(new_user)) = (old.user(), new.user()) else {
        warn!(old = %old, new = %new, "rotation with unparsable idurl");
        return;
    };
    info!(old = %old, new = %new, "applying local rotation fan-out");

    // Keys: same bytes, same local ids, new key ids.
    if let Err(e) = ctx.keys.rename_for_user(&old_user, &new_user) {
        warn!(error = %e, "key rename failed");
    }

    // Group state files move with their key ids.
    if let Err(e) = ctx
        .groups_store
        .rename_for_user(&old_user.to_string(), &new_user.to_string())
    {
        warn!(error = %e, "group file rename failed");
    }

    // Active participants hold the old key id; stop them, they respawn
    // under the new one on the next join.
    for (key, handle) in ctx.groups.remove_user(&old_user).await {
        info!(group = %key, "participant stopped for rotation");
        handle.shutdown().await;
    }

    // Hosted queues embed our user part as the supplier.
    ctx.broker
        .local_rotated(old_user.clone(), new_user.clone())
        .await;

    // Slate: same suppliers, advertised under the new customer IDURL.
    ctx.suppliers.local_rotated(new.clone()).await;

    // Tell everyone who might still address the old URL.
    let peers: Vec<IdUrl> = ctx
        .registry
        .known()
        .into_iter()
        .filter(|p| *p != *new && *p != *old)
        .collect();
    let acked = ctx.propagator.propagate(&peers, true).await;
    let published = ctx.propagator.propagate_to_servers().await;
    if let Err(e) = ctx.propagator.publish_to_dht().await {
        warn!(error = %e, "identity DHT publish failed");
    }
    info!(peers = acked, servers = published, "rotation propagated");
}

/// A peer's IDURL changed (verified upstream: same public key).
async fn peer_rotation(ctx: &Arc<NodeContext>, old: &IdUrl, new: &IdUrl) {
    let (Ok(old_user), Ok(new_user)) = (old.user(), new.user()) else {
        return;
    };
    info!(old = %old, new = %new, "applying peer rotation fan-out");

    // Shares and groups the peer owns and granted to us.
    if let Err(e) = ctx.keys.rename_for_user(&old_user, &new_user) {
        warn!(error = %e, "peer key rename failed");
    }
    if let Err(e) = ctx
        .groups_store
        .rename_for_user(&old_user.to_string(), &new_user.to_string())
    {
        warn!(error = %e, "peer group file rename failed");
    }
    for (key, handle) in ctx.groups.remove_user(&old_user).await {
        info!(group = %key, "participant stopped for peer rotation");
        handle.shutdown().await;
    }

    // The peer as our supplier, as a broker, and as our customer.
    ctx.suppliers.peer_rotated(old.clone(), new.clone()).await;
    ctx.broker.peer_rotated(old.clone(), new.clone()).await;
    if let Err(e) = ctx.supplier_service.customer_rotated(old, new) {
        warn!(error = %e, "customer directory rename failed");
    }
}
