//! Small helpers for building and exchanging signed packets.

use std::time::Duration;

use bitdust_id::MyIdentity;
use bitdust_net::gate::{Delivery, FailReason, GateHandle};
use bitdust_shared::envelope::{Command, Envelope};
use bitdust_shared::payloads::Body;
use bitdust_shared::types::{IdUrl, PacketId};

use crate::error::{NodeError, Result};

/// Build a signed packet from this node to `remote`.
pub fn build(
    my_id: &MyIdentity,
    command: Command,
    remote: &IdUrl,
    body: &Body,
) -> Result<Envelope> {
    let me = my_id.idurl();
    Ok(Envelope::build(
        command,
        me.clone(),
        me,
        PacketId::random(),
        remote.clone(),
        body,
        my_id.local(),
    )?)
}

/// Build a signed packet whose owner field names another identity (used
/// for share traffic, where the owner of the data is the share owner).
pub fn build_for_owner(
    my_id: &MyIdentity,
    command: Command,
    owner: &IdUrl,
    remote: &IdUrl,
    body: &Body,
) -> Result<Envelope> {
    Ok(Envelope::build(
        command,
        owner.clone(),
        my_id.idurl(),
        PacketId::random(),
        remote.clone(),
        body,
        my_id.local(),
    )?)
}

/// Send a packet and wait for the response. `Fail` and exhaustion map to
/// typed node errors.
pub async fn request(
    gate: &GateHandle,
    my_id: &MyIdentity,
    command: Command,
    remote: &IdUrl,
    body: &Body,
    timeout: Option<Duration>,
) -> Result<Envelope> {
    let envelope = build(my_id, command, remote, body)?;
    send_request(gate, envelope, timeout).await
}

/// As [`request`], with an explicit data owner in the envelope.
pub async fn request_for_owner(
    gate: &GateHandle,
    my_id: &MyIdentity,
    command: Command,
    owner: &IdUrl,
    remote: &IdUrl,
    body: &Body,
    timeout: Option<Duration>,
) -> Result<Envelope> {
    let envelope = build_for_owner(my_id, command, owner, remote, body)?;
    send_request(gate, envelope, timeout).await
}

async fn send_request(
    gate: &GateHandle,
    envelope: Envelope,
    timeout: Option<Duration>,
) -> Result<Envelope> {
    let remote = envelope.remote_id.clone();
    let ticket = gate.outbox_with_timeout(envelope, false, timeout).await?;
    match ticket.wait().await {
        Delivery::Acked { response, .. } => Ok(response),
        Delivery::Dispatched => Err(NodeError::Refused(
            "no response expected for this command".into(),
        )),
        Delivery::Failed { reason, detail } => Err(match reason {
            FailReason::Refused => NodeError::Refused(detail),
            FailReason::Timeout => NodeError::Timeout(format!("{remote}: {detail}")),
            FailReason::Unreachable | FailReason::Cancelled => NodeError::Net(
                bitdust_net::error::NetError::Unreachable(format!("{remote}: {detail}")),
            ),
        }),
    }
}
