use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use crate::{
    envelope::Envelope,
    types::{ActorId, ProcessId, RpcId},
};

/// Maps a process id to the address its inner service listens on
pub trait AddressResolver {
    fn resolve(&self, process: ProcessId) -> Option<SocketAddr>;
}

impl AddressResolver for HashMap<ProcessId, SocketAddr> {
    fn resolve(&self, process: ProcessId) -> Option<SocketAddr> {
        self.get(&process).copied()
    }
}

/// Answers whether an entity is hosted by this process
pub trait LocalActors {
    fn hosts(&self, actor_id: &ActorId) -> bool;
}

impl LocalActors for HashSet<ActorId> {
    fn hosts(&self, actor_id: &ActorId) -> bool {
        self.contains(actor_id)
    }
}

impl<V> LocalActors for HashMap<ActorId, V> {
    fn hosts(&self, actor_id: &ActorId) -> bool {
        self.contains_key(actor_id)
    }
}

/// Where an actor-class envelope has to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorRoute {
    /// Entity lives here; queue onto its mailbox
    Local(ActorId),
    /// Entity claims this process but is not registered
    NotFound(ActorId),
    /// Entity lives on another process reachable at `address`
    Forward {
        actor_id: ActorId,
        process: ProcessId,
        address: SocketAddr,
    },
    /// Entity lives on a process with no known address
    Unroutable(ActorId),
}

/// Decides where an actor-class envelope goes.
///
/// Local hosting wins; otherwise the process half of the actor id selects the
/// target, which must resolve to an address.
pub fn route_actor(
    actor_id: ActorId,
    local_process: ProcessId,
    local: &dyn LocalActors,
    resolver: &dyn AddressResolver,
) -> ActorRoute {
    if local.hosts(&actor_id) {
        return ActorRoute::Local(actor_id);
    }
    if actor_id.process == local_process {
        return ActorRoute::NotFound(actor_id);
    }
    match resolver.resolve(actor_id.process) {
        Some(address) => ActorRoute::Forward {
            actor_id,
            process: actor_id.process,
            address,
        },
        None => ActorRoute::Unroutable(actor_id),
    }
}

/// Rewrites an envelope for the inner hop, preserving opcode, actor id and
/// body. Requests get the gateway's own rpc id for the inner session.
///
/// Nothing about the originating session travels with it: the hosting process
/// replies on the inner session and the gateway maps that reply back to its
/// caller through its relay table. Messages go out byte for byte.
pub fn rewrite_for_forward(envelope: &Envelope, inner_rpc_id: Option<RpcId>) -> Envelope {
    let mut forwarded = envelope.clone();
    if let Some(rpc_id) = inner_rpc_id {
        forwarded.rpc_id = rpc_id;
    }
    forwarded
}
