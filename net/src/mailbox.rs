use std::collections::{HashMap, VecDeque};

use actornet_shared::{ActorId, Envelope, LocalActors, SessionId};

/// One queued actor message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Session replies go back on; `None` when a local handler sent it
    pub reply_to: Option<SessionId>,
}

/// Per-actor inbound queues of the locally hosted actors.
///
/// Each mailbox is FIFO. No order is kept between mailboxes.
#[derive(Default)]
pub struct Mailboxes {
    boxes: HashMap<ActorId, VecDeque<Delivery>>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts hosting `actor_id`. Returns false if it already was.
    pub fn register(&mut self, actor_id: ActorId) -> bool {
        if self.boxes.contains_key(&actor_id) {
            return false;
        }
        self.boxes.insert(actor_id, VecDeque::new());
        true
    }

    /// Stops hosting `actor_id`, handing back whatever was still queued
    pub fn unregister(&mut self, actor_id: &ActorId) -> Option<Vec<Delivery>> {
        self.boxes
            .remove(actor_id)
            .map(|queue| queue.into_iter().collect())
    }

    pub fn is_registered(&self, actor_id: &ActorId) -> bool {
        self.boxes.contains_key(actor_id)
    }

    /// Queues a delivery. Unknown actors get it back.
    pub fn push(&mut self, actor_id: ActorId, delivery: Delivery) -> Result<(), Delivery> {
        match self.boxes.get_mut(&actor_id) {
            Some(queue) => {
                queue.push_back(delivery);
                Ok(())
            }
            None => Err(delivery),
        }
    }

    pub fn pop(&mut self, actor_id: &ActorId) -> Option<Delivery> {
        self.boxes.get_mut(actor_id)?.pop_front()
    }

    /// Removes and returns every delivery queued for `actor_id`, oldest first
    pub fn drain(&mut self, actor_id: &ActorId) -> Vec<Delivery> {
        match self.boxes.get_mut(actor_id) {
            Some(queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, actor_id: &ActorId) -> usize {
        self.boxes.get(actor_id).map_or(0, VecDeque::len)
    }

    pub fn total_len(&self) -> usize {
        self.boxes.values().map(VecDeque::len).sum()
    }

    /// Actors with at least one queued delivery
    pub fn actors_with_mail(&self) -> Vec<ActorId> {
        self.boxes
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(actor_id, _)| *actor_id)
            .collect()
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.boxes.keys()
    }
}

impl LocalActors for Mailboxes {
    fn hosts(&self, actor_id: &ActorId) -> bool {
        self.is_registered(actor_id)
    }
}
