use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use log::trace;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    clock::Clock,
    id_generator::{IdGenerator, SequentialIdGenerator},
    types::{Millis, TimerId},
};

/// Errors raised when scheduling timers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// A repeating timer would fire on every tick
    #[error("Repeating timer period must be greater than 0 ms")]
    ZeroPeriod,
}

/// How an awaitable timer finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Completion handle returned by [`TimerWheel::wait_until`] and [`TimerWheel::wait_for`]
pub struct TimerWait {
    id: TimerId,
    receiver: oneshot::Receiver<WaitOutcome>,
}

impl TimerWait {
    /// Id to pass to [`TimerWheel::remove`] to cancel the wait
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Non-blocking check; `None` while the timer is still pending
    pub fn try_take(&mut self) -> Option<WaitOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(WaitOutcome::Cancelled),
        }
    }
}

impl Future for TimerWait {
    type Output = WaitOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // wheel dropped with the entry still scheduled
            Poll::Ready(Err(_)) => Poll::Ready(WaitOutcome::Cancelled),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum TimerKind<T> {
    Once(T),
    OnceAwaitable(oneshot::Sender<WaitOutcome>),
    Repeating { period: Millis, payload: T },
}

struct TimerEntry<T> {
    due: Millis,
    kind: TimerKind<T>,
}

/// A timer whose due time has passed, handed back by [`TimerWheel::pop_due`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTimer<T> {
    pub id: TimerId,
    pub payload: T,
    pub repeating: bool,
}

/// Time-bucketed scheduler for one fiber.
///
/// `tick` moves every bucket that is due into a queue of ids; `pop_due` then
/// fires them one at a time, skipping ids removed in the meantime. A timer
/// cancelled by the handler of an earlier timer in the same tick therefore
/// never fires.
pub struct TimerWheel<T> {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    timers: HashMap<TimerId, TimerEntry<T>>,
    buckets: BTreeMap<Millis, Vec<TimerId>>,
    // earliest key in `buckets`, Millis::MAX when empty
    min_time: Millis,
    due: VecDeque<TimerId>,
}

impl<T: Clone> TimerWheel<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ids(clock, Arc::new(SequentialIdGenerator::new()))
    }

    pub fn with_ids(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            clock,
            ids,
            timers: HashMap::new(),
            buckets: BTreeMap::new(),
            min_time: Millis::MAX,
            due: VecDeque::new(),
        }
    }

    pub fn now(&self) -> Millis {
        self.clock.now()
    }

    /// Fires once at `due`, handing `payload` back through `pop_due`
    pub fn new_once_timer(&mut self, due: Millis, payload: T) -> TimerId {
        self.schedule(due, TimerKind::Once(payload))
    }

    /// Fires every `period` ms, first at `now + period`
    pub fn new_repeating_timer(&mut self, period: Millis, payload: T) -> Result<TimerId, TimerError> {
        if period == 0 {
            return Err(TimerError::ZeroPeriod);
        }
        let due = self.clock.now().saturating_add(period);
        Ok(self.schedule(due, TimerKind::Repeating { period, payload }))
    }

    /// Resolves with `Elapsed` once `due` passes, or `Cancelled` if removed first
    pub fn wait_until(&mut self, due: Millis) -> TimerWait {
        let (sender, receiver) = oneshot::channel();
        let id = self.schedule(due, TimerKind::OnceAwaitable(sender));
        TimerWait { id, receiver }
    }

    pub fn wait_for(&mut self, duration: Millis) -> TimerWait {
        let due = self.clock.now().saturating_add(duration);
        self.wait_until(due)
    }

    /// Cancels a timer. Returns false if it already fired or never existed.
    pub fn remove(&mut self, id: TimerId) -> bool {
        let Some(entry) = self.timers.remove(&id) else {
            return false;
        };
        self.unindex(entry.due, id);
        if let TimerKind::OnceAwaitable(sender) = entry.kind {
            let _ = sender.send(WaitOutcome::Cancelled);
        }
        true
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest scheduled due time
    pub fn next_due(&self) -> Option<Millis> {
        if self.min_time == Millis::MAX {
            None
        } else {
            Some(self.min_time)
        }
    }

    /// Collects ids of every bucket due at the current time
    pub fn tick(&mut self) {
        let now = self.clock.now();
        if now < self.min_time {
            return;
        }
        while let Some(entry) = self.buckets.first_entry() {
            if *entry.key() > now {
                break;
            }
            self.due.extend(entry.remove());
        }
        self.refresh_min_time();
    }

    /// Fires the next collected timer still scheduled. Awaitable timers are
    /// resolved internally and not returned.
    pub fn pop_due(&mut self) -> Option<FiredTimer<T>> {
        while let Some(id) = self.due.pop_front() {
            let Some(entry) = self.timers.remove(&id) else {
                continue;
            };
            match entry.kind {
                TimerKind::Once(payload) => {
                    return Some(FiredTimer {
                        id,
                        payload,
                        repeating: false,
                    });
                }
                TimerKind::OnceAwaitable(sender) => {
                    let _ = sender.send(WaitOutcome::Elapsed);
                }
                TimerKind::Repeating { period, payload } => {
                    // re-inserted before the caller sees it fire
                    let due = self.clock.now().saturating_add(period);
                    self.insert(
                        id,
                        TimerEntry {
                            due,
                            kind: TimerKind::Repeating {
                                period,
                                payload: payload.clone(),
                            },
                        },
                    );
                    return Some(FiredTimer {
                        id,
                        payload,
                        repeating: true,
                    });
                }
            }
        }
        None
    }

    /// `tick` followed by draining `pop_due`
    pub fn fire_due(&mut self) -> Vec<FiredTimer<T>> {
        self.tick();
        let mut fired = Vec::new();
        while let Some(timer) = self.pop_due() {
            fired.push(timer);
        }
        fired
    }

    fn schedule(&mut self, due: Millis, kind: TimerKind<T>) -> TimerId {
        let id = self.ids.next_id();
        trace!("timer {} scheduled for {}", id, due);
        self.insert(id, TimerEntry { due, kind });
        id
    }

    fn insert(&mut self, id: TimerId, entry: TimerEntry<T>) {
        let due = entry.due;
        self.buckets.entry(due).or_default().push(id);
        self.timers.insert(id, entry);
        if due < self.min_time {
            self.min_time = due;
        }
    }

    fn unindex(&mut self, due: Millis, id: TimerId) {
        if let Some(bucket) = self.buckets.get_mut(&due) {
            bucket.retain(|other| *other != id);
            if bucket.is_empty() {
                self.buckets.remove(&due);
                if due == self.min_time {
                    self.refresh_min_time();
                }
            }
        }
    }

    fn refresh_min_time(&mut self) {
        self.min_time = self
            .buckets
            .keys()
            .next()
            .copied()
            .unwrap_or(Millis::MAX);
    }
}
