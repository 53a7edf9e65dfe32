use concepts::{Event, TargetKey, WorkerId};
use indexmap::IndexMap;
use std::collections::VecDeque;
use tokio::time::Instant;

/// An event handed to a parked worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: WorkerId,
    pub event: Event,
}

#[derive(Debug)]
struct Chain {
    key: TargetKey,
    limit: usize,
    deadline: Instant,
    /// Events of the chain handed to the worker so far, the first one included.
    assigned: usize,
    /// Same-target events waiting for the worker to finish its current one.
    backlog: VecDeque<Event>,
    /// The worker is parked and waits for the next event of its target.
    reserved: bool,
}

impl Chain {
    fn is_open(&self, now: Instant) -> bool {
        now < self.deadline
    }

    fn has_capacity(&self) -> bool {
        self.assigned + self.backlog.len() < self.limit
    }
}

/// Matches pending events with parked workers. Owns no I/O: the scheduler actor feeds it
/// queue messages and delivers the resulting assignments.
#[derive(Debug, Default)]
pub struct Dispatcher {
    ready: VecDeque<WorkerId>,
    pending: VecDeque<Event>,
    chains: IndexMap<WorkerId, Chain>,
}

impl Dispatcher {
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.chains.values().map(|chain| chain.backlog.len()).sum::<usize>()
    }

    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len() + self.chains.values().filter(|chain| chain.reserved).count()
    }

    pub fn on_enqueued(&mut self, event: Event, now: Instant) -> Option<Assignment> {
        let key = event.target.key();
        if let Some((worker_id, chain)) = self
            .chains
            .iter_mut()
            .find(|(_, chain)| chain.key == key && chain.is_open(now) && chain.has_capacity())
        {
            if chain.reserved {
                chain.reserved = false;
                chain.assigned += 1;
                return Some(Assignment {
                    worker_id: *worker_id,
                    event,
                });
            }
            chain.backlog.push_back(event);
            return None;
        }
        if let Some(worker_id) = self.ready.pop_front() {
            return Some(self.start(worker_id, event, now));
        }
        // A worker waiting for more events of its own target must not leave others pending.
        if let Some(worker_id) = self
            .chains
            .iter()
            .find(|(_, chain)| chain.reserved)
            .map(|(worker_id, _)| *worker_id)
        {
            self.chains.shift_remove(&worker_id);
            return Some(self.start(worker_id, event, now));
        }
        self.pending.push_back(event);
        None
    }

    pub fn on_worker_ready(&mut self, worker_id: WorkerId, now: Instant) -> Option<Assignment> {
        if let Some(chain) = self.chains.get_mut(&worker_id) {
            if chain.is_open(now) && chain.assigned < chain.limit {
                let mut next = chain.backlog.pop_front();
                if next.is_none() {
                    next = self
                        .pending
                        .iter()
                        .position(|event| event.target.key() == chain.key)
                        .and_then(|position| self.pending.remove(position));
                }
                if let Some(event) = next {
                    chain.assigned += 1;
                    return Some(Assignment { worker_id, event });
                }
                if self.pending.is_empty() {
                    chain.reserved = true;
                    return None;
                }
            }
            self.close_chain(worker_id);
        }
        if let Some(event) = self.pending.pop_front() {
            return Some(self.start(worker_id, event, now));
        }
        self.ready.push_back(worker_id);
        None
    }

    /// Closes every chain past its deadline. Their backlogs return to the front of the
    /// pending queue and their parked workers become generally available.
    pub fn expire_chains(&mut self, now: Instant) -> Vec<Assignment> {
        let expired: Vec<_> = self
            .chains
            .iter()
            .filter(|(_, chain)| !chain.is_open(now))
            .map(|(worker_id, _)| *worker_id)
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }
        for worker_id in expired {
            if self.close_chain(worker_id) {
                self.ready.push_back(worker_id);
            }
        }
        self.drain(now)
    }

    #[must_use]
    pub fn next_chain_deadline(&self) -> Option<Instant> {
        self.chains.values().map(|chain| chain.deadline).min()
    }

    /// Forgets the worker. Events it was holding back are offered to the remaining workers.
    pub fn remove_worker(&mut self, worker_id: WorkerId, now: Instant) -> Vec<Assignment> {
        self.ready.retain(|id| *id != worker_id);
        self.close_chain(worker_id);
        self.drain(now)
    }

    /// Puts back an event whose assignment could not be delivered.
    pub fn requeue_front(&mut self, event: Event) {
        self.pending.push_front(event);
    }

    /// Empties all tables, returning every event that never reached a worker.
    pub fn drain_all(&mut self) -> Vec<Event> {
        self.ready.clear();
        let mut events: Vec<_> = self
            .chains
            .drain(..)
            .flat_map(|(_, chain)| chain.backlog)
            .collect();
        events.extend(self.pending.drain(..));
        events
    }

    fn start(&mut self, worker_id: WorkerId, event: Event, now: Instant) -> Assignment {
        if let Some(batch) = event.target.context.batch.filter(|batch| batch.limit > 1) {
            self.chains.insert(
                worker_id,
                Chain {
                    key: event.target.key(),
                    limit: usize::try_from(batch.limit).unwrap_or(usize::MAX),
                    deadline: now + batch.deadline,
                    assigned: 1,
                    backlog: VecDeque::new(),
                    reserved: false,
                },
            );
        }
        Assignment { worker_id, event }
    }

    /// Returns whether the worker was parked for the chain.
    fn close_chain(&mut self, worker_id: WorkerId) -> bool {
        let Some(chain) = self.chains.shift_remove(&worker_id) else {
            return false;
        };
        for event in chain.backlog.into_iter().rev() {
            self.pending.push_front(event);
        }
        chain.reserved
    }

    fn drain(&mut self, now: Instant) -> Vec<Assignment> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|event| self.on_enqueued(event, now))
            .collect()
    }
}
