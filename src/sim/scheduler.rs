//! Priority-queue event scheduler: absolute-time events driven by a seeded
//! PRNG (§4.12).

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A scheduled simulation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connect { peer: usize },
    Leave { peer: usize },
    Join { peer: usize },
    Stabilize,
    Route { from: usize, key_seed: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub time_ms: u64,
    pub kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ms.cmp(&other.time_ms)
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Absolute-time min-heap of pending events, plus the harness's seeded PRNG
/// (§4.12 "a seeded PRNG, a priority-queue event scheduler").
pub struct Scheduler {
    queue: BinaryHeap<Reverse<Event>>,
    rng: fastrand::Rng,
}

impl Scheduler {
    pub fn new(seed: u64) -> Self {
        Self {
            queue: BinaryHeap::new(),
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    pub fn schedule(&mut self, time_ms: u64, kind: EventKind) {
        self.queue.push(Reverse(Event { time_ms, kind }));
    }

    pub fn pop_next(&mut self) -> Option<Event> {
        self.queue.pop().map(|Reverse(e)| e)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn rng(&mut self) -> &mut fastrand::Rng {
        &mut self.rng
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_events_pop_in_time_order() {
        let mut s = Scheduler::new(1);
        s.schedule(300, EventKind::Stabilize);
        s.schedule(100, EventKind::Stabilize);
        s.schedule(200, EventKind::Stabilize);
        let times: Vec<u64> = std::iter::from_fn(|| s.pop_next().map(|e| e.time_ms)).collect();
        assert_eq!(times, vec![100, 200, 300]);
    }

    #[test]
    fn test_deterministic_with_fixed_seed() {
        let mut a = Scheduler::new(42);
        let mut b = Scheduler::new(42);
        let seq_a: Vec<usize> = (0..10).map(|_| a.rng().usize(0..1_000_000)).collect();
        let seq_b: Vec<usize> = (0..10).map(|_| b.rng().usize(0..1_000_000)).collect();
        assert_eq!(seq_a, seq_b);
    }
}
