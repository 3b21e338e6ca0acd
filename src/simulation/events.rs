//! Discrete-event scheduling
//!
//! A min-heap of timestamped events and a clock that jumps to each event
//! as it is popped. Waiting is just an event scheduled in the future.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Handle for cancelling a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

struct Scheduled<E> {
    time: f64,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    // reversed: BinaryHeap is a max-heap and we pop the earliest event;
    // equal times pop in insertion order
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending events ordered by time
pub struct EventQueue<E> {
    heap: BinaryHeap<Scheduled<E>>,
    now: f64,
    next_seq: u64,
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            now: 0.0,
            next_seq: 0,
        }
    }

    /// Current simulated time
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Schedule `event` at absolute `time` (never earlier than now)
    pub fn insert(&mut self, time: f64, event: E) -> EventId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled {
            time: time.max(self.now),
            seq,
            event,
        });
        EventId(seq)
    }

    /// Schedule `event` `delay` seconds from now
    pub fn insert_after(&mut self, delay: f64, event: E) -> EventId {
        self.insert(self.now + delay, event)
    }

    /// Cancel a scheduled event; linear in the queue size
    pub fn remove(&mut self, id: EventId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|s| s.seq != id.0);
        self.heap.len() != before
    }

    /// Time of the earliest pending event
    pub fn peek_time(&self) -> Option<f64> {
        self.heap.peek().map(|s| s.time)
    }

    /// Pop the earliest event and move the clock to it
    pub fn pop(&mut self) -> Option<(f64, E)> {
        let next = self.heap.pop()?;
        self.now = next.time;
        Some((next.time, next.event))
    }

    /// Move the clock forward without an event
    pub fn advance_to(&mut self, time: f64) {
        if time > self.now {
            self.now = time;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Something driven by an event queue
pub trait EventHandler {
    type Event;

    fn queue(&mut self) -> &mut EventQueue<Self::Event>;

    /// React to one event at time `now`
    fn handle(&mut self, now: f64, event: Self::Event);
}

/// Run events in time order until the queue empties or the next event
/// is later than `until`; returns the number of events handled
pub fn simulate<H: EventHandler>(handler: &mut H, until: f64) -> usize {
    let mut handled = 0;
    loop {
        match handler.queue().peek_time() {
            Some(t) if t <= until => {}
            _ => break,
        }
        let Some((now, event)) = handler.queue().pop() else {
            break;
        };
        handler.handle(now, event);
        handled += 1;
    }
    if until.is_finite() {
        handler.queue().advance_to(until);
    }
    handled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_pop_in_time_order() {
        let mut queue = EventQueue::new();
        queue.insert(5.0, "c");
        queue.insert(1.0, "a");
        queue.insert(3.0, "b");
        queue.insert(3.0, "b2");

        let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|(_, e)| e)).collect();
        assert_eq!(order, vec!["a", "b", "b2", "c"]);
        assert_eq!(queue.now(), 5.0);
    }

    #[test]
    fn test_remove_event() {
        let mut queue = EventQueue::new();
        let a = queue.insert(1.0, 'a');
        let b = queue.insert(2.0, 'b');
        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some((2.0, 'b')));
        assert!(!queue.remove(b));
    }

    #[test]
    fn test_no_scheduling_in_the_past() {
        let mut queue = EventQueue::new();
        queue.insert(10.0, 1);
        queue.pop();
        queue.insert(4.0, 2);
        assert_eq!(queue.peek_time(), Some(10.0));
        queue.insert_after(2.5, 3);
        queue.pop();
        assert_eq!(queue.pop(), Some((12.5, 3)));
    }

    struct Counter {
        queue: EventQueue<u32>,
        seen: Vec<(f64, u32)>,
    }

    impl EventHandler for Counter {
        type Event = u32;

        fn queue(&mut self) -> &mut EventQueue<u32> {
            &mut self.queue
        }

        fn handle(&mut self, now: f64, event: u32) {
            self.seen.push((now, event));
            if event < 5 {
                self.queue.insert_after(10.0, event + 1);
            }
        }
    }

    #[test]
    fn test_simulate_stops_at_horizon() {
        let mut counter = Counter {
            queue: EventQueue::new(),
            seen: Vec::new(),
        };
        counter.queue.insert(0.0, 0);

        assert_eq!(simulate(&mut counter, 25.0), 3);
        assert_eq!(counter.seen, vec![(0.0, 0), (10.0, 1), (20.0, 2)]);
        assert_eq!(counter.queue.now(), 25.0);

        simulate(&mut counter, 1000.0);
        assert_eq!(counter.seen.len(), 6);
        assert!(counter.queue.is_empty());
    }
}
