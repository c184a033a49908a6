//! Bounded queue of publishes waiting for the broker.
//!
//! When full, the oldest entry is evicted to make room so the freshest telemetry
//! survives a long outage.

use std::collections::VecDeque;

use super::packet::Message;

#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<Message>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue at the back, returning the entry evicted to make room, if any.
    pub fn push(&mut self, message: Message) -> Option<Message> {
        if self.capacity == 0 {
            self.dropped += 1;
            return Some(message);
        }
        let evicted = if self.queue.len() >= self.capacity {
            self.dropped += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(message);
        evicted
    }

    /// Put a message back at the head after a failed send.
    pub fn requeue(&mut self, message: Message) {
        if self.queue.len() >= self.capacity {
            // the requeued entry is the oldest, so it is the one to lose
            self.dropped += 1;
            return;
        }
        self.queue.push_front(message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries lost to overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_oldest() {
        let mut outbox = Outbox::new(3);
        for i in 0..5 {
            outbox.push(Message::new("t", format!("{}", i)));
        }
        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox.dropped(), 2);
        let kept: Vec<_> = outbox
            .iter()
            .map(|m| m.payload_str().unwrap().to_string())
            .collect();
        assert_eq!(kept, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_push_reports_eviction() {
        let mut outbox = Outbox::new(1);
        assert!(outbox.push(Message::new("a", "1")).is_none());
        let evicted = outbox.push(Message::new("b", "2")).unwrap();
        assert_eq!(evicted.topic, "a");
    }

    #[test]
    fn test_requeue_preserves_order() {
        let mut outbox = Outbox::new(4);
        outbox.push(Message::new("a", "1"));
        outbox.push(Message::new("b", "2"));
        let head = outbox.pop().unwrap();
        outbox.requeue(head);
        assert_eq!(outbox.pop().unwrap().topic, "a");
        assert_eq!(outbox.pop().unwrap().topic, "b");
        assert!(outbox.is_empty());
    }
}
