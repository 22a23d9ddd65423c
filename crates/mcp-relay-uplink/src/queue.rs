//! Outbound queue for envelopes sent while the uplink is down

use mcp_relay_core::Envelope;
use std::collections::VecDeque;

/// FIFO of envelopes awaiting delivery
///
/// Unbounded unless a capacity is given; at capacity the oldest entry is
/// dropped to make room.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    capacity: Option<usize>,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.filter(|c| *c > 0),
            dropped: 0,
        }
    }

    /// Append an envelope, returning the entry evicted to make room, if any
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let evicted = match self.capacity {
            Some(cap) if self.items.len() >= cap => {
                self.dropped += 1;
                self.items.pop_front()
            }
            _ => None,
        };
        self.items.push_back(envelope);
        evicted
    }

    /// Put back an envelope whose delivery failed so it goes out first
    ///
    /// At capacity the put-back envelope is itself the oldest entry, so it is
    /// the one returned as evicted.
    pub fn push_front(&mut self, envelope: Envelope) -> Option<Envelope> {
        match self.capacity {
            Some(cap) if self.items.len() >= cap => {
                self.dropped += 1;
                Some(envelope)
            }
            _ => {
                self.items.push_front(envelope);
                None
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total entries evicted by the capacity limit
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_relay_core::RawValue;

    fn mcp(n: u32) -> Envelope {
        Envelope::mcp(RawValue::from_string(format!("{{\"n\":{}}}", n)).unwrap())
    }

    fn payloads(queue: &mut OutboundQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop_front())
            .map(|e| e.payload_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new(None);
        for n in 1..=3 {
            assert!(queue.push(mcp(n)).is_none());
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(payloads(&mut queue), vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut queue = OutboundQueue::new(Some(2));
        queue.push(mcp(1));
        queue.push(mcp(2));
        let evicted = queue.push(mcp(3)).unwrap();
        assert_eq!(evicted.payload_str(), Some(r#"{"n":1}"#));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(payloads(&mut queue), vec![r#"{"n":2}"#, r#"{"n":3}"#]);
    }

    #[test]
    fn test_zero_capacity_is_unbounded() {
        let mut queue = OutboundQueue::new(Some(0));
        for n in 0..100 {
            queue.push(mcp(n));
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_push_front_requeues_first() {
        let mut queue = OutboundQueue::new(None);
        queue.push(mcp(2));
        assert!(queue.push_front(mcp(1)).is_none());
        assert_eq!(payloads(&mut queue), vec![r#"{"n":1}"#, r#"{"n":2}"#]);
    }

    #[test]
    fn test_push_front_respects_capacity() {
        let mut queue = OutboundQueue::new(Some(2));
        queue.push(mcp(2));
        queue.push(mcp(3));
        let evicted = queue.push_front(mcp(1)).unwrap();
        assert_eq!(evicted.payload_str(), Some(r#"{"n":1}"#));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(payloads(&mut queue), vec![r#"{"n":2}"#, r#"{"n":3}"#]);

        let mut queue = OutboundQueue::new(Some(2));
        queue.push(mcp(2));
        assert!(queue.push_front(mcp(1)).is_none());
        assert_eq!(queue.len(), 2);
    }
}
