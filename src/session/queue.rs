//! Bounded drop-oldest outbound queue

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Packets waiting to be sent to one client.
///
/// Producers never block: when the queue is full the oldest packet is
/// discarded to make room. There is a single consumer (the session's
/// egress task).
#[derive(Debug)]
pub struct OutboundQueue {
    packets: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue a packet; returns `true` if an older packet was dropped
    pub fn push(&self, packet: Bytes) -> bool {
        let dropped = {
            let mut packets = self.packets.lock();
            let dropped = if packets.len() >= self.capacity {
                packets.pop_front();
                true
            } else {
                false
            };
            packets.push_back(packet);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.packets.lock().pop_front()
    }

    /// Wait until a packet is available
    pub async fn next(&self) -> Bytes {
        loop {
            let notified = self.notify.notified();
            if let Some(packet) = self.pop() {
                return packet;
            }
            notified.await;
        }
    }

    /// Discard everything queued, returning how many packets were dropped
    pub fn clear(&self) -> usize {
        let mut packets = self.packets.lock();
        let n = packets.len();
        packets.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = OutboundQueue::new(2);
        assert!(!queue.push(Bytes::from_static(b"1")));
        assert!(!queue.push(Bytes::from_static(b"2")));
        assert!(queue.push(Bytes::from_static(b"3")));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap(), Bytes::from_static(b"2"));
        assert_eq!(queue.pop().unwrap(), Bytes::from_static(b"3"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_clear() {
        let queue = OutboundQueue::new(4);
        queue.push(Bytes::from_static(b"a"));
        queue.push(Bytes::from_static(b"b"));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(Bytes::from_static(b"late"));
        let packet = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet, Bytes::from_static(b"late"));
    }
}
