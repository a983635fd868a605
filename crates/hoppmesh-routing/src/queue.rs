//! Priority queue feeding the router loop

use hoppmesh_protocol::{Message, Priority};
use std::collections::VecDeque;
use tokio::time::Instant;

const LANES: usize = 4;

fn lane(priority: Priority) -> usize {
    match priority {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::High => 2,
        Priority::Emergency => 3,
    }
}

/// Message with queueing metadata
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,

    /// When the message first entered the queue
    pub enqueued_at: Instant,

    /// Not dequeued before this instant (backoff)
    pub eligible_at: Instant,

    /// Last requeue used the immediate strategy
    pub immediate_retry: bool,
}

impl QueuedMessage {
    pub fn new(message: Message) -> Self {
        let now = Instant::now();
        QueuedMessage {
            message,
            enqueued_at: now,
            eligible_at: now,
            immediate_retry: false,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.eligible_at <= now
    }
}

/// Four lanes, one per priority, each FIFO
///
/// Unbounded; producers never block.
#[derive(Debug, Default)]
pub struct MessageQueue {
    lanes: [VecDeque<QueuedMessage>; LANES],
    total: usize,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fresh message, eligible immediately
    pub fn push(&mut self, message: Message) {
        self.push_entry(QueuedMessage::new(message));
    }

    /// Queue an entry carrying its own eligibility and retry state
    pub fn push_entry(&mut self, entry: QueuedMessage) {
        self.lanes[lane(entry.message.priority)].push_back(entry);
        self.total += 1;
    }

    /// Take the oldest eligible entry from the highest non-empty priority
    ///
    /// Entries still waiting out a backoff are skipped, not reordered.
    pub fn pop_ready(&mut self, now: Instant) -> Option<QueuedMessage> {
        for queue in self.lanes.iter_mut().rev() {
            if let Some(pos) = queue.iter().position(|e| e.is_ready(now)) {
                self.total -= 1;
                return queue.remove(pos);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn len_for_priority(&self, priority: Priority) -> usize {
        self.lanes[lane(priority)].len()
    }

    /// Remove everything, highest priority first
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.total = 0;
        self.lanes
            .iter_mut()
            .rev()
            .flat_map(|queue| queue.drain(..))
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            emergency: self.lanes[3].len(),
            high: self.lanes[2].len(),
            normal: self.lanes[1].len(),
            low: self.lanes[0].len(),
            total: self.total,
        }
    }
}

/// Per-lane queue depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub emergency: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoppmesh_protocol::{NodeId, Recipient};
    use std::time::Duration;

    fn message(priority: Priority, content: &str) -> Message {
        Message::new(
            NodeId::new("A").unwrap(),
            Recipient::Broadcast,
            content,
            priority,
            false,
        )
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = MessageQueue::new();
        queue.push(message(Priority::Low, "low"));
        queue.push(message(Priority::Emergency, "sos"));
        queue.push(message(Priority::Normal, "normal"));
        queue.push(message(Priority::High, "high"));

        let now = Instant::now();
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_ready(now))
            .map(|e| e.message.content)
            .collect();
        assert_eq!(order, vec!["sos", "high", "normal", "low"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_within_lane() {
        let mut queue = MessageQueue::new();
        queue.push(message(Priority::Normal, "first"));
        queue.push(message(Priority::Normal, "second"));

        let now = Instant::now();
        assert_eq!(queue.pop_ready(now).unwrap().message.content, "first");
        assert_eq!(queue.pop_ready(now).unwrap().message.content, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_entries_skipped_until_eligible() {
        let mut queue = MessageQueue::new();
        let mut delayed = QueuedMessage::new(message(Priority::Emergency, "later"));
        delayed.eligible_at = Instant::now() + Duration::from_secs(4);
        queue.push_entry(delayed);
        queue.push(message(Priority::Low, "now"));

        assert_eq!(
            queue.pop_ready(Instant::now()).unwrap().message.content,
            "now"
        );
        assert!(queue.pop_ready(Instant::now()).is_none());
        assert_eq!(queue.len(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            queue.pop_ready(Instant::now()).unwrap().message.content,
            "later"
        );
    }

    #[test]
    fn test_stats_and_drain() {
        let mut queue = MessageQueue::new();
        queue.push(message(Priority::Emergency, "a"));
        queue.push(message(Priority::Emergency, "b"));
        queue.push(message(Priority::Normal, "c"));

        let stats = queue.stats();
        assert_eq!(stats.emergency, 2);
        assert_eq!(stats.normal, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(queue.len_for_priority(Priority::Emergency), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[2].message.content, "c");
        assert!(queue.is_empty());
    }
}
