use std::collections::VecDeque;
use std::sync::Mutex;

use mpt_protocol::EventNotificationReply;

use crate::sync::lock;

/// One recorded event notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event: u32,
    pub event_context: u32,
    pub data: Vec<u32>,
}

impl From<&EventNotificationReply> for EventRecord {
    fn from(reply: &EventNotificationReply) -> Self {
        EventRecord {
            event: reply.event,
            event_context: reply.event_context,
            data: reply.data.clone(),
        }
    }
}

/// Thread-safe ring of the most recent events.
///
/// When full, the oldest record is dropped to make room.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    inner: Mutex<VecDeque<EventRecord>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// If the capacity is 0, the record is dropped.
    pub fn push(&self, record: EventRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut guard = lock(&self.inner);
        while guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(record);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        lock(&self.inner).iter().cloned().collect()
    }

    pub fn drain(&self) -> Vec<EventRecord> {
        lock(&self.inner).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(event: u32) -> EventRecord {
        EventRecord {
            event,
            event_context: event * 10,
            data: vec![event],
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let log = EventLog::new(2);
        log.push(record(1));
        log.push(record(2));
        log.push(record(3));
        assert_eq!(log.snapshot(), vec![record(2), record(3)]);
        assert_eq!(log.drain(), vec![record(2), record(3)]);
        assert!(log.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let log = EventLog::new(0);
        log.push(record(1));
        assert!(log.is_empty());
    }

    #[test]
    fn concurrent_pushes_respect_capacity() {
        let log = Arc::new(EventLog::new(50));
        let threads: Vec<_> = (0..4u32)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        log.push(record(t * 1000 + i));
                    }
                })
            })
            .collect();
        for th in threads {
            th.join().expect("thread join");
        }
        assert_eq!(log.len(), 50);
    }
}
