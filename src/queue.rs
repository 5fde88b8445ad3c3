//! Bounded blocking queue with timeouts
//!
//! A timeout is an ordinary outcome here, not an error: `put` hands the
//! item back and `get` returns `None`.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, SendTimeoutError};
use std::time::Duration;

/// Multi-producer, multi-consumer FIFO queue
///
/// Clones share the same underlying queue.
#[derive(Debug)]
pub struct Queue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// Queue holding at most `capacity` items (at least one)
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        Queue { sender, receiver }
    }

    /// Queue that never blocks producers
    pub fn unbounded() -> Self {
        let (sender, receiver) = channel::unbounded();
        Queue { sender, receiver }
    }

    /// Enqueue, waiting up to `timeout` for space
    ///
    /// On timeout the item is handed back.
    pub fn put(&self, item: T, timeout: Duration) -> Result<(), T> {
        self.sender.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(item) | SendTimeoutError::Disconnected(item) => item,
        })
    }

    /// Dequeue, waiting up to `timeout` for an item
    pub fn get(&self, timeout: Duration) -> Option<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Dequeue without waiting
    pub fn try_get(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// `None` for unbounded queues
    pub fn capacity(&self) -> Option<usize> {
        self.sender.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = Queue::new(4);
        for i in 0..4 {
            queue.put(i, Duration::from_millis(10)).unwrap();
        }
        assert_eq!(queue.len(), 4);
        let drained: Vec<i32> = (0..4).filter_map(|_| queue.try_get()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_put_times_out_when_full() {
        let queue = Queue::new(1);
        queue.put("a", Duration::from_millis(10)).unwrap();

        let start = Instant::now();
        assert_eq!(queue.put("b", Duration::from_millis(30)), Err("b"));
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(queue.capacity(), Some(1));
    }

    #[test]
    fn test_get_times_out_when_empty() {
        let queue: Queue<u8> = Queue::new(2);
        assert_eq!(queue.get(Duration::from_millis(20)), None);
        assert_eq!(queue.try_get(), None);
    }

    #[test]
    fn test_blocked_producer_resumes() {
        let queue = Arc::new(Queue::new(1));
        queue.put(1, Duration::from_millis(10)).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put(2, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.get(Duration::from_millis(10)), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.get(Duration::from_secs(1)), Some(2));
    }

    #[test]
    fn test_unbounded() {
        let queue = Queue::unbounded();
        for i in 0..1000 {
            queue.put(i, Duration::ZERO).unwrap();
        }
        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.capacity(), None);
    }
}
