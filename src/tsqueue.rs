use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A mutex-guarded double-ended queue with blocking wait-for-item semantics.
///
/// This is the only synchronization primitive that crosses the boundary between a reactor
///  thread and the application thread: the reactor pushes completed inbound messages, the
///  application pops them (and vice versa for each connection's outbound queue). All
///  operations except [TsQueue::wait] are non-blocking and atomic with respect to each other.
pub struct TsQueue<T> {
    items: Mutex<VecDeque<T>>,
    non_empty: Condvar,
}

impl<T> TsQueue<T> {
    pub fn new() -> TsQueue<T> {
        TsQueue {
            items: Mutex::new(VecDeque::new()),
            non_empty: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: T) {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        items.push_back(item);
        self.non_empty.notify_one();
    }

    pub fn push_front(&self, item: T) {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        items.push_front(item);
        self.non_empty.notify_one();
    }

    pub fn pop_front(&self) -> Option<T> {
        self.items.lock().expect("queue mutex poisoned").pop_front()
    }

    pub fn pop_back(&self) -> Option<T> {
        self.items.lock().expect("queue mutex poisoned").pop_back()
    }

    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.items.lock().expect("queue mutex poisoned").front().cloned()
    }

    pub fn back(&self) -> Option<T>
    where
        T: Clone,
    {
        self.items.lock().expect("queue mutex poisoned").back().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().expect("queue mutex poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn clear(&self) {
        self.items.lock().expect("queue mutex poisoned").clear();
    }

    /// Blocks the calling thread until the queue is non-empty. Every push notifies one
    ///  waiter; emptiness is re-checked in a loop, so spurious wakeups (and waking up to a
    ///  queue that another consumer drained first) are handled.
    pub fn wait(&self) {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        while items.is_empty() {
            items = self.non_empty.wait(items).expect("queue mutex poisoned");
        }
    }
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        TsQueue::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_push_pop_both_ends() {
        let queue = TsQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop_front(), None::<u32>);
        assert_eq!(queue.pop_back(), None);

        queue.push_back(2);
        queue.push_back(3);
        queue.push_front(1);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front(), Some(1));
        assert_eq!(queue.back(), Some(3));

        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_back(), Some(3));
        assert_eq!(queue.pop_front(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = TsQueue::new();
        queue.push_back(1);
        queue.push_back(2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_wait_returns_immediately_when_non_empty() {
        let queue = TsQueue::new();
        queue.push_back(1);
        queue.wait();
        assert_eq!(queue.pop_front(), Some(1));
    }

    /// N producer threads, one consumer looping `wait()` / `pop_front()`: every item arrives
    ///  exactly once, and items of each producer arrive in the order that producer pushed them.
    #[test]
    fn test_concurrent_producers_single_consumer() {
        const NUM_PRODUCERS: u32 = 4;
        const ITEMS_PER_PRODUCER: u32 = 250;

        let queue = Arc::new(TsQueue::new());

        let producers = (0..NUM_PRODUCERS)
            .map(|producer| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for seq in 0..ITEMS_PER_PRODUCER {
                        queue.push_back((producer, seq));
                        if seq % 64 == 0 {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut received = Vec::new();
        while received.len() < (NUM_PRODUCERS * ITEMS_PER_PRODUCER) as usize {
            queue.wait();
            while let Some(item) = queue.pop_front() {
                received.push(item);
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(queue.is_empty());
        for producer in 0..NUM_PRODUCERS {
            let of_producer = received
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .collect::<Vec<_>>();
            assert_eq!(of_producer, (0..ITEMS_PER_PRODUCER).collect::<Vec<_>>());
        }
    }
}
