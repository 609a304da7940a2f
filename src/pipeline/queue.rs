use super::coordinator::Coordinator;
use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// Blocked threads wake up this often to look at the coordinator.
const POLL: Duration = Duration::from_millis(20);

/// Which element a dequeue hands out.
pub enum Order {
    Fifo,
    /// Uniformly random element, like a shuffle buffer.
    Random(StdRng),
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    order: Order,
}

impl<T> State<T> {
    fn pop(&mut self) -> Option<T> {
        match &mut self.order {
            Order::Fifo => self.items.pop_front(),
            Order::Random(rng) => {
                if self.items.is_empty() {
                    return None;
                }
                let idx = rng.gen_range(0..self.items.len());
                self.items.swap_remove_back(idx)
            }
        }
    }
}

/// Bounded blocking queue shared between pipeline threads.
///
/// Enqueue blocks while the queue is full. Dequeue blocks until the queue
/// holds more than `min_after_dequeue` items; once the queue is closed the
/// remaining items drain regardless of the minimum. Every wait gives up with
/// [`Error::Cancelled`] when the coordinator requests a stop.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    min_after_dequeue: usize,
    coord: Coordinator,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, min_after_dequeue: usize, order: Order, coord: Coordinator) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        assert!(
            min_after_dequeue < capacity,
            "min_after_dequeue ({min_after_dequeue}) must be below capacity ({capacity})"
        );
        BoundedQueue {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(1 << 16)),
                closed: false,
                order,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            min_after_dequeue,
            coord,
        }
    }

    /// A plain FIFO without a fill gate.
    pub fn fifo(capacity: usize, coord: Coordinator) -> Self {
        BoundedQueue::new(capacity, 0, Order::Fifo, coord)
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, cv: &Condvar, guard: MutexGuard<'a, State<T>>) -> MutexGuard<'a, State<T>> {
        cv.wait_timeout(guard, POLL)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        let mut state = self.lock();
        loop {
            if self.coord.should_stop() || state.closed {
                return Err(Error::Cancelled);
            }
            if state.items.len() < self.capacity {
                break;
            }
            state = self.wait(&self.not_full, state);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Next item, or `Ok(None)` once the queue is closed and empty.
    pub fn dequeue(&self) -> Result<Option<T>> {
        let mut state = self.lock();
        loop {
            if self.coord.should_stop() {
                return Err(Error::Cancelled);
            }
            let len = state.items.len();
            if len > self.min_after_dequeue || (state.closed && len > 0) {
                break;
            }
            if state.closed {
                return Ok(None);
            }
            state = self.wait(&self.not_empty, state);
        }
        let item = state.pop();
        drop(state);
        self.not_full.notify_one();
        Ok(item)
    }

    /// Take exactly `n` items.
    ///
    /// When the queue closes with fewer than `n` items left, those items are
    /// returned if `allow_smaller` is set and dropped otherwise.
    pub fn dequeue_many(&self, n: usize, allow_smaller: bool) -> Result<Option<Vec<T>>> {
        let mut state = self.lock();
        loop {
            if self.coord.should_stop() {
                return Err(Error::Cancelled);
            }
            let available = state.items.len().saturating_sub(self.min_after_dequeue);
            if available >= n {
                break;
            }
            if state.closed {
                if allow_smaller && !state.items.is_empty() {
                    let rest: Vec<T> = std::iter::from_fn(|| state.pop()).collect();
                    drop(state);
                    self.not_full.notify_all();
                    return Ok(Some(rest));
                }
                state.items.clear();
                return Ok(None);
            }
            state = self.wait(&self.not_empty, state);
        }
        let batch: Vec<T> = (0..n).filter_map(|_| state.pop()).collect();
        drop(state);
        self.not_full.notify_all();
        Ok(Some(batch))
    }

    /// No more enqueues; consumers drain what is left.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn shuffle_queue(capacity: usize, min: usize) -> (Arc<BoundedQueue<u32>>, Coordinator) {
        let coord = Coordinator::new();
        let q = BoundedQueue::new(capacity, min, Order::Random(StdRng::seed_from_u64(7)), coord.clone());
        (Arc::new(q), coord)
    }

    #[test]
    fn nothing_dequeues_before_min_fill() {
        let (q, _coord) = shuffle_queue(10, 4);
        let (tx, rx) = mpsc::channel();
        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let item = q.dequeue().unwrap();
                tx.send(item).unwrap();
            })
        };

        for i in 0..4 {
            q.enqueue(i).unwrap();
        }
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        q.enqueue(4).unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(got.is_some());
        consumer.join().unwrap();
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn closed_queue_drains_below_min_fill() {
        let (q, _coord) = shuffle_queue(10, 4);
        for i in 0..3 {
            q.enqueue(i).unwrap();
        }
        q.close();
        let mut seen: Vec<u32> = std::iter::from_fn(|| q.dequeue().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(q.enqueue(9).is_err());
    }

    #[test]
    fn full_queue_blocks_producer_until_consumed() {
        let coord = Coordinator::new();
        let q = Arc::new(BoundedQueue::fifo(2, coord));
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                q.enqueue(3).unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(q.dequeue().unwrap(), Some(1));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        assert_eq!(q.dequeue().unwrap(), Some(2));
        assert_eq!(q.dequeue().unwrap(), Some(3));
    }

    #[test]
    fn dequeue_many_keeps_or_drops_the_remainder() {
        let coord = Coordinator::new();
        let q = BoundedQueue::fifo(8, coord.clone());
        for i in 0..5 {
            q.enqueue(i).unwrap();
        }
        q.close();
        assert_eq!(q.dequeue_many(2, false).unwrap(), Some(vec![0, 1]));
        assert_eq!(q.dequeue_many(2, false).unwrap(), Some(vec![2, 3]));
        assert_eq!(q.dequeue_many(2, false).unwrap(), None);

        let q = BoundedQueue::fifo(8, coord);
        for i in 0..3 {
            q.enqueue(i).unwrap();
        }
        q.close();
        assert_eq!(q.dequeue_many(2, true).unwrap(), Some(vec![0, 1]));
        assert_eq!(q.dequeue_many(2, true).unwrap(), Some(vec![2]));
        assert_eq!(q.dequeue_many(2, true).unwrap(), None);
    }

    #[test]
    fn stop_request_unblocks_waiters() {
        let (q, coord) = shuffle_queue(4, 2);
        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.dequeue())
        };
        thread::sleep(Duration::from_millis(30));
        coord.request_stop();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
    }
}
