use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

/// Items carrying a "pending" flag may sit in at most one queue slot at a time.
pub trait Pending {
    fn pending_flag(&self) -> &AtomicBool;
}

/// Hooks a queue calls around enqueue and dequeue.
pub trait QueueItem {
    /// Returns `false` if the item is already enqueued somewhere.
    fn mark_pending(&self) -> bool {
        true
    }

    fn clear_pending(&self) {}
}

impl<T> QueueItem for Arc<T>
where
    T: Pending,
{
    fn mark_pending(&self) -> bool {
        !self.pending_flag().swap(true, Ordering::AcqRel)
    }

    fn clear_pending(&self) {
        self.pending_flag().store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub enum PushError<T> {
    Full(T),
    AlreadyPending(T),
}

impl<T> PushError<T> {
    #[must_use]
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(x) => x,
            PushError::AlreadyPending(x) => x,
        }
    }
}

/// Bounded producer/consumer queue guarded by a mutex and a condition variable.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    cap: usize,
}

impl<T> BoundedQueue<T>
where
    T: QueueItem,
{
    #[must_use]
    pub fn new(cap: usize) -> Self {
        BoundedQueue {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            cap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // a panicking holder cannot leave the deque itself inconsistent
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        if !item.mark_pending() {
            return Err(PushError::AlreadyPending(item));
        }
        let mut items = self.lock();
        if items.len() >= self.cap {
            drop(items);
            item.clear_pending();
            return Err(PushError::Full(item));
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if let Some(item) = &item {
            item.clear_pending();
        }
        item
    }

    /// Blocks for at most `timeout` waiting for an item.
    #[must_use]
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                drop(items);
                item.clear_pending();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            items = guard;
        }
    }

    /// Wakes every blocked consumer without handing them an item.
    pub fn notify_all(&self) {
        self.not_empty.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.cap
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicBool, Arc},
        thread,
        time::Duration,
    };

    use super::{BoundedQueue, Pending, PushError, QueueItem};

    struct Plain(u32);
    impl QueueItem for Plain {}

    struct Flagged {
        pending: AtomicBool,
    }
    impl Pending for Flagged {
        fn pending_flag(&self) -> &AtomicBool {
            &self.pending
        }
    }

    #[test]
    fn test_full() {
        let que = BoundedQueue::new(2);
        que.try_push(Plain(1)).map_err(|_| ()).unwrap();
        que.try_push(Plain(2)).map_err(|_| ()).unwrap();
        match que.try_push(Plain(3)) {
            Err(PushError::Full(x)) => assert_eq!(x.0, 3),
            _ => panic!(),
        }
        assert_eq!(que.try_pop().unwrap().0, 1);
        assert_eq!(que.try_pop().unwrap().0, 2);
        assert!(que.try_pop().is_none());
    }

    #[test]
    fn test_pending_once() {
        let que = BoundedQueue::new(4);
        let item = Arc::new(Flagged {
            pending: AtomicBool::new(false),
        });
        que.try_push(Arc::clone(&item)).map_err(|_| ()).unwrap();
        match que.try_push(Arc::clone(&item)) {
            Err(PushError::AlreadyPending(_)) => (),
            _ => panic!(),
        }
        let _popped = que.try_pop().unwrap();
        que.try_push(item).map_err(|_| ()).unwrap();
    }

    #[test]
    fn test_full_clears_pending() {
        let que = BoundedQueue::new(0);
        let item = Arc::new(Flagged {
            pending: AtomicBool::new(false),
        });
        assert!(matches!(
            que.try_push(Arc::clone(&item)),
            Err(PushError::Full(_))
        ));
        assert!(item.mark_pending());
    }

    #[test]
    fn test_pop_wait() {
        let que = Arc::new(BoundedQueue::new(1));
        assert!(que.pop_wait(Duration::from_millis(10)).is_none());
        let que1 = Arc::clone(&que);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            que1.try_push(Plain(7)).map_err(|_| ()).unwrap();
        });
        let item = que.pop_wait(Duration::from_secs(5)).unwrap();
        assert_eq!(item.0, 7);
        producer.join().unwrap();
    }
}
