use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Result of attempting to enqueue.
///
/// # Example
/// ```rust
/// use prism_core::prelude::{completion_queue, SendOutcome};
///
/// let (tx, _rx) = completion_queue::<u8>(1);
/// assert!(matches!(tx.send(1), SendOutcome::Ok));
/// ```
#[derive(Debug)]
pub enum SendOutcome<T> {
    /// Value was accepted.
    Ok,
    /// Queue is full; the value is handed back.
    Full(T),
    /// Queue is closed; the value is handed back.
    Closed(T),
}

/// Result of attempting to dequeue.
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received value.
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    /// Queue currently empty.
    Empty,
}

/// Producer side of a completion queue, used from stage completion callbacks.
pub struct CompletionTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for CompletionTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> CompletionTx<T> {
    /// Enqueue without blocking and wake one waiter.
    pub fn send(&self, value: T) -> SendOutcome<T> {
        // Pushing under the lock means nothing lands after `close` followed by a drain.
        let _guard = self.inner.lock.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed(value);
        }
        if let Err(value) = self.inner.queue.push(value) {
            return SendOutcome::Full(value);
        }
        self.inner.ready.notify_one();
        SendOutcome::Ok
    }

    /// Close the queue and wake every waiter.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Consumer side of a completion queue.
///
/// # Example
/// ```rust
/// use prism_core::prelude::{completion_queue, RecvOutcome};
///
/// let (tx, rx) = completion_queue::<u32>(4);
/// let producer = std::thread::spawn(move || {
///     let _ = tx.send(7);
/// });
/// assert!(matches!(rx.recv_blocking(), RecvOutcome::Data(7)));
/// producer.join().unwrap();
/// ```
pub struct CompletionRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for CompletionRx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> CompletionRx<T> {
    /// Attempt to receive without blocking.
    pub fn try_recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None if self.inner.closed.load(Ordering::Acquire) => RecvOutcome::Closed,
            None => RecvOutcome::Empty,
        }
    }

    /// Block the calling thread until a value arrives or the queue is closed.
    ///
    /// There is no timeout; closing the queue is the only way to unblock an idle waiter.
    pub fn recv_blocking(&self) -> RecvOutcome<T> {
        let mut guard = self.inner.lock.lock();
        loop {
            if let Some(value) = self.inner.queue.pop() {
                return RecvOutcome::Data(value);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return RecvOutcome::Closed;
            }
            self.inner.ready.wait(&mut guard);
        }
    }

    /// Pop everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.inner.queue.len());
        while let Some(value) = self.inner.queue.pop() {
            out.push(value);
        }
        out
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Mark the queue as closed; producers see `Closed` and waiters wake up.
    pub fn close(&self) {
        self.inner.close();
    }
}

struct QueueInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
    lock: Mutex<()>,
    ready: Condvar,
}

impl<T> QueueInner<T> {
    fn close(&self) {
        let _guard = self.lock.lock();
        self.closed.store(true, Ordering::Release);
        self.ready.notify_all();
    }
}

/// Create a completion queue holding at most `capacity` values.
pub fn completion_queue<T>(capacity: usize) -> (CompletionTx<T>, CompletionRx<T>) {
    let inner = Arc::new(QueueInner {
        queue: ArrayQueue::new(capacity.max(1)),
        closed: AtomicBool::new(false),
        lock: Mutex::new(()),
        ready: Condvar::new(),
    });
    (
        CompletionTx {
            inner: inner.clone(),
        },
        CompletionRx { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn full_and_closed_hand_value_back() {
        let (tx, rx) = completion_queue::<u8>(1);
        assert!(matches!(tx.send(1), SendOutcome::Ok));
        assert!(matches!(tx.send(2), SendOutcome::Full(2)));
        rx.close();
        assert!(matches!(tx.send(3), SendOutcome::Closed(3)));
        // Queued values are still delivered after close.
        assert!(matches!(rx.try_recv(), RecvOutcome::Data(1)));
        assert!(matches!(rx.recv_blocking(), RecvOutcome::Closed));
    }

    #[test]
    fn close_wakes_blocked_waiter() {
        let (tx, rx) = completion_queue::<u8>(2);
        let waiter = thread::spawn(move || matches!(rx.recv_blocking(), RecvOutcome::Closed));
        thread::sleep(Duration::from_millis(20));
        tx.close();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn preserves_fifo_order() {
        let (tx, rx) = completion_queue::<u32>(8);
        for i in 0..5 {
            assert!(matches!(tx.send(i), SendOutcome::Ok));
        }
        let got: Vec<u32> = (0..5)
            .filter_map(|_| match rx.recv_blocking() {
                RecvOutcome::Data(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert!(rx.is_empty());
    }
}
