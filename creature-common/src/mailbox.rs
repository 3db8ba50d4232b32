// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Returned by blocking pops once [`Mailbox::request_shutdown`] has latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("mailbox is shutting down")]
pub struct MailboxClosed;

struct State<T> {
    queue: VecDeque<T>,
    shutdown: bool,
}

/// A FIFO hand-off between worker threads.
///
/// `push` never blocks and there is no hard capacity; the text queues this
/// carries hold small, infrequent items, and the audio path has its own
/// bounded ring. The distinguishing feature is shutdown signalling: once
/// [`request_shutdown`](Mailbox::request_shutdown) is called, every current
/// and future blocking pop returns [`MailboxClosed`] until
/// [`reset`](Mailbox::reset).
pub struct Mailbox<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Appends a value and wakes at most one waiter.
    pub fn push(&self, value: T) {
        let mut state = self.lock();
        state.queue.push_back(value);
        self.cond.notify_one();
    }

    /// Blocks until a value is available or shutdown is requested.
    pub fn pop(&self) -> Result<T, MailboxClosed> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Err(MailboxClosed);
            }
            if let Some(value) = state.queue.pop_front() {
                return Ok(value);
            }
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Blocks up to `timeout`. `Ok(None)` means the timer ran out with
    /// nothing to deliver.
    pub fn pop_timed(&self, timeout: Duration) -> Result<Option<T>, MailboxClosed> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Err(MailboxClosed);
            }
            if let Some(value) = state.queue.pop_front() {
                return Ok(Some(value));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _timed_out) = match self.cond.wait_timeout(state, deadline - now) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
    }

    /// Snapshot only; another thread may change the answer immediately.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Snapshot only; see [`len`](Mailbox::len).
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Discards all pending values without delivering them.
    pub fn clear(&self) {
        self.lock().queue.clear();
    }

    /// Latches the shutdown flag and wakes every waiter. Idempotent.
    pub fn request_shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Clears the shutdown latch so the mailbox can be reused.
    pub fn reset(&self) {
        self.lock().shutdown = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn push_pop_preserves_order() {
        let mailbox = Mailbox::new();
        mailbox.push(1);
        mailbox.push(2);
        mailbox.push(3);
        assert_eq!(mailbox.pop(), Ok(1));
        assert_eq!(mailbox.pop(), Ok(2));
        assert_eq!(mailbox.pop(), Ok(3));
    }

    #[test]
    fn pop_timed_returns_none_on_timeout() {
        let mailbox: Mailbox<i32> = Mailbox::new();
        let start = Instant::now();
        let result = mailbox.pop_timed(Duration::from_millis(20));
        assert_eq!(result, Ok(None));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn pop_timed_delivers_value_pushed_from_another_thread() {
        let mailbox = Arc::new(Mailbox::new());
        let producer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                mailbox.push(42);
            })
        };
        assert_eq!(mailbox.pop_timed(Duration::from_secs(1)), Ok(Some(42)));
        producer.join().unwrap();
    }

    #[test]
    fn shutdown_wakes_blocked_pop_promptly() {
        let mailbox: Arc<Mailbox<i32>> = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                let start = Instant::now();
                let result = mailbox.pop_timed(Duration::from_secs(1));
                (result, start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        mailbox.request_shutdown();
        let (result, elapsed) = waiter.join().unwrap();
        assert_eq!(result, Err(MailboxClosed));
        assert!(
            elapsed < Duration::from_millis(200),
            "blocked pop took {}ms to observe shutdown",
            elapsed.as_millis()
        );
    }

    #[test]
    fn shutdown_latches_until_reset() {
        let mailbox = Mailbox::new();
        mailbox.push(1);
        mailbox.request_shutdown();
        assert_eq!(mailbox.pop(), Err(MailboxClosed));
        assert_eq!(mailbox.pop_timed(Duration::from_millis(1)), Err(MailboxClosed));

        mailbox.reset();
        assert_eq!(mailbox.pop(), Ok(1));
    }

    #[test]
    fn clear_discards_pending_values() {
        let mailbox = Mailbox::new();
        mailbox.push("a");
        mailbox.push("b");
        assert_eq!(mailbox.len(), 2);
        mailbox.clear();
        assert!(mailbox.is_empty());
    }

    #[test]
    fn multithreaded_push_pop_stays_ordered_per_producer() {
        let mailbox = Arc::new(Mailbox::new());
        let producer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                for i in 1..=100 {
                    mailbox.push(i);
                }
            })
        };
        let mut popped = Vec::new();
        for _ in 0..100 {
            popped.push(mailbox.pop().unwrap());
        }
        producer.join().unwrap();
        assert_eq!(popped, (1..=100).collect::<Vec<_>>());
    }
}
