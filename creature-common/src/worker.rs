// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Cooperative cancellation flag handed to every worker body.
///
/// Workers poll this at their suspension points (mailbox pops, `poll(2)`
/// timeouts, tick sleeps) and return when it reads true.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A named background thread with a stop flag and a bounded-wait join.
///
/// The join has a timeout: a worker stuck in a syscall gets
/// detached rather than hanging process shutdown. Leaking one thread at
/// exit beats never exiting.
pub struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a named thread running `body` until it returns or observes
    /// the stop flag.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Worker>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = StopFlag(Arc::clone(&stop));
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!(worker = %thread_name, "worker started");
                body(flag);
                debug!(worker = %thread_name, "worker finished");
            })?;
        Ok(Worker {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raises the stop flag without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Waits up to `timeout` for the thread to finish, then joins it.
    /// Returns false (and detaches the thread) if the deadline passes.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = %self.name, "did not stop in time, detaching");
                // Dropping the handle detaches the thread.
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = handle.join();
        true
    }

    /// Signals stop and joins with the given timeout.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        self.join_timeout(timeout)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop(Duration::from_millis(500));
        }
    }
}
