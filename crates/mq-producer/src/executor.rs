// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background execution.
//!
//! [`WorkerPool`] is a fixed-size pool over a bounded crossbeam channel. The
//! producer runs two of these: one delivering async send callbacks, one
//! servicing broker transaction checks. Submission never blocks; a full
//! queue hands the job back to the caller.
//!
//! [`PeriodicTask`] is a named thread running a closure at a fixed period
//! (route refresh, housekeeping).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

/// Unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Jobs run to completion.
    pub executed: AtomicU64,
    /// Jobs handed back because the queue was full or closed.
    pub rejected: AtomicU64,
    /// Jobs that panicked.
    pub panicked: AtomicU64,
}

/// Snapshot of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub executed: u64,
    pub rejected: u64,
    pub panicked: u64,
}

/// Named worker threads sharing one bounded job queue.
pub struct WorkerPool {
    name: String,
    sender: RwLock<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `{name}-{i}` sharing a queue of
    /// `capacity` pending jobs.
    pub fn new(name: &str, threads: usize, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded::<Job>(capacity.max(1));
        let stats = Arc::new(PoolStats::default());

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let stats = Arc::clone(&stats);
            let thread_name = format!("{name}-{i}");
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || Self::run_worker(&thread_name, rx, stats))?;
            workers.push(handle);
        }

        log::debug!(
            "[pool] {} started: {} threads, capacity {}",
            name,
            workers.len(),
            capacity
        );

        Ok(Self {
            name: name.to_string(),
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            stats,
        })
    }

    fn run_worker(thread_name: &str, rx: Receiver<Job>, stats: Arc<PoolStats>) {
        // Exits once every sender is gone and the queue is drained.
        for job in rx.iter() {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                log::error!("[pool] job panicked on {}", thread_name);
            } else {
                stats.executed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Queue a job. A full or shut-down pool returns the job unrun.
    pub fn try_execute(&self, job: Job) -> Result<(), Job> {
        let guard = self.sender.read();
        let Some(tx) = guard.as_ref() else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(job);
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(job)
            }
        }
    }

    /// Queue a job, running it on the calling thread if the pool rejects it.
    pub fn execute_or_run(&self, job: Job) {
        if let Err(job) = self.try_execute(job) {
            log::debug!("[pool] {} rejected job, running inline", self.name);
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                log::error!("[pool] inline job for {} panicked", self.name);
            }
        }
    }

    /// Whether the pool still accepts jobs.
    pub fn is_running(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            executed: self.stats.executed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            panicked: self.stats.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs, drain the queue and join the workers.
    ///
    /// Called from one of the pool's own workers, that worker is left to
    /// exit on its own instead of being joined.
    pub fn shutdown(&self) {
        if self.sender.write().take().is_none() {
            return;
        }
        let current = std::thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        log::debug!("[pool] {} stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Thread running a closure every `interval` until shut down.
pub struct PeriodicTask {
    name: String,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl PeriodicTask {
    /// Wake-up granularity while waiting for the next run.
    const TICK: Duration = Duration::from_millis(50);

    /// Spawn a thread named `name`; the first run happens one `interval`
    /// after spawning.
    pub fn spawn<F>(name: &str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::debug!("[pool] {} started ({:?})", thread_name, interval);
                let mut next_run = Instant::now() + interval;
                while running_clone.load(Ordering::Relaxed) {
                    if Instant::now() >= next_run {
                        if catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
                            log::error!("[pool] {} run panicked", thread_name);
                        }
                        next_run = Instant::now() + interval;
                    }
                    std::thread::sleep(Self::TICK.min(interval));
                }
                log::debug!("[pool] {} stopped", thread_name);
            })?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            running,
        })
    }

    /// Stop the thread and wait for the current run to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
