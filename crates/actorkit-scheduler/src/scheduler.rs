// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer worker pool.
//!
//! N worker threads share one deadline heap. A worker sleeps on the condvar
//! until the earliest deadline, pops the entry, runs the callback with the
//! heap unlocked, then re-arms repeating tasks. A task is out of the heap
//! while its callback runs, so it never re-enters itself.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::Cancellable;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::scheduled::Scheduled;
use crate::task::{Cadence, TimerEntry, TimerTask};

/// Heap length below which cancelled entries are left for the workers.
const MIN_PURGE_LEN: usize = 64;

/// Timer multiplexer producing one-shot or repeating signals.
///
/// Shared as `Arc<Scheduler>` by everything that needs deadlines. Closing
/// (explicitly or on drop) cancels every outstanding task.
pub struct Scheduler {
    /// Worker handles for join-on-close.
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    /// State shared with the workers.
    shared: Arc<SharedState>,
}

/// State shared between workers and schedulers of new tasks.
struct SharedState {
    timers: Mutex<BinaryHeap<TimerEntry>>,
    /// Notified on every push and on close.
    timer_added: Condvar,
    closed: AtomicBool,
    next_id: AtomicU64,
    /// Heap length that triggers the next purge of cancelled entries.
    purge_at: AtomicUsize,
}

impl Scheduler {
    /// Start the worker pool described by `config`.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let shared = Arc::new(SharedState {
            timers: Mutex::new(BinaryHeap::new()),
            timer_added: Condvar::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            purge_at: AtomicUsize::new(MIN_PURGE_LEN),
        });

        let worker_count = config.resolved_workers();
        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, id))
                .spawn(move || worker_loop(id, &worker_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop the workers that did start before reporting.
                    shared.closed.store(true, Ordering::Release);
                    shared.timer_added.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(SchedulerError::Spawn(e));
                }
            }
        }

        tracing::debug!(workers = worker_count, "scheduler started");
        Ok(Self {
            workers: Mutex::new(handles),
            shared,
        })
    }

    /// Signal `receiver` exactly once, `delay_before + interval` from now.
    pub fn schedule_once<D>(
        &self,
        receiver: Arc<dyn Scheduled<D>>,
        data: D,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable
    where
        D: Send + Sync + 'static,
    {
        self.register(receiver, data, delay_before + interval, Cadence::Once)
    }

    /// Signal `receiver` after `delay_before`, then every `interval` until
    /// the returned handle is cancelled.
    pub fn schedule<D>(
        &self,
        receiver: Arc<dyn Scheduled<D>>,
        data: D,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable
    where
        D: Send + Sync + 'static,
    {
        self.register(receiver, data, delay_before, Cadence::Every(interval))
    }

    fn register<D>(
        &self,
        receiver: Arc<dyn Scheduled<D>>,
        data: D,
        first_after: Duration,
        cadence: Cadence,
    ) -> Cancellable
    where
        D: Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            tracing::warn!(task = id, "schedule called on a closed scheduler");
            return Cancellable::cancelled(id);
        }

        let handle = Cancellable::new(id);
        let task = TimerTask::new(handle.clone(), cadence, receiver, data);
        push_entry(&self.shared, Instant::now() + first_after, task);
        tracing::trace!(task = id, ?cadence, ?first_after, "timer armed");
        handle
    }

    /// Number of queued timers that have not been cancelled. Scans the heap.
    pub fn pending_tasks(&self) -> usize {
        self.shared
            .timers
            .lock()
            .iter()
            .filter(|entry| !entry.task.is_cancelled())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Cancel every outstanding task and stop the workers. Idempotent.
    ///
    /// Joins every worker except the calling thread, so closing from inside
    /// a callback does not deadlock.
    pub fn close(&self) {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let drained: Vec<TimerEntry> = {
            let mut timers = self.shared.timers.lock();
            let drained = timers.drain().collect();
            self.shared.timer_added.notify_all();
            drained
        };
        let cancelled = drained.len();
        for entry in drained {
            entry.task.handle.cancel();
        }

        let current = thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        tracing::debug!(cancelled, "scheduler closed");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending_tasks", &self.pending_tasks())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

fn push_entry(shared: &SharedState, deadline: Instant, task: Arc<TimerTask>) {
    let seq = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let mut timers = shared.timers.lock();
    timers.push(TimerEntry {
        deadline,
        seq,
        task,
    });
    // Cancelled entries otherwise stay queued until they reach the head.
    if timers.len() >= shared.purge_at.load(Ordering::Relaxed) {
        let before = timers.len();
        timers.retain(|entry| !entry.task.is_cancelled());
        shared
            .purge_at
            .store((timers.len() * 2).max(MIN_PURGE_LEN), Ordering::Relaxed);
        tracing::trace!(purged = before - timers.len(), "cancelled timers purged");
    }
    shared.timer_added.notify_one();
}

/// Worker main loop.
fn worker_loop(id: usize, shared: &SharedState) {
    tracing::trace!(worker = id, "timer worker started");
    while let Some(entry) = next_due(shared) {
        run_entry(entry, shared);
    }
    tracing::trace!(worker = id, "timer worker stopped");
}

/// Block until an entry is due. Returns `None` once the scheduler closes.
fn next_due(shared: &SharedState) -> Option<TimerEntry> {
    let mut timers = shared.timers.lock();
    loop {
        if shared.closed.load(Ordering::Acquire) {
            return None;
        }

        let deadline = match timers.peek() {
            None => {
                shared.timer_added.wait(&mut timers);
                continue;
            }
            Some(head) if head.task.is_cancelled() => {
                timers.pop();
                continue;
            }
            Some(head) => head.deadline,
        };

        if deadline <= Instant::now() {
            return timers.pop();
        }
        shared.timer_added.wait_until(&mut timers, deadline);
    }
}

/// Fire one due entry, then re-arm it if it repeats and is still live.
fn run_entry(entry: TimerEntry, shared: &SharedState) {
    let task = entry.task;
    if task.is_cancelled() {
        return;
    }

    let fired = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.fire()));
    if let Err(payload) = fired {
        tracing::warn!(
            task = task.handle.id(),
            panic = %panic_message(&*payload),
            "scheduled receiver panicked; task will not re-arm"
        );
        task.handle.cancel();
        return;
    }

    if task.is_cancelled() || shared.closed.load(Ordering::Acquire) {
        return;
    }
    if let Some(next) = task.next_deadline(Instant::now()) {
        push_entry(shared, next, task);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_receiver(count: &Arc<AtomicUsize>) -> Arc<dyn Scheduled<()>> {
        let c = count.clone();
        Arc::new(move |_: &Cancellable, _: &()| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancelled_timers_are_purged() {
        let sched = Scheduler::new(SchedulerConfig::new().workers(1)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..MIN_PURGE_LEN * 3 {
            let handle = sched.schedule_once(
                counter_receiver(&count),
                (),
                Duration::from_secs(60),
                Duration::ZERO,
            );
            handle.cancel();
        }
        assert!(sched.shared.timers.lock().len() < MIN_PURGE_LEN);
        assert_eq!(sched.pending_tasks(), 0);
        sched.close();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn starts_and_closes() {
        let sched = Scheduler::new(SchedulerConfig::default()).unwrap();
        assert!(!sched.is_closed());
        sched.close();
        assert!(sched.is_closed());
        sched.close();
    }

    #[test]
    fn close_cancels_outstanding() {
        let sched = Scheduler::new(SchedulerConfig::new().workers(1)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = sched.schedule_once(
            counter_receiver(&count),
            (),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        assert_eq!(sched.pending_tasks(), 1);
        sched.close();
        assert!(handle.is_cancelled());
        assert_eq!(sched.pending_tasks(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn schedule_after_close_is_cancelled() {
        let sched = Scheduler::new(SchedulerConfig::default()).unwrap();
        sched.close();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = sched.schedule(
            counter_receiver(&count),
            (),
            Duration::ZERO,
            Duration::from_millis(1),
        );
        assert!(handle.is_cancelled());
        assert_eq!(sched.pending_tasks(), 0);
    }

    #[test]
    fn panicking_receiver_does_not_kill_worker() {
        let sched = Scheduler::new(SchedulerConfig::new().workers(1)).unwrap();
        let boom: Arc<dyn Scheduled<()>> =
            Arc::new(|_: &Cancellable, _: &()| panic!("receiver failure"));
        let bad = sched.schedule(boom, (), Duration::ZERO, Duration::from_millis(1));

        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule_once(
            counter_receiver(&count),
            (),
            Duration::from_millis(20),
            Duration::ZERO,
        );
        thread::sleep(Duration::from_millis(200));
        assert!(bad.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sched.close();
    }

    #[test]
    fn close_from_inside_callback() {
        let sched = Arc::new(Scheduler::new(SchedulerConfig::new().workers(1)).unwrap());
        let weak = Arc::downgrade(&sched);
        let closer: Arc<dyn Scheduled<()>> = Arc::new(move |_: &Cancellable, _: &()| {
            if let Some(s) = weak.upgrade() {
                s.close();
            }
        });
        sched.schedule_once(closer, (), Duration::ZERO, Duration::from_millis(1));
        for _ in 0..100 {
            if sched.is_closed() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(sched.is_closed());
    }
}
