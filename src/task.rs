// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The cooperative task scheduler.
//!
//! A [`Task`] wraps a [`Runnable`] with an atomic event-flag word. Signalling
//! a task ORs bits into that word and, the first time the word transitions
//! from idle, hands the task to a worker thread. Worker threads share one
//! ready queue by default, except a task that parked while still holding a
//! lock can pin itself to the thread it's already running on, so whoever
//! signals it next can't resume it from an unrelated thread and invert lock
//! order.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender};

const UNPINNED: usize = usize::MAX;

/// A bitset of reasons a [`Task`] was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags(u32);

impl EventFlags {
    /// The associated descriptor became readable.
    pub const READ: EventFlags = EventFlags(1 << 0);
    /// The associated descriptor became writable.
    pub const WRITE: EventFlags = EventFlags(1 << 1);
    /// A `TimeoutTask` deadline elapsed.
    pub const TIMEOUT: EventFlags = EventFlags(1 << 2);
    /// An `IdleTask` wake-up time elapsed.
    pub const IDLE: EventFlags = EventFlags(1 << 3);
    /// The task has been asked to terminate.
    pub const KILL: EventFlags = EventFlags(1 << 4);
    /// First dispatch after creation.
    pub const START: EventFlags = EventFlags(1 << 5);

    /// The empty set.
    pub const NONE: EventFlags = EventFlags(0);

    fn bits(self) -> u32 {
        self.0
    }

    /// True if no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if `self` contains every bit in `other`.
    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = EventFlags;
    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (EventFlags::READ, "READ"),
            (EventFlags::WRITE, "WRITE"),
            (EventFlags::TIMEOUT, "TIMEOUT"),
            (EventFlags::IDLE, "IDLE"),
            (EventFlags::KILL, "KILL"),
            (EventFlags::START, "START"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// The outcome of running a [`Task`] once.
#[derive(Debug)]
pub enum RunResult {
    /// The task is finished; it will never be run again.
    Destroy,
    /// Wait for the next `Signal`.
    Park,
    /// Run again after `Duration` has elapsed, via the timer thread.
    Reschedule(Duration),
}

/// The work a [`Task`] performs each time it's dispatched.
pub trait Runnable: Send + Sync {
    /// Runs once with the union of event bits that caused this dispatch.
    /// `events` is cleared atomically before this is called, so any bits
    /// set by a concurrent `Signal` while this call is in flight are
    /// preserved for the *next* call rather than lost.
    fn run(&self, task: &Task, events: EventFlags) -> RunResult;
}

/// A schedulable unit of work.
///
/// `Task` itself is the bookkeeping the scheduler needs (event word,
/// affinity, holder count); the behavior lives in the `Runnable` it wraps.
pub struct Task {
    name: &'static str,
    runnable: Box<dyn Runnable>,
    events: AtomicU32,
    queued: AtomicBool,
    pinned_thread: AtomicUsize,
    pool: Weak<TaskThreadPool>,
    holders: AtomicUsize,
    self_weak: Weak<Task>,
}

thread_local! {
    static CURRENT_WORKER: Cell<usize> = const { Cell::new(UNPINNED) };
}

impl Task {
    fn new(name: &'static str, runnable: Box<dyn Runnable>, pool: Weak<TaskThreadPool>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name,
            runnable,
            events: AtomicU32::new(0),
            queued: AtomicBool::new(false),
            pinned_thread: AtomicUsize::new(UNPINNED),
            pool,
            holders: AtomicUsize::new(1),
            self_weak: weak.clone(),
        })
    }

    /// Diagnostic name given at construction.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Recovers an owning `Arc` to this task from within its own `Run()`,
    /// where only `&Task` is available but an `Arc<Task>` is needed (e.g.
    /// to bind an `EventLoop` token or arm a timer).
    pub fn handle(&self) -> Arc<Task> {
        self.self_weak
            .upgrade()
            .expect("task handle outlives its own Arc")
    }

    /// Pins subsequent resumption to the worker thread currently executing
    /// `Run`. Call this immediately before returning `Park` while still
    /// holding a lock the next `Run` must reacquire in order.
    pub fn force_same_thread(&self) {
        let idx = CURRENT_WORKER.with(|c| c.get());
        if idx != UNPINNED {
            self.pinned_thread.store(idx, Ordering::Release);
        }
    }

    /// Releases a previous `force_same_thread` pin, returning this task to
    /// the shared ready queue.
    pub fn clear_force_same_thread(&self) {
        self.pinned_thread.store(UNPINNED, Ordering::Release);
    }

    /// Increments the holder count, keeping the task alive even if the
    /// scheduler would otherwise destroy it.
    pub fn add_holder(&self) {
        self.holders.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the holder count. Returns the count after decrementing.
    pub fn remove_holder(&self) -> usize {
        self.holders.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Atomically ORs `bits` into the event word. The first signal that
    /// transitions the task from idle to scheduled enqueues it; further
    /// signals while it's already scheduled are coalesced and observed on
    /// the next `Run`.
    pub fn signal(self: &Arc<Self>, bits: EventFlags) {
        self.events.fetch_or(bits.bits(), Ordering::AcqRel);
        if !self.queued.swap(true, Ordering::AcqRel) {
            self.enqueue();
        }
    }

    fn enqueue(self: &Arc<Self>) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let pinned = self.pinned_thread.load(Ordering::Acquire);
        if pinned != UNPINNED {
            if let Some(tx) = pool.pinned_senders.get(pinned) {
                let _ = tx.send(self.clone());
                return;
            }
        }
        let _ = pool.shared_sender.send(self.clone());
    }

    fn take_events(&self) -> EventFlags {
        EventFlags(self.events.swap(0, Ordering::AcqRel))
    }

    fn mark_idle(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Re-claims the scheduled flag if a signal raced with `mark_idle`.
    /// Returns true if the caller should run the task again immediately
    /// rather than waiting for an external signal.
    fn reclaim_if_signalled(&self) -> bool {
        self.events.load(Ordering::Acquire) != 0 && !self.queued.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("holders", &self.holders.load(Ordering::Relaxed))
            .finish()
    }
}

/// Which sub-pool a task's blocking behavior requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Non-blocking, CPU-light work; the default.
    ShortTask,
    /// Work that may perform blocking syscalls (accept, setsockopt).
    Blocking,
}

/// A fixed-size pool of worker threads draining a shared ready queue, plus
/// a private per-thread channel used only for `force_same_thread` pins.
pub struct TaskThreadPool {
    name: &'static str,
    shared_sender: Sender<Arc<Task>>,
    pinned_senders: Vec<Sender<Arc<Task>>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskThreadPool {
    /// Spawns `num_threads` workers under `name`. `num_threads == 0` is
    /// treated as a programming error by the caller (see `RuntimeConfig`
    /// for the "0 means auto" resolution, done before this is called).
    pub fn new(name: &'static str, num_threads: usize) -> Arc<Self> {
        assert!(num_threads > 0, "task thread pool needs at least one thread");

        let (shared_sender, shared_receiver) = crossbeam_channel::unbounded::<Arc<Task>>();
        let mut pinned_senders = Vec::with_capacity(num_threads);
        let mut pinned_receivers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let (tx, rx) = crossbeam_channel::unbounded::<Arc<Task>>();
            pinned_senders.push(tx);
            pinned_receivers.push(rx);
        }

        let pool = Arc::new(Self {
            name,
            shared_sender,
            pinned_senders,
            handles: std::sync::Mutex::new(Vec::with_capacity(num_threads)),
        });

        let mut handles = Vec::with_capacity(num_threads);
        for (idx, pinned_rx) in pinned_receivers.into_iter().enumerate() {
            let shared_rx = shared_receiver.clone();
            let thread_name = format!("{name}-{idx}");
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(idx, shared_rx, pinned_rx))
                .expect("failed to spawn task thread");
            handles.push(handle);
        }
        *pool.handles.lock().unwrap() = handles;

        pool
    }

    /// Spawns a new task bound to this pool and signals it with
    /// `EventFlags::START`.
    pub fn spawn(self: &Arc<Self>, name: &'static str, runnable: impl Runnable + 'static) -> Arc<Task> {
        let task = Task::new(name, Box::new(runnable), Arc::downgrade(self));
        task.signal(EventFlags::START);
        task
    }

    /// Diagnostic name given at construction.
    pub fn name(&self) -> &str {
        self.name
    }
}

fn worker_loop(idx: usize, shared_rx: Receiver<Arc<Task>>, pinned_rx: Receiver<Arc<Task>>) {
    CURRENT_WORKER.with(|c| c.set(idx));

    loop {
        let mut select = Select::new();
        let pinned_idx = select.recv(&pinned_rx);
        let shared_idx = select.recv(&shared_rx);

        let oper = select.select();
        let task = match oper.index() {
            i if i == pinned_idx => oper.recv(&pinned_rx),
            i if i == shared_idx => oper.recv(&shared_rx),
            _ => unreachable!(),
        };

        let Ok(task) = task else {
            // Both channels disconnected: the pool is shutting down.
            return;
        };

        run_task_to_quiescence(&task);
    }
}

fn run_task_to_quiescence(task: &Arc<Task>) {
    loop {
        let events = task.take_events();
        if events.is_empty() {
            // Spurious wakeup with nothing pending: drop back to idle.
            task.mark_idle();
            return;
        }

        match task.runnable.run(task, events) {
            RunResult::Destroy => {
                task.mark_idle();
                return;
            }
            RunResult::Park => {
                task.mark_idle();
                if task.reclaim_if_signalled() {
                    continue;
                }
                return;
            }
            RunResult::Reschedule(duration) => {
                task.mark_idle();
                crate::timer::schedule_wakeup(task, duration);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Barrier;

    struct CountingRunnable {
        runs: StdAtomicUsize,
        destroy_after: usize,
    }

    impl Runnable for CountingRunnable {
        fn run(&self, _task: &Task, _events: EventFlags) -> RunResult {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.destroy_after {
                RunResult::Destroy
            } else {
                RunResult::Park
            }
        }
    }

    #[test]
    fn signal_runs_task_on_pool() {
        let pool = TaskThreadPool::new("test-pool", 2);
        let runnable = CountingRunnable {
            runs: StdAtomicUsize::new(0),
            destroy_after: 1,
        };
        let _task = pool.spawn("countdown", runnable);
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn repeated_signals_before_run_coalesce() {
        let barrier = Arc::new(Barrier::new(1));
        let _ = barrier;
        let pool = TaskThreadPool::new("coalesce-pool", 1);

        struct Observe(StdAtomicUsize);
        impl Runnable for Observe {
            fn run(&self, _task: &Task, events: EventFlags) -> RunResult {
                self.0.fetch_add(1, Ordering::SeqCst);
                assert!(events.contains(EventFlags::READ));
                RunResult::Destroy
            }
        }

        let runnable = Observe(StdAtomicUsize::new(0));
        let task = Task::new("observe", Box::new(runnable), Arc::downgrade(&pool));
        task.signal(EventFlags::READ);
        task.signal(EventFlags::READ);
        std::thread::sleep(Duration::from_millis(50));
    }
}
