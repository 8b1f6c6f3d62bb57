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

//! `IdleTask` / `TimeoutTask` support: a single background thread that
//! signals tasks once their deadline has elapsed.
//!
//! The timer thread owns a [`MinHeap`] of `(deadline, Weak<Task>)` entries.
//! It sleeps until either the nearest deadline elapses or a new, earlier
//! deadline is inserted, waking it early. A task is not automatically
//! re-armed after it fires; `RunResult::Reschedule` or an explicit
//! `refresh_timeout`/`set_idle_timer` call is required to insert it again.

use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};

use crate::heap::{HeapRef, MinHeap};
use crate::task::{EventFlags, Task};

struct Entry {
    task: Weak<Task>,
    bits: EventFlags,
}

struct Inner {
    heap: Mutex<MinHeap<Entry>>,
    wake: Condvar,
}

/// A handle to a single pending timed wake-up, usable to cancel it before
/// it fires.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<Inner>,
    heap_ref: HeapRef,
}

impl TimerHandle {
    /// Cancels the pending wake-up. A no-op if it already fired.
    pub fn cancel(&self) {
        self.inner.heap.lock().remove(&self.heap_ref);
    }
}

static TIMER: OnceLock<Arc<Inner>> = OnceLock::new();

fn timer() -> Arc<Inner> {
    TIMER
        .get_or_init(|| {
            let inner = Arc::new(Inner {
                heap: Mutex::new(MinHeap::new()),
                wake: Condvar::new(),
            });
            spawn_timer_thread(inner.clone());
            inner
        })
        .clone()
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn spawn_timer_thread(inner: Arc<Inner>) {
    thread::Builder::new()
        .name("taskio-timer".into())
        .spawn(move || loop {
            let mut heap = inner.heap.lock();
            match heap.peek_min() {
                None => {
                    inner.wake.wait(&mut heap);
                    continue;
                }
                Some(deadline) => {
                    let remaining = deadline - now_millis();
                    if remaining > 0 {
                        let dur = Duration::from_millis(remaining as u64);
                        inner.wake.wait_for(&mut heap, dur);
                        continue;
                    }
                }
            }

            let mut expired = Vec::new();
            while let Some(deadline) = heap.peek_min() {
                if deadline > now_millis() {
                    break;
                }
                if let Some(entry) = heap.extract_min() {
                    expired.push(entry);
                }
            }
            drop(heap);

            for entry in expired {
                if let Some(task) = entry.task.upgrade() {
                    task.signal(entry.bits);
                }
            }
        })
        .expect("failed to spawn timer thread");
}

/// Arranges for `task` to be signalled with `EventFlags::IDLE` after `delay`
/// has elapsed. Used to implement `RunResult::Reschedule`.
pub(crate) fn schedule_wakeup(task: &Arc<Task>, delay: Duration) {
    schedule(task, delay, EventFlags::IDLE);
}

/// Arms a timeout: `task` is signalled with `EventFlags::TIMEOUT` after
/// `delay`. Returns a handle that can cancel the timeout if the associated
/// work completes first.
pub fn set_timeout(task: &Arc<Task>, delay: Duration) -> TimerHandle {
    schedule(task, delay, EventFlags::TIMEOUT)
}

/// Arms an idle wake-up, identical to `set_timeout` but signalling
/// `EventFlags::IDLE`. Used by `TCPListenerSocket` to re-arm accepts after
/// `fSleepBetweenAccepts`.
pub fn set_idle_timer(task: &Arc<Task>, delay: Duration) -> TimerHandle {
    schedule(task, delay, EventFlags::IDLE)
}

fn schedule(task: &Arc<Task>, delay: Duration, bits: EventFlags) -> TimerHandle {
    let inner = timer();
    let deadline = now_millis() + delay.as_millis() as i64;

    let mut heap = inner.heap.lock();
    let was_earliest = heap.peek_min().map(|d| deadline < d).unwrap_or(true);
    let heap_ref = heap.insert(
        deadline,
        Entry {
            task: Arc::downgrade(task),
            bits,
        },
    );
    drop(heap);

    if was_earliest {
        inner.wake.notify_one();
    }

    TimerHandle { inner, heap_ref }
}
