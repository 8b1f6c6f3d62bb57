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

//! A reader/writer mutex with writer preference.
//!
//! `std::sync::RwLock` does not promise writers won't starve under a stream
//! of readers, which the session layer depends on (a handler blocked on a
//! write lock must not wait behind an unbounded run of readers). This is a
//! small state machine behind a `parking_lot::Mutex` and two condition
//! variables, carrying the same policy as the original `RWMutex`.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

const MAX_WAIT: Duration = Duration::from_secs(60);

struct State {
    active_readers: u32,
    active_writer: bool,
    waiting_readers: u32,
    waiting_writers: u32,
}

impl State {
    fn active(&self) -> bool {
        self.active_writer || self.active_readers > 0
    }
}

/// A writer-preferring reader/writer mutex.
///
/// Guards are plain RAII types ([`ReadGuard`], [`WriteGuard`]) that release
/// the lock on drop; there is no data protected directly by this type
/// (unlike `std::sync::RwLock<T>`) because in this framework the mutex
/// serializes access to request/response state that already lives behind
/// other owned fields.
pub struct RwMutex {
    state: Mutex<State>,
    readers_may_proceed: Condvar,
    writers_may_proceed: Condvar,
}

impl Default for RwMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RwMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                active_readers: 0,
                active_writer: false,
                waiting_readers: 0,
                waiting_writers: 0,
            }),
            readers_may_proceed: Condvar::new(),
            writers_may_proceed: Condvar::new(),
        }
    }

    /// Blocks until a read lock can be acquired.
    ///
    /// A reader that arrives while a writer is active, or while any writer
    /// is waiting, blocks until every such writer has been served -- this
    /// is the writer-preference policy.
    pub fn lock_read(&self) -> ReadGuard<'_> {
        let mut state = self.state.lock();
        state.waiting_readers += 1;
        while state.active_writer || state.waiting_writers > 0 {
            self.readers_may_proceed
                .wait_for(&mut state, MAX_WAIT);
        }
        state.waiting_readers -= 1;
        state.active_readers += 1;
        ReadGuard { mutex: self }
    }

    /// Blocks until a write lock can be acquired.
    pub fn lock_write(&self) -> WriteGuard<'_> {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.active() {
            self.writers_may_proceed
                .wait_for(&mut state, MAX_WAIT);
        }
        state.waiting_writers -= 1;
        state.active_writer = true;
        WriteGuard { mutex: self }
    }

    /// Attempts to acquire a read lock without blocking.
    ///
    /// Succeeds iff no writer is active and no writer is waiting.
    pub fn try_lock_read(&self) -> Option<ReadGuard<'_>> {
        let mut state = self.state.lock();
        if !state.active_writer && state.waiting_writers == 0 {
            state.active_readers += 1;
            Some(ReadGuard { mutex: self })
        } else {
            None
        }
    }

    /// Attempts to acquire a write lock without blocking.
    ///
    /// Succeeds iff nothing is active and no writer is waiting.
    pub fn try_lock_write(&self) -> Option<WriteGuard<'_>> {
        let mut state = self.state.lock();
        if !state.active() && state.waiting_writers == 0 {
            state.active_writer = true;
            Some(WriteGuard { mutex: self })
        } else {
            None
        }
    }

    fn unlock_read(&self) {
        let mut state = self.state.lock();
        state.active_readers -= 1;
        if state.active_readers == 0 && state.waiting_writers > 0 {
            self.writers_may_proceed.notify_one();
        }
    }

    fn unlock_write(&self) {
        let mut state = self.state.lock();
        state.active_writer = false;
        if state.waiting_writers > 0 {
            self.writers_may_proceed.notify_one();
        } else {
            self.readers_may_proceed.notify_all();
        }
    }
}

/// RAII read guard returned by [`RwMutex::lock_read`] / `try_lock_read`.
pub struct ReadGuard<'a> {
    mutex: &'a RwMutex,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock_read();
    }
}

/// RAII write guard returned by [`RwMutex::lock_write`] / `try_lock_write`.
pub struct WriteGuard<'a> {
    mutex: &'a RwMutex,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn readers_can_share_the_lock() {
        let mutex = RwMutex::new();
        let r1 = mutex.lock_read();
        let r2 = mutex.lock_read();
        drop(r1);
        drop(r2);
    }

    #[test]
    fn try_lock_write_fails_while_reader_active() {
        let mutex = RwMutex::new();
        let _r = mutex.lock_read();
        assert!(mutex.try_lock_write().is_none());
    }

    #[test]
    fn try_lock_read_fails_while_writer_active() {
        let mutex = RwMutex::new();
        let _w = mutex.lock_write();
        assert!(mutex.try_lock_read().is_none());
    }

    /// Three-thread fairness scenario: a writer arriving while a reader is
    /// active must be served before a reader that arrives after it.
    #[test]
    fn s3_writer_is_not_starved_by_later_readers() {
        let mutex = Arc::new(RwMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_reader = mutex.lock_read();

        let writer_ready = Arc::new(AtomicUsize::new(0));
        let w_mutex = mutex.clone();
        let w_order = order.clone();
        let w_ready = writer_ready.clone();
        let writer = thread::spawn(move || {
            w_ready.store(1, Ordering::SeqCst);
            let _g = w_mutex.lock_write();
            w_order.lock().push("writer");
        });

        while writer_ready.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        thread::sleep(StdDuration::from_millis(20));

        let r_mutex = mutex.clone();
        let r_order = order.clone();
        let late_reader = thread::spawn(move || {
            let _g = r_mutex.lock_read();
            r_order.lock().push("late-reader");
        });

        drop(first_reader);
        writer.join().unwrap();
        late_reader.join().unwrap();

        assert_eq!(*order.lock(), vec!["writer", "late-reader"]);
    }
}
