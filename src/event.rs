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

//! Binds OS readiness notifications (via `mio`) to [`Task`] signals.
//!
//! A single dispatch thread owns the `mio::Poll` and calls `poll()` in a
//! loop. Everything else -- registering a socket, re-arming interest after
//! a one-shot fire, tearing a registration down -- goes through the shared
//! `mio::Registry`, which is safe to use from any thread.
//!
//! Resolving a `Token` back to the `Task` it's bound to goes through a
//! `RwLock<HashMap<Token, Weak<Task>>>`: the dispatch thread takes a read
//! lock to look up and upgrade the `Weak`, `unbind` takes a write lock to
//! remove the entry. Because tokens are minted from a monotonic counter and
//! never reused, a registration can't be destroyed and replaced under the
//! same token while a notification for it is still being resolved -- the
//! read lock either observes the entry before it's removed (and the
//! upgraded `Arc` keeps the task alive for the rest of that dispatch) or
//! doesn't see it at all.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::RwLock;

use crate::task::{EventFlags, Task};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// The shared event-dispatch service. One instance is created per
/// [`crate::runtime::Runtime`].
pub struct EventLoop {
    registry: Registry,
    registrations: RwLock<HashMap<Token, Weak<Task>>>,
    next_token: AtomicUsize,
    waker: Waker,
}

impl EventLoop {
    /// Spawns the dispatch thread and returns a handle to the loop.
    pub fn start() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(&registry, WAKE_TOKEN)?;

        let this = Arc::new(Self {
            registry,
            registrations: RwLock::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            waker,
        });

        spawn_dispatch_thread(this.clone(), poll);

        Ok(this)
    }

    /// The shared registry used to register, re-arm, and deregister
    /// sources from any thread.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mints a fresh, never-reused token for a new registration.
    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Binds `token` to `task`, so the next matching readiness event
    /// signals it. Call after registering the source with this loop's
    /// registry.
    pub fn bind(&self, token: Token, task: &Arc<Task>) {
        self.registrations.write().insert(token, Arc::downgrade(task));
    }

    /// Removes the token-to-task binding. Call after deregistering the
    /// source from this loop's registry.
    pub fn unbind(&self, token: Token) {
        self.registrations.write().remove(&token);
    }

    /// Wakes the dispatch thread out of a blocking `poll()`, used when
    /// another thread needs the loop to notice state it can't observe via
    /// a registered source (e.g. shutdown).
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

fn spawn_dispatch_thread(event_loop: Arc<EventLoop>, mut poll: Poll) {
    thread::Builder::new()
        .name("taskio-event-loop".into())
        .spawn(move || {
            let mut events = Events::with_capacity(1024);
            loop {
                if let Err(err) = poll.poll(&mut events, None) {
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    log::error!("event loop poll failed: {err}");
                    return;
                }

                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }

                    let task = {
                        let registrations = event_loop.registrations.read();
                        registrations.get(&event.token()).and_then(Weak::upgrade)
                    };

                    let Some(task) = task else { continue };

                    let mut bits = EventFlags::NONE;
                    if event.is_readable() {
                        bits = bits | EventFlags::READ;
                    }
                    if event.is_writable() {
                        bits = bits | EventFlags::WRITE;
                    }
                    if !bits.is_empty() {
                        task.signal(bits);
                    }
                }
            }
        })
        .expect("failed to spawn event loop dispatch thread");
}

/// A one-shot interest request, mirroring the source's `RequestEvent`
/// masks: arming for read, write, or disarming entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRequest {
    /// Arm for readability (or EOF/hangup, depending on the source).
    Read,
    /// Arm for writability.
    Write,
    /// Arm for both.
    ReadWrite,
    /// Disarm; no further notifications until re-armed.
    Disarm,
}

impl EventRequest {
    /// Converts to an `mio::Interest`, if this isn't a disarm request.
    pub fn to_interest(self) -> Option<Interest> {
        match self {
            EventRequest::Read => Some(Interest::READABLE),
            EventRequest::Write => Some(Interest::WRITABLE),
            EventRequest::ReadWrite => Some(Interest::READABLE | Interest::WRITABLE),
            EventRequest::Disarm => None,
        }
    }
}

/// How long the listener admission-control idle timer waits before the
/// next accept attempt, once `RuntimeConfig::max_connections` is reached.
pub const TIME_BETWEEN_ACCEPTS: Duration = Duration::from_millis(1000);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{PoolKind, Runnable, RunResult, TaskThreadPool};
    use mio::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc as StdArc;

    struct SetOnRead(StdArc<AtomicBool>);
    impl Runnable for SetOnRead {
        fn run(&self, _task: &Task, events: EventFlags) -> RunResult {
            if events.contains(EventFlags::READ) {
                self.0.store(true, Ordering::SeqCst);
            }
            RunResult::Destroy
        }
    }

    #[test]
    fn readable_socket_signals_bound_task() {
        let event_loop = EventLoop::start().expect("start event loop");
        let pool = TaskThreadPool::new("event-test-pool", 1);
        let _ = PoolKind::ShortTask;

        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let token = event_loop.next_token();
        event_loop
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .unwrap();

        let fired = StdArc::new(AtomicBool::new(false));
        let task = pool.spawn("listener-task", SetOnRead(fired.clone()));
        event_loop.bind(token, &task);

        let _client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
    }
}
