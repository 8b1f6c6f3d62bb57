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

//! The `Runnable` bound to a listening TCP socket: accepts connections in a
//! loop until `WouldBlock`, handing each off to a session factory, and
//! throttles itself via an idle timer once `max_connections` live sessions
//! are outstanding.

use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::event::Source;
use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::event::{EventLoop, TIME_BETWEEN_ACCEPTS};
use crate::net::tcp_listener::TcpListener;
use crate::net::tcp_stream::TcpStream;
use crate::task::{EventFlags, Runnable, RunResult, Task};
use crate::timer;

/// Backlog passed to the OS `listen()` call.
pub const LISTEN_QUEUE_LENGTH: i32 = 1024;

/// Called with each accepted connection and its peer address; returns the
/// spawned session's `Task` handle, or `None` if the connection was
/// rejected before a session could be started.
pub type SessionFactory<S> = Box<dyn Fn(S, SocketAddr) -> Option<Arc<Task>> + Send + Sync>;

/// A bound, listening TCP socket driven by the scheduler.
pub struct TcpListenerSocket<L, S> {
    listener: Mutex<L>,
    token: Token,
    event_loop: Arc<EventLoop>,
    live_sessions: Arc<AtomicUsize>,
    max_connections: usize,
    new_session: SessionFactory<S>,
    _marker: PhantomData<S>,
}

impl<L, S> TcpListenerSocket<L, S>
where
    L: TcpListener<S> + Source,
    S: TcpStream + Source,
{
    /// Binds `addr`, registers it with `event_loop`, and returns a socket
    /// ready to be spawned as a `Task`. `live_sessions` is shared with the
    /// sessions this listener creates, so it can throttle accepts once
    /// `max_connections` is reached.
    pub fn bind(
        addr: SocketAddr,
        event_loop: Arc<EventLoop>,
        live_sessions: Arc<AtomicUsize>,
        max_connections: usize,
        new_session: SessionFactory<S>,
    ) -> io::Result<Self> {
        let mut listener = L::bind(addr)?;
        let token = event_loop.next_token();
        event_loop
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;

        Ok(TcpListenerSocket {
            listener: Mutex::new(listener),
            token,
            event_loop,
            live_sessions,
            max_connections,
            new_session,
            _marker: PhantomData,
        })
    }

    /// The token this listener's socket is registered under. Bind this to
    /// the spawned `Task` via `EventLoop::bind` once the socket is handed
    /// to a `TaskThreadPool`.
    pub fn token(&self) -> Token {
        self.token
    }

    fn rearm(&self, listener: &mut L) {
        if let Err(err) =
            self.event_loop
                .registry()
                .reregister(listener, self.token, Interest::READABLE)
        {
            log::warn!("failed to re-arm listener socket: {err}");
        }
    }

    /// Accepts a single pending connection and hands it to the session
    /// factory.
    fn accept_one(&self) -> io::Result<()> {
        let (stream, addr) = {
            let listener = self.listener.lock();
            listener.accept()?
        };
        (self.new_session)(stream, addr);
        Ok(())
    }
}

impl<L, S> Runnable for TcpListenerSocket<L, S>
where
    L: TcpListener<S> + Source + Send + Sync,
    S: TcpStream + Source + Send + Sync,
{
    fn run(&self, task: &Task, events: EventFlags) -> RunResult {
        if events.contains(EventFlags::KILL) {
            return RunResult::Destroy;
        }

        loop {
            if self.live_sessions.load(Ordering::Acquire) >= self.max_connections {
                timer::set_idle_timer(&task.handle(), TIME_BETWEEN_ACCEPTS);
                return RunResult::Park;
            }

            match self.accept_one() {
                Ok(()) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if is_descriptor_exhaustion(&err) => {
                    log::error!("exhausted file descriptors accepting connections: {err}");
                    process::exit(1);
                }
                Err(err) => {
                    log::warn!("failed to accept connection: {err}");
                    continue;
                }
            }
        }

        let mut listener = self.listener.lock();
        self.rearm(&mut listener);
        RunResult::Park
    }
}

mod errno {
    pub const EMFILE: i32 = 24;
    pub const ENFILE: i32 = 23;
}

fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(errno::EMFILE) | Some(errno::ENFILE))
}
