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

//! Wires a [`crate::config::RuntimeConfig`] into a running server: the
//! short-task and blocking thread pools, the shared event loop, the UDP
//! demultiplexer, and the listening socket that spawns a [`crate::session::Session`]
//! per accepted connection.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};

use crate::config::RuntimeConfig;
use crate::event::EventLoop;
use crate::listener::{SessionFactory, TcpListenerSocket};
use crate::router::Router;
use crate::session::Session;
use crate::task::TaskThreadPool;
use crate::udp::UdpDemuxer;

/// A running server: thread pools, event loop, and the listening socket
/// spawned from a [`RuntimeConfig`]. Dropping this does not tear the
/// server down -- the pools and event loop are kept alive by the `Task`s
/// spawned on them, same as the scheduler generally.
pub struct Runtime {
    short_task_pool: Arc<TaskThreadPool>,
    blocking_pool: Arc<TaskThreadPool>,
    event_loop: Arc<EventLoop>,
    udp: Arc<UdpDemuxer>,
    live_sessions: Arc<AtomicUsize>,
    session_idle_timeout: Duration,
}

impl Runtime {
    /// Starts the thread pools and event loop described by `config`, binds
    /// its listen address, and spawns the listener `Task`. Blocks only long
    /// enough to bind and register the listening socket; everything else
    /// runs on its own threads.
    pub fn start(config: RuntimeConfig) -> io::Result<Self> {
        let short_task_pool =
            TaskThreadPool::new("taskio-short", config.resolved_short_task_threads());
        let blocking_pool = TaskThreadPool::new("taskio-blocking", config.resolved_blocking_threads());
        let event_loop = EventLoop::start()?;
        let udp = Arc::new(UdpDemuxer::new());
        let live_sessions = Arc::new(AtomicUsize::new(0));
        let session_idle_timeout = config.resolved_session_idle_timeout();

        let runtime = Runtime {
            short_task_pool,
            blocking_pool,
            event_loop,
            udp,
            live_sessions,
            session_idle_timeout,
        };

        let addr = SocketAddr::new(config.listen_addr, config.listen_port);
        runtime.spawn_listener(addr, Arc::new(config.routes), config.max_connections)?;

        Ok(runtime)
    }

    /// The event loop shared by every listener and session this runtime
    /// owns.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// The UDP demultiplexer shared by every peer task this runtime owns.
    pub fn udp_demuxer(&self) -> &Arc<UdpDemuxer> {
        &self.udp
    }

    /// Currently live HTTP sessions, across every listener spawned on this
    /// runtime.
    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Binds `addr` and spawns a listener `Task` on the blocking pool that
    /// hands each accepted connection to a new [`Session`], also pinned to
    /// the blocking pool since a session's `Run()` may block on socket I/O.
    pub fn spawn_listener(
        &self,
        addr: SocketAddr,
        router: Arc<Router>,
        max_connections: usize,
    ) -> io::Result<()> {
        let event_loop = self.event_loop.clone();
        let live_sessions = self.live_sessions.clone();
        let blocking_pool = self.blocking_pool.clone();
        let session_idle_timeout = self.session_idle_timeout;

        let factory: SessionFactory<MioTcpStream> = Box::new(move |stream, _addr| {
            match Session::spawn(
                stream,
                &blocking_pool,
                event_loop.clone(),
                router.clone(),
                live_sessions.clone(),
                session_idle_timeout,
            ) {
                Ok(task) => Some(task),
                Err(err) => {
                    log::warn!("failed to spawn session: {err}");
                    None
                }
            }
        });

        let socket = TcpListenerSocket::<MioTcpListener, MioTcpStream>::bind(
            addr,
            self.event_loop.clone(),
            self.live_sessions.clone(),
            max_connections,
            factory,
        )?;

        let token = socket.token();
        let task = self.blocking_pool.spawn("tcp-listener", socket);
        self.event_loop.bind(token, &task);
        Ok(())
    }
}
