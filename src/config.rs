//! Plain-struct configuration consumed by [`crate::runtime::Runtime::start`].
//!
//! Loading these values from a file, environment variables, or CLI flags is
//! host-application glue left to the binary that embeds this crate --
//! this module only defines the shape.

use std::net::IpAddr;
use std::time::Duration;

use crate::router::Router;

/// `session_idle_timeout` default when a caller leaves it at `0`: the
/// connection is torn down if it sits idle (no complete request read, no
/// response flushed) this long.
const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime sizing, listen address, and routing table for a [`crate::runtime::Runtime`].
pub struct RuntimeConfig {
    /// Worker threads for CPU-light, non-blocking tasks. `0` means
    /// `min(num_cpus::get(), 2)`.
    pub short_task_threads: u32,
    /// Worker threads for tasks whose `Run()` may block (e.g. accepted
    /// connection setup). `0` means `1`.
    pub blocking_threads: u32,
    /// Address the TCP listener binds to.
    pub listen_addr: IpAddr,
    /// Port the TCP listener binds to.
    pub listen_port: u16,
    /// Routing table consulted by each session's `ProcessingRequest` state.
    pub routes: Router,
    /// Admission-control ceiling: once live session count reaches this,
    /// the listener disarms itself and idles for
    /// [`crate::event::TIME_BETWEEN_ACCEPTS`] before trying again.
    pub max_connections: usize,
    /// Unix user to drop privileges to after binding. Recorded for
    /// completeness; the core never calls `setuid` itself.
    pub personality_user: Option<String>,
    /// Unix group to drop privileges to after binding. Recorded for
    /// completeness; the core never calls `setgid` itself.
    pub personality_group: Option<String>,
    /// How long a session may sit idle -- no complete request read, no
    /// response flushed -- before it's torn down. `Duration::ZERO` means
    /// [`DEFAULT_SESSION_IDLE_TIMEOUT`].
    pub session_idle_timeout: Duration,
}

impl RuntimeConfig {
    /// A config listening on `127.0.0.1:8081` with default pool sizing, no
    /// routes, and no connection ceiling.
    pub fn new(listen_addr: IpAddr) -> Self {
        RuntimeConfig {
            short_task_threads: 0,
            blocking_threads: 0,
            listen_addr,
            listen_port: 8081,
            routes: Router::new(),
            max_connections: usize::MAX,
            personality_user: None,
            personality_group: None,
            session_idle_timeout: Duration::ZERO,
        }
    }

    /// Resolves `session_idle_timeout`, applying the `ZERO => default` rule.
    pub fn resolved_session_idle_timeout(&self) -> Duration {
        if self.session_idle_timeout.is_zero() {
            DEFAULT_SESSION_IDLE_TIMEOUT
        } else {
            self.session_idle_timeout
        }
    }

    /// Resolves `short_task_threads`, applying the `0 => min(cores, 2)` default.
    pub fn resolved_short_task_threads(&self) -> usize {
        if self.short_task_threads == 0 {
            num_cpus::get().min(2)
        } else {
            self.short_task_threads as usize
        }
    }

    /// Resolves `blocking_threads`, applying the `0 => 1` default.
    pub fn resolved_blocking_threads(&self) -> usize {
        if self.blocking_threads == 0 {
            1
        } else {
            self.blocking_threads as usize
        }
    }
}
