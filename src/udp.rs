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

//! Routes UDP datagrams to the `Task` owning their (peer address, peer
//! port) pair.
//!
//! The original demuxer was a fixed 2747-bucket (a prime, to spread the
//! `(ip << 16) + port` hash) open-chained hash table guarded by one mutex,
//! on the grounds that only the single task reading the shared UDP socket
//! ever calls `GetTask`, so the hot path doesn't need to be lock-free. A
//! `HashMap` behind a `parking_lot::Mutex` gives the same uniqueness and
//! O(1)-amortized lookup without committing to a fixed table size; the
//! prime-bucket-count detail doesn't carry any testable behavior over to
//! this crate.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CoreError;
use crate::task::Task;

/// The (remote address, remote port) pair a datagram is routed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    addr: Ipv4Addr,
    port: u16,
}

impl PeerKey {
    /// Creates a new key.
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

/// Routes datagrams to per-peer tasks by `(peer_ip, peer_port)`.
#[derive(Default)]
pub struct UdpDemuxer {
    table: Mutex<HashMap<PeerKey, Arc<Task>>>,
}

impl UdpDemuxer {
    /// Creates an empty demuxer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` as the handler for datagrams from `key`.
    ///
    /// Fails if a task is already registered for that key -- the original
    /// surfaces this as `EPERM`; here it's `CoreError::Programming`.
    pub fn register(&self, key: PeerKey, task: Arc<Task>) -> Result<(), CoreError> {
        let mut table = self.table.lock();
        if table.contains_key(&key) {
            return Err(CoreError::Programming(
                "a task is already registered for this peer address",
            ));
        }
        table.insert(key, task);
        Ok(())
    }

    /// Removes the registration for `key`, if `task` is the one currently
    /// registered. Fails if the key isn't registered to `task`.
    pub fn unregister(&self, key: PeerKey, task: &Arc<Task>) -> Result<(), CoreError> {
        let mut table = self.table.lock();
        match table.get(&key) {
            Some(registered) if Arc::ptr_eq(registered, task) => {
                table.remove(&key);
                Ok(())
            }
            _ => Err(CoreError::Programming(
                "no matching task is registered for this peer address",
            )),
        }
    }

    /// Looks up the task registered for `key`.
    ///
    /// The original documents this as assuming the caller already holds the
    /// demuxer's mutex, since only the single UDP-reading task ever calls
    /// it on the hot path; here the lock is taken internally since
    /// `parking_lot::Mutex` makes that effectively free for the
    /// uncontended case this assumes.
    pub fn get(&self, key: PeerKey) -> Option<Arc<Task>> {
        self.table.lock().get(&key).cloned()
    }

    /// True if some task is registered for `key`.
    pub fn contains(&self, key: PeerKey) -> bool {
        self.table.lock().contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EventFlags, Runnable, RunResult, TaskThreadPool};

    struct Noop;
    impl Runnable for Noop {
        fn run(&self, _task: &Task, _events: EventFlags) -> RunResult {
            RunResult::Park
        }
    }

    #[test]
    fn register_then_get_round_trips() {
        let demux = UdpDemuxer::new();
        let pool = TaskThreadPool::new("udp-test-pool", 1);
        let task = pool.spawn("peer-task", Noop);
        let key = PeerKey::new(Ipv4Addr::new(192, 168, 1, 7), 5000);

        demux.register(key, task.clone()).unwrap();
        assert!(Arc::ptr_eq(&demux.get(key).unwrap(), &task));
    }

    #[test]
    fn duplicate_register_fails() {
        let demux = UdpDemuxer::new();
        let pool = TaskThreadPool::new("udp-test-pool-2", 1);
        let key = PeerKey::new(Ipv4Addr::new(10, 0, 0, 1), 9001);

        demux.register(key, pool.spawn("a", Noop)).unwrap();
        assert!(demux.register(key, pool.spawn("b", Noop)).is_err());
    }

    #[test]
    fn unregister_then_get_returns_none() {
        let demux = UdpDemuxer::new();
        let pool = TaskThreadPool::new("udp-test-pool-3", 1);
        let task = pool.spawn("peer-task", Noop);
        let key = PeerKey::new(Ipv4Addr::new(127, 0, 0, 1), 4242);

        demux.register(key, task.clone()).unwrap();
        demux.unregister(key, &task).unwrap();
        assert!(demux.get(key).is_none());
        assert!(demux.unregister(key, &task).is_err());
    }
}
