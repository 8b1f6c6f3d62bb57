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

//! Error taxonomy shared across the scheduler, event loop, and session layers.

use std::io;

use crate::parser::status::Status as HttpStatus;

/// Errors surfaced by the runtime's core components.
///
/// Transient conditions (`WouldBlock`) are not meant to propagate out of a
/// `Task::run` implementation; callers should park and re-arm instead. Every
/// other variant is terminal for the component that raised it.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Wraps an underlying `io::Error` that isn't one of the more specific
    /// variants below.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The operation would block; the caller should park on the associated
    /// readiness event and retry once signalled.
    #[error("operation would block")]
    WouldBlock,

    /// A malformed request or response was observed; carries the status
    /// code that should be written back to the peer.
    #[error("protocol error: {0}")]
    Protocol(HttpStatus),

    /// The process has exhausted a finite OS resource (file descriptors).
    /// Treated as fatal rather than retried, since a spinning accept loop
    /// cannot recover on its own.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// An invariant internal to this crate was violated; indicates a bug
    /// rather than an environmental condition.
    #[error("programming error: {0}")]
    Programming(&'static str),

    /// A `TimeoutTask` expired.
    #[error("operation timed out")]
    Timeout,
}

impl CoreError {
    /// True for conditions that should be handled by parking and re-arming
    /// the associated event rather than tearing anything down.
    pub fn is_would_block(&self) -> bool {
        matches!(self, CoreError::WouldBlock)
            || matches!(self, CoreError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
