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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! A cooperative task scheduler and event-driven socket runtime for
//! long-lived connection servers.
//!
//! The pieces compose roughly bottom-up:
//!
//! - [`task`] and [`heap`] provide the scheduler itself: a `Task` is a
//!   `Runnable` plus bookkeeping, dispatched by a [`task::TaskThreadPool`]
//!   whenever it's signalled.
//! - [`event`] and [`timer`] turn OS readiness notifications and wall-clock
//!   deadlines into `Task` signals.
//! - [`sync`] provides the writer-preference [`sync::RwMutex`] used where a
//!   resource is read far more often than written.
//! - [`parser`] implements HTTP/1.1 request parsing and response
//!   serialization, with [`buffer`] backing the byte streams involved.
//! - [`router`], [`listener`], and [`session`] implement the HTTP server on
//!   top of the scheduler: a listening socket accepts connections, each
//!   spawned as its own `Task` running the request/response state machine.
//! - [`udp`] implements a UDP demultiplexer for connectionless protocols
//!   sharing a single socket across many logical peers.
//! - [`runtime`] and [`config`] wire all of the above into a single handle
//!   constructed from a [`config::RuntimeConfig`].

mod buffer;
mod error;
mod heap;
mod sync;
mod task;

pub mod config;
pub mod event;
pub mod listener;
pub mod net;
pub mod parser;
pub mod router;
pub mod runtime;
pub mod session;
pub mod timer;
pub mod udp;

pub use error::{CoreError, Result};
pub use event::EventLoop;
pub use runtime::Runtime;
pub use sync::RwMutex;
pub use task::{EventFlags, Runnable, RunResult, Task, TaskThreadPool};
