//! The per-connection request/response state machine.
//!
//! A `Session` is the `Runnable` bound to a single accepted TCP connection.
//! Because a `Task`'s `Run()` is already serialized by the scheduler (at
//! most one invocation in flight at a time), the session- and read-mutexes
//! the original uses to keep other flows off the socket during a park
//! become structural rather than explicit locks -- there is no "other
//! flow" that could ever observe this session concurrently. What remains
//! as real mutable state lives behind one `parking_lot::Mutex` so the type
//! satisfies `Runnable: Send + Sync`.

use std::io::{self, ErrorKind, IoSlice, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::CoreError;
use crate::event::EventLoop;
use crate::net::tcp_stream::TcpStream;
use crate::parser::h1::request::H1Request;
use crate::parser::h1::response::Response;
use crate::parser::status::Status;
use crate::parser::Version;
use crate::router::Router;
use crate::task::{EventFlags, Runnable, RunResult, Task, TaskThreadPool};
use crate::timer::{self, TimerHandle};

/// Requests whose request-line plus headers exceed this many bytes are
/// rejected with `413 Content Too Large` rather than buffered forever.
const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingFirstRequest,
    ReadingRequest,
    FilteringRequest,
    SendingResponse,
    CleaningUp { keep_alive: bool },
}

/// What a [`Session::write_v`] call does with bytes the socket didn't
/// accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendType {
    /// Never buffer; returns however many bytes were actually written, and
    /// leaves the rest for the caller to resubmit.
    DontBuffer,
    /// If nothing at all could be written, report `WouldBlock` and buffer
    /// nothing; otherwise buffer whatever's left.
    AllOrNothing,
    /// Always buffer whatever the socket didn't accept, even if that's
    /// everything.
    AlwaysBuffer,
}

struct Inner<S> {
    stream: S,
    state: State,
    request_buf: Buffer,
    /// Total bytes (head + body) this request needs before dispatch, once known.
    wanted_len: usize,
    /// Response head and body, built by `process` and handed to the first
    /// `write_v` call for this response as two vectors.
    response_head: Vec<u8>,
    response_body: Vec<u8>,
    /// Bytes `write_v` couldn't write immediately and buffered; drained by
    /// `flush`.
    response_wire: Vec<u8>,
    write_offset: usize,
    /// Whether the initial vectored write for the current response has
    /// been attempted yet.
    initial_write_done: bool,
    /// Whether the connection survives the response currently being sent,
    /// decided by `process` from the request that produced it.
    keep_alive: bool,
    /// The pending idle-timeout wake-up, re-armed every time the session
    /// parks waiting for its next readiness event.
    timeout: Option<TimerHandle>,
}

/// A single accepted connection, driving it through the request/response
/// FSM described in the module doc comment.
pub struct Session<S> {
    inner: Mutex<Inner<S>>,
    token: Token,
    event_loop: Arc<EventLoop>,
    router: Arc<Router>,
    live_sessions: Arc<AtomicUsize>,
    idle_timeout: Duration,
}

impl<S> Session<S>
where
    S: TcpStream + Read + Write + Source + Send + Sync + 'static,
{
    /// Registers `stream` with `event_loop`, spawns a `Task` for it on
    /// `pool`, and returns the handle. `live_sessions` is decremented when
    /// the session is eventually dropped.
    pub fn spawn(
        mut stream: S,
        pool: &Arc<TaskThreadPool>,
        event_loop: Arc<EventLoop>,
        router: Arc<Router>,
        live_sessions: Arc<AtomicUsize>,
        idle_timeout: Duration,
    ) -> io::Result<Arc<Task>> {
        if let Err(err) = stream.tune_for_session() {
            log::warn!("failed to tune accepted socket: {err}");
        }

        let token = event_loop.next_token();
        event_loop
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;
        live_sessions.fetch_add(1, Ordering::AcqRel);

        let session = Session {
            inner: Mutex::new(Inner {
                stream,
                state: State::ReadingFirstRequest,
                request_buf: Buffer::new(4096),
                wanted_len: 0,
                response_head: Vec::new(),
                response_body: Vec::new(),
                response_wire: Vec::new(),
                write_offset: 0,
                initial_write_done: false,
                keep_alive: false,
                timeout: None,
            }),
            token,
            event_loop: event_loop.clone(),
            router,
            live_sessions,
            idle_timeout,
        };

        let task = pool.spawn("session", session);
        event_loop.bind(token, &task);
        Ok(task)
    }

    /// Cancels any outstanding idle timeout and arms a new one, timed from
    /// now. Called every time the session is about to park waiting for its
    /// next readiness event.
    fn refresh_timeout(&self, inner: &mut Inner<S>, task: &Task) {
        if let Some(handle) = inner.timeout.take() {
            handle.cancel();
        }
        inner.timeout = Some(timer::set_timeout(&task.handle(), self.idle_timeout));
    }

    fn rearm(&self, inner: &mut Inner<S>, interest: Interest) {
        if let Err(err) = self
            .event_loop
            .registry()
            .reregister(&mut inner.stream, self.token, interest)
        {
            log::warn!("failed to re-arm session socket: {err}");
        }
    }

    /// Reads once into the request buffer. `Ok(true)` means the buffer now
    /// holds a complete request line + headers (and, if a body is
    /// expected, the whole body too). `Ok(false)` means keep waiting for
    /// read-readiness. `Err` is a terminal condition: peer gone, or the
    /// head grew past `MAX_HEAD_SIZE`.
    fn read_progress(&self, inner: &mut Inner<S>) -> io::Result<bool> {
        if inner.wanted_len == 0 {
            if inner.request_buf.remaining_mut() < 4096 {
                inner.request_buf.reserve(4096);
            }
            let slice = std::borrow::BorrowMut::borrow_mut(&mut inner.request_buf);
            match inner.stream.read(slice) {
                Ok(0) => {
                    return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer closed"));
                }
                Ok(n) => inner.request_buf.mark_written(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }

            let buffered: &[u8] = std::borrow::Borrow::borrow(&inner.request_buf);
            if buffered.len() > MAX_HEAD_SIZE {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "request head too large",
                ));
            }

            let mut probe = H1Request::new();
            match probe.parse(buffered) {
                Ok(body) => {
                    let head_len = buffered.len() - body.len();
                    inner.wanted_len = head_len + probe.content_length().unwrap_or(0);
                }
                Err(_) => return Ok(false),
            }
        } else if inner.request_buf.remaining_mut() < 4096 {
            inner.request_buf.reserve(4096);
        }

        while std::borrow::Borrow::<[u8]>::borrow(&inner.request_buf).len() < inner.wanted_len {
            let slice = std::borrow::BorrowMut::borrow_mut(&mut inner.request_buf);
            match inner.stream.read(slice) {
                Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer closed")),
                Ok(n) => inner.request_buf.mark_written(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }

        Ok(true)
    }

    /// Parses the buffered request and dispatches it, leaving the
    /// serialized response in `inner.response_wire`.
    fn process(&self, inner: &mut Inner<S>) {
        let consumed = inner.wanted_len;
        let (head, body, keep_alive) = {
            let buffered: &[u8] = std::borrow::Borrow::borrow(&inner.request_buf);
            let mut request = H1Request::new();
            let mut response = Response::new();

            let keep_alive = match request.parse(buffered) {
                Ok(_) => match request.version {
                    Some(Version::H1_0) | Some(Version::H1_1) => {
                        self.router.dispatch(&request, &mut response);
                        request.keep_alive()
                    }
                    _ => {
                        response.set_status_code(Status::HTTPVersionNotSupported);
                        false
                    }
                },
                Err(err) => {
                    log::warn!("malformed request: {err}");
                    response.set_status_code(Status::BadRequest);
                    false
                }
            };

            (
                response.serialized_head().into_bytes(),
                response.body().as_bytes().to_vec(),
                keep_alive,
            )
        };

        inner.response_head = head;
        inner.response_body = body;
        inner.response_wire.clear();
        inner.write_offset = 0;
        inner.initial_write_done = false;
        inner.keep_alive = keep_alive;
        inner.request_buf.mark_read(consumed);
        inner.wanted_len = 0;
    }

    /// Writes `vectors` to the socket, buffering whatever it doesn't accept
    /// per `send_type`. Returns the number of bytes handled -- written or
    /// buffered -- which equals the vectors' total length unless
    /// `send_type` is `DontBuffer` and the write was partial, in which case
    /// it's however many bytes actually reached the socket.
    ///
    /// Anything already buffered from an earlier call is flushed first;
    /// new data is never sent ahead of bytes still waiting from a previous
    /// `write_v`.
    fn write_v(
        &self,
        inner: &mut Inner<S>,
        vectors: &[IoSlice<'_>],
        send_type: SendType,
    ) -> io::Result<usize> {
        let total: usize = vectors.iter().map(|v| v.len()).sum();

        if inner.write_offset < inner.response_wire.len() && !self.flush(inner)? {
            for v in vectors {
                inner.response_wire.extend_from_slice(v);
            }
            return Ok(total);
        }

        if total == 0 {
            return Ok(0);
        }

        let sent = match inner.stream.write_vectored(vectors) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => 0,
            Err(err) => return Err(err),
        };

        if sent >= total {
            return Ok(total);
        }

        match send_type {
            SendType::DontBuffer => Ok(sent),
            SendType::AllOrNothing if sent == 0 => {
                Err(io::Error::new(ErrorKind::WouldBlock, "write would block"))
            }
            SendType::AllOrNothing | SendType::AlwaysBuffer => {
                let mut skip = sent;
                inner.response_wire.clear();
                inner.write_offset = 0;
                for v in vectors {
                    let bytes: &[u8] = v;
                    if skip >= bytes.len() {
                        skip -= bytes.len();
                        continue;
                    }
                    inner.response_wire.extend_from_slice(&bytes[skip..]);
                    skip = 0;
                }
                Ok(total)
            }
        }
    }

    /// Drains whatever `write_v` buffered, if anything. `Ok(true)` means
    /// fully drained; `Ok(false)` means the socket isn't writeable yet and
    /// the caller should re-arm write-readiness.
    fn flush(&self, inner: &mut Inner<S>) -> io::Result<bool> {
        while inner.write_offset < inner.response_wire.len() {
            match inner.stream.write(&inner.response_wire[inner.write_offset..]) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => inner.write_offset += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }
}

impl<S> Runnable for Session<S>
where
    S: TcpStream + Read + Write + Source + Send + Sync + 'static,
{
    fn run(&self, task: &Task, events: EventFlags) -> RunResult {
        if events.contains(EventFlags::KILL) {
            return RunResult::Destroy;
        }
        if events.contains(EventFlags::TIMEOUT) {
            log::debug!("session idle-timed-out: {}", CoreError::Timeout);
            return RunResult::Destroy;
        }

        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                State::ReadingFirstRequest | State::ReadingRequest => {
                    match self.read_progress(&mut inner) {
                        Ok(true) => inner.state = State::FilteringRequest,
                        Ok(false) => {
                            self.refresh_timeout(&mut inner, task);
                            self.rearm(&mut inner, Interest::READABLE);
                            return RunResult::Park;
                        }
                        Err(_) => return RunResult::Destroy,
                    }
                }
                State::FilteringRequest => {
                    task.clear_force_same_thread();
                    self.refresh_timeout(&mut inner, task);
                    self.process(&mut inner);
                    inner.state = State::SendingResponse;
                }
                State::SendingResponse => {
                    if !inner.initial_write_done {
                        let head = std::mem::take(&mut inner.response_head);
                        let body = std::mem::take(&mut inner.response_body);
                        let vectors = [IoSlice::new(&head), IoSlice::new(&body)];

                        match self.write_v(&mut inner, &vectors, SendType::AllOrNothing) {
                            Ok(_) => inner.initial_write_done = true,
                            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                                inner.response_head = head;
                                inner.response_body = body;
                                task.force_same_thread();
                                self.refresh_timeout(&mut inner, task);
                                self.rearm(&mut inner, Interest::WRITABLE);
                                return RunResult::Park;
                            }
                            Err(err) => {
                                log::debug!("session write failed: {err}");
                                return RunResult::Destroy;
                            }
                        }
                    }

                    if inner.write_offset < inner.response_wire.len() {
                        match self.flush(&mut inner) {
                            Ok(true) => {}
                            Ok(false) => {
                                task.force_same_thread();
                                self.refresh_timeout(&mut inner, task);
                                self.rearm(&mut inner, Interest::WRITABLE);
                                return RunResult::Park;
                            }
                            Err(err) => {
                                log::debug!("session write failed: {err}");
                                return RunResult::Destroy;
                            }
                        }
                    }

                    inner.state = State::CleaningUp {
                        keep_alive: inner.keep_alive,
                    };
                }
                State::CleaningUp { keep_alive } => {
                    inner.response_wire.clear();
                    inner.write_offset = 0;
                    if !keep_alive {
                        return RunResult::Destroy;
                    }
                    if inner.request_buf.is_empty() {
                        inner.request_buf.reset();
                    }
                    inner.state = State::ReadingRequest;
                    self.refresh_timeout(&mut inner, task);
                    self.rearm(&mut inner, Interest::READABLE);
                    return RunResult::Park;
                }
            }
        }
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.lock().timeout.take() {
            handle.cancel();
        }
        self.live_sessions.fetch_sub(1, Ordering::AcqRel);
        self.event_loop.unbind(self.token);
    }
}
