//! Thin, swappable abstractions over `mio`'s and `std`'s TCP types, so the
//! listener and session code can be exercised against either a real `mio`
//! socket or a plain blocking `std::net` one in tests.

pub mod tcp_listener;
pub mod tcp_stream;

pub use tcp_listener::TcpListener;
pub use tcp_stream::TcpStream;
