use std::io::{Error, Result};
use std::net::{Shutdown, SocketAddr};

use socket2::SockRef;

/// Socket send buffer size a session's accepted stream is tuned to before
/// its first read, per the runtime's socket I/O contract.
pub const SESSION_SEND_BUFFER_SIZE: usize = 96 * 1024;

pub trait TcpStream {
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    fn peer_addr(&self) -> Result<SocketAddr>;

    fn local_addr(&self) -> Result<SocketAddr>;

    fn shutdown(&self, how: Shutdown) -> Result<()>;

    fn set_nodelay(&self, nodelay: bool) -> Result<()>;

    fn nodelay(&self) -> Result<bool>;

    fn set_ttl(&self, ttl: u32) -> Result<()>;

    fn ttl(&self) -> Result<u32>;

    fn take_error(&self) -> Result<Option<Error>>;

    fn peek(&self, buf: &mut [u8]) -> Result<usize>;

    /// Toggles `SO_KEEPALIVE` on the underlying socket.
    fn set_keepalive(&self, keepalive: bool) -> Result<()>;

    /// Sets `SO_SNDBUF` on the underlying socket, in bytes.
    fn set_send_buffer_size(&self, size: usize) -> Result<()>;

    /// Applies the three socket options a session requires before it starts
    /// reading: `TCP_NODELAY`, `SO_KEEPALIVE`, and `SO_SNDBUF` sized to
    /// [`SESSION_SEND_BUFFER_SIZE`].
    fn tune_for_session(&self) -> Result<()> {
        self.set_nodelay(true)?;
        self.set_keepalive(true)?;
        self.set_send_buffer_size(SESSION_SEND_BUFFER_SIZE)
    }
}

impl TcpStream for mio::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized,
    {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }

    #[inline]
    fn set_keepalive(&self, keepalive: bool) -> Result<()> {
        SockRef::from(self).set_keepalive(keepalive)
    }

    #[inline]
    fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        SockRef::from(self).set_send_buffer_size(size)
    }
}

impl TcpStream for std::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized,
    {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }

    #[inline]
    fn set_keepalive(&self, keepalive: bool) -> Result<()> {
        SockRef::from(self).set_keepalive(keepalive)
    }

    #[inline]
    fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        SockRef::from(self).set_send_buffer_size(size)
    }
}
