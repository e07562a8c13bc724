//! Non-blocking byte transport used by [`HttpdClient`](crate::HttpdClient).

use std::io::{self, Read, Write};
use std::rc::Rc;

/// A non-blocking socket.
///
/// Both operations return `ErrorKind::WouldBlock` instead of waiting. The
/// client never retries on its own: a transient error hands control back
/// to the dispatch loop until the next readiness notification.
pub trait Connection {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// The dispatch thread keeps a second handle on the stream to wait for
/// readiness while the client owns the first one.
impl Connection for Rc<tokio::net::TcpStream> {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_read(&**self, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_write(&**self, buf)
    }
}

/// For callers running their own poll loop; the stream must be in
/// non-blocking mode.
impl Connection for std::net::TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }
}

pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
