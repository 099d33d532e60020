use std::{
    io,
    net::{SocketAddr, UdpSocket},
    thread,
    time::Duration,
};

use tracing::trace;

pub const DEFAULT_SEND_RETRIES: u32 = 8;
const SEND_BACKOFF: Duration = Duration::from_micros(200);
const MAX_SEND_BACKOFF: Duration = Duration::from_millis(20);

/// The datagram operations the transport needs from a socket.
///
/// Sends and receives are non-blocking; waiting happens only in
/// `wait_readable`.
pub trait DatagramSocket: Send {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Returns `WouldBlock` when nothing is queued.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Blocks for at most `timeout`; `true` if a datagram is waiting.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        if timeout.is_zero() {
            return Ok(false);
        }
        self.set_nonblocking(false)?;
        self.set_read_timeout(Some(timeout))?;
        let mut probe = [0; 1];
        let result = self.peek_from(&mut probe);
        self.set_nonblocking(true)?;
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_transient(&e) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(false),
            // a datagram larger than the probe buffer is still a datagram
            Err(_) => Ok(true),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds a UDP socket in the non-blocking mode the transport expects.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[must_use]
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Sends one datagram, backing off on `WouldBlock` for at most `retries`
/// attempts before giving up.
pub fn send_with_retry(
    socket: &dyn DatagramSocket,
    buf: &[u8],
    addr: SocketAddr,
    retries: u32,
) -> io::Result<usize> {
    let mut backoff = SEND_BACKOFF;
    let mut attempt = 0;
    loop {
        match socket.send_to(buf, addr) {
            Ok(n) => return Ok(n),
            Err(e) if is_transient(&e) && attempt < retries => {
                trace!(%addr, attempt, "send would block");
                attempt += 1;
                thread::sleep(backoff);
                backoff = Duration::min(backoff * 2, MAX_SEND_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        net::SocketAddr,
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::{send_with_retry, DatagramSocket};

    struct Flaky {
        fails: AtomicU32,
    }

    impl DatagramSocket for Flaky {
        fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            if self.fails.load(Ordering::Relaxed) > 0 {
                self.fails.fetch_sub(1, Ordering::Relaxed);
                return Err(io::ErrorKind::WouldBlock.into());
            }
            Ok(buf.len())
        }
        fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            Err(io::ErrorKind::WouldBlock.into())
        }
        fn wait_readable(&self, _timeout: Duration) -> io::Result<bool> {
            Ok(false)
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:1".parse().unwrap())
        }
    }

    #[test]
    fn test_retry_then_ok() {
        let socket = Flaky {
            fails: AtomicU32::new(2),
        };
        let addr = "127.0.0.1:2".parse().unwrap();
        assert_eq!(send_with_retry(&socket, &[1, 2, 3], addr, 3).unwrap(), 3);
    }

    #[test]
    fn test_retry_bounded() {
        let socket = Flaky {
            fails: AtomicU32::new(10),
        };
        let addr = "127.0.0.1:2".parse().unwrap();
        let err = send_with_retry(&socket, &[1], addr, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
