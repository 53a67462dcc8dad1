use std::{
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("bind/listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("select failed: {0}")]
    Select(#[source] io::Error),
}

/// A live peer connection or the node's own listener.
///
/// Mirrors the C source's `mesh[]` slot: `Socket` wraps a single stream and
/// exposes the byte-exact, loop-until-done send/recv primitives the rest of
/// the mesh is built on. There is no non-blocking mode; a caller that wants
/// to wait on several sockets at once uses [`select_readable`].
pub struct Socket {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Socket {
    fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Writes every byte in `bytes`, looping past partial writes.
    ///
    /// Returns `false` (and leaves the socket unusable) on any I/O error;
    /// the caller is expected to close and drop the socket in that case.
    pub fn send_all(&mut self, bytes: &[u8]) -> bool {
        match self.stream.write_all(bytes) {
            Ok(()) => true,
            Err(err) => {
                warn!(peer = %self.peer, %err, "send_all failed");
                false
            }
        }
    }

    /// Reads exactly `out.len()` bytes, looping past partial reads.
    ///
    /// Returns `false` on EOF or I/O error, including a short read that
    /// leaves `out` only partially filled.
    pub fn recv_exact(&mut self, out: &mut [u8]) -> bool {
        match self.stream.read_exact(out) {
            Ok(()) => true,
            Err(err) => {
                if err.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(peer = %self.peer, %err, "recv_exact failed");
                }
                false
            }
        }
    }

    /// Reads and discards exactly `len` bytes, in bounded-size chunks rather
    /// than one `len`-sized buffer, so a caller can keep the stream framed
    /// past a field it doesn't trust (e.g. an oversized length prefix)
    /// without allocating however much memory that field claims.
    pub fn recv_discard(&mut self, mut len: u64) -> bool {
        let mut scratch = [0u8; 4096];
        while len > 0 {
            let chunk = (len as usize).min(scratch.len());
            if !self.recv_exact(&mut scratch[..chunk]) {
                return false;
            }
            len -= chunk as u64;
        }
        true
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Binds and listens on `bind_addr:port`.
pub fn listen(port: u16, bind_addr: IpAddr) -> Result<TcpListener, SocketError> {
    TcpListener::bind(SocketAddr::new(bind_addr, port)).map_err(SocketError::Listen)
}

/// Opens an outbound connection to `addr:port`.
pub fn connect(port: u16, addr: IpAddr) -> Result<Socket, SocketError> {
    let stream = TcpStream::connect(SocketAddr::new(addr, port)).map_err(SocketError::Connect)?;
    Socket::from_stream(stream).map_err(SocketError::Connect)
}

/// Accepts one pending inbound connection on `listener`.
pub fn accept(listener: &TcpListener) -> Result<Socket, SocketError> {
    let (stream, _) = listener.accept().map_err(SocketError::Accept)?;
    Socket::from_stream(stream).map_err(SocketError::Accept)
}

/// One of the descriptors a node is multiplexing over: either its own
/// listener (new connections arrive here) or a live peer socket.
pub enum Waitable<'a> {
    Listener(&'a TcpListener),
    Peer(&'a Socket),
}

impl AsRawFd for Waitable<'_> {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Waitable::Listener(l) => l.as_raw_fd(),
            Waitable::Peer(s) => s.as_raw_fd(),
        }
    }
}

/// Blocks until one of `sockets` is readable (or erroring), returning its
/// index. There is no timeout, matching the original's `select()` with a
/// null timeval: a completely idle mesh blocks here indefinitely.
///
/// An errored socket is reported exactly like a readable one — the caller's
/// subsequent `recv_exact` will observe the error and close the peer. This
/// preserves the BSD `fd_set` behavior the design notes call out: readiness
/// and error share one signal.
pub fn select_readable(sockets: &[Waitable<'_>]) -> Result<usize, SocketError> {
    loop {
        let mut read_fds = new_fd_set();
        let mut max_fd = 0;
        for s in sockets {
            let fd = s.as_raw_fd();
            fd_set(&mut read_fds, fd);
            max_fd = max_fd.max(fd);
        }

        // SAFETY: `read_fds` is a valid, zero-initialized `fd_set` with only
        // fds present in `sockets` set; `max_fd + 1` bounds the scan per the
        // `select(2)` contract. No timeout is passed (blocking wait).
        let ready = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SocketError::Select(err));
        }

        for (idx, s) in sockets.iter().enumerate() {
            if fd_isset(&read_fds, s.as_raw_fd()) {
                return Ok(idx);
            }
        }
        // Spurious wakeup with nothing set; retry.
    }
}

fn new_fd_set() -> libc::fd_set {
    // SAFETY: `fd_set` is a plain bitmask struct; zeroed is the empty set.
    unsafe { std::mem::zeroed() }
}

fn fd_set(set: &mut libc::fd_set, fd: RawFd) {
    // SAFETY: `set` is a valid `fd_set`; `FD_SET` only writes within it.
    unsafe { libc::FD_SET(fd, set) };
}

fn fd_isset(set: &libc::fd_set, fd: RawFd) -> bool {
    // SAFETY: `set` is a valid, initialized `fd_set`.
    unsafe { libc::FD_ISSET(fd, set) }
}

/// A connected loopback pair used only to interrupt a blocking
/// [`select_readable`] from another thread: the writer half is included in
/// nothing, the reader half is added to the select set, and a single byte
/// written to the writer wakes the selecting thread so it can re-check
/// shared state. This is the self-pipe trick, built on TCP loopback since
/// this crate has no other IPC primitive in scope.
pub fn wake_pair() -> Result<(Socket, Socket), SocketError> {
    let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).map_err(SocketError::Listen)?;
    let addr = listener.local_addr().map_err(SocketError::Listen)?;
    let writer = TcpStream::connect(addr).map_err(SocketError::Connect)?;
    let (reader, _) = listener.accept().map_err(SocketError::Accept)?;
    Ok((
        Socket::from_stream(writer).map_err(SocketError::Connect)?,
        Socket::from_stream(reader).map_err(SocketError::Accept)?,
    ))
}

/// Writes a single wake byte, ignoring the byte's value on the reading end.
pub fn wake(writer: &mut Socket) {
    let _ = writer.stream.write_all(&[0u8]);
}

/// Drains whatever wake bytes are currently buffered on the reader half of
/// a [`wake_pair`], after `select_readable` reports it ready.
pub fn drain_wake(reader: &mut Socket) {
    let mut buf = [0u8; 64];
    let _ = reader.stream.set_nonblocking(true);
    while let Ok(n) = reader.stream.read(&mut buf) {
        if n == 0 {
            break;
        }
    }
    let _ = reader.stream.set_nonblocking(false);
}

pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<Socket, SocketError> {
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(SocketError::Connect)?;
    Socket::from_stream(stream).map_err(SocketError::Connect)
}
