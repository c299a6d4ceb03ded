//! Socket endpoints for the control and data planes.
//!
//! Control traffic is UDP. A client socket is either *standard* (ephemeral
//! port, unicast only) or *multicast-capable* (broadcast enabled, TTL 5); a
//! server additionally joins the multicast group and binds the shared
//! command port. Bulk data rides TCP with the listening side on an
//! ephemeral port. Receives and accepts are bounded by a caller-supplied
//! deadline that is re-checked before every syscall, so an exhausted window
//! never blocks.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::Instant;

/// Chunk size for streaming file bodies over TCP.
pub const STREAM_CHUNK: usize = 65_535;

/// TTL for control datagrams addressed to the group.
const MULTICAST_TTL: u32 = 5;

/// Backlog for the per-transfer TCP listeners.
const LISTEN_BACKLOG: i32 = 5;

/// A UDP endpoint on the control plane.
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Binds an ephemeral unicast socket.
    ///
    /// # Errors
    ///
    /// Fails when no local port can be bound.
    pub async fn standard() -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        Ok(Self { socket })
    }

    /// Binds an ephemeral socket able to address the multicast group.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be bound or the options cannot be set.
    pub async fn multicast_sender() -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        Ok(Self { socket })
    }

    /// Joins `group` as a member and binds the shared command port.
    ///
    /// `SO_REUSEADDR` is set before the bind so several servers can share a
    /// host. Port 0 binds an ephemeral port, which tests rely on. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the port cannot be bound or the group cannot be joined.
    pub fn group_member(group: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self { socket })
    }

    /// The local address the endpoint is bound to.
    ///
    /// # Errors
    ///
    /// Propagates the socket's own failure to report it.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sends one frame as one datagram. Datagram sends are atomic, so
    /// endpoints may be shared between tasks without serialising writers.
    ///
    /// # Errors
    ///
    /// Fails when the datagram cannot be handed to the network stack.
    pub async fn send(&self, frame: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(frame, addr).await.map(|_| ())
    }

    /// Receives one datagram with no deadline.
    ///
    /// # Errors
    ///
    /// Propagates receive failures.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Receives one datagram, or `None` once `deadline` has passed.
    ///
    /// The remaining window is computed before the syscall; a deadline
    /// already in the past returns `None` without blocking.
    ///
    /// # Errors
    ///
    /// Propagates receive failures; the deadline itself is not an error.
    pub async fn recv_before(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        if deadline <= Instant::now() {
            return Ok(None);
        }
        match tokio::time::timeout_at(deadline, self.socket.recv_from(buf)).await {
            Ok(received) => received.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// Opens a TCP listener on a kernel-assigned ephemeral port with a backlog
/// of [`LISTEN_BACKLOG`]. Must be called from within a tokio runtime.
///
/// # Errors
///
/// Fails when no local port can be bound.
pub fn listen_ephemeral() -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Accepts one connection, or `None` once `deadline` has passed.
///
/// # Errors
///
/// Propagates accept failures; the deadline itself is not an error.
pub async fn accept_before(
    listener: &TcpListener,
    deadline: Instant,
) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    if deadline <= Instant::now() {
        return Ok(None);
    }
    match tokio::time::timeout_at(deadline, listener.accept()).await {
        Ok(accepted) => accepted.map(Some),
        Err(_elapsed) => Ok(None),
    }
}
