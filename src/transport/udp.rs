//! Underlay UDP sockets

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

use crate::mux::{check_deadline, PacketConn};

use super::error::NetworkError;

/// Bind a UDP socket with SO_REUSEADDR enabled
pub(crate) fn bind_reusable(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    // allows quick rebind after a session ends
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Unspecified local address of the same family as `remote`
pub(crate) fn wildcard_for(remote: &SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    }
}

/// A plain UDP socket behind the [`PacketConn`] interface
pub struct UdpPacketConn {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    closed: watch::Sender<bool>,
}

impl UdpPacketConn {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let socket = bind_reusable(addr)?;
        let conn = Self::from_socket(socket)?;
        info!("UDP socket bound to {} (SO_REUSEADDR enabled)", conn.local_addr);
        Ok(conn)
    }

    /// Bind to `laddr` and connect to `raddr`
    pub async fn connect(laddr: SocketAddr, raddr: SocketAddr) -> Result<Self, NetworkError> {
        let socket = bind_reusable(laddr)?;
        socket.connect(raddr).await?;
        let conn = Self::from_socket(socket)?;
        debug!("UDP socket {} connected to {}", conn.local_addr, raddr);
        Ok(conn)
    }

    fn from_socket(socket: UdpSocket) -> Result<Self, NetworkError> {
        let local_addr = socket.local_addr()?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            closed,
        })
    }

    /// Remote address of a connected socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    fn ensure_open(&self) -> Result<(), NetworkError> {
        if *self.closed.borrow() {
            Err(NetworkError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PacketConn for UdpPacketConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, String), NetworkError> {
        self.ensure_open()?;
        let deadline = *self.read_deadline.lock();
        check_deadline(deadline)?;

        let mut closed = self.closed.subscribe();
        let recv = async {
            tokio::select! {
                res = self.socket.recv_from(buf) => res.map_err(NetworkError::from),
                _ = closed.changed() => Err(NetworkError::Closed),
            }
        };
        let (n, from) = match deadline {
            Some(d) => timeout_at(d, recv).await.map_err(|_| NetworkError::Timeout)??,
            None => recv.await?,
        };

        trace!("Received {} bytes from {}", n, from);
        Ok((n, from.to_string()))
    }

    async fn write_to(&self, buf: &[u8], address: &str) -> Result<usize, NetworkError> {
        self.ensure_open()?;
        let target: SocketAddr = address.parse()?;
        let deadline = *self.write_deadline.lock();
        check_deadline(deadline)?;

        let send = self.socket.send_to(buf, target);
        let n = match deadline {
            Some(d) => timeout_at(d, send).await.map_err(|_| NetworkError::Timeout)??,
            None => send.await?,
        };
        trace!("Sent {} bytes to {}", n, target);
        Ok(n)
    }

    async fn close(&self) -> Result<(), NetworkError> {
        if self.closed.send_replace(true) {
            return Err(NetworkError::Closed);
        }
        debug!("UDP socket {} closed", self.local_addr);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError> {
        self.ensure_open()?;
        *self.read_deadline.lock() = deadline;
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError> {
        self.ensure_open()?;
        *self.write_deadline.lock() = deadline;
        Ok(())
    }
}
