//! Network provider backed by the overlay
//!
//! Stream dials and listeners go through the overlay first. The underlay is
//! only used after the overlay has failed, and only when the fallback policy
//! allows it. Packet listeners have no underlay fallback at all.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::mux::{MuxConfig, PacketConn, PacketMux};
use crate::overlay::{Dialer, OverlayContext, OverlayError, OverlayListener, PeerStream};

use super::error::NetworkError;
use super::interfaces::{self, Interface};
use super::udp::{wildcard_for, UdpPacketConn};

/// What to do when the overlay cannot reach an address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Retry directly over the host network
    #[default]
    Underlay,
    /// Report the overlay failure
    Disabled,
}

/// Path a connection took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Overlay,
    Underlay,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Overlay => write!(f, "overlay"),
            Route::Underlay => write!(f, "underlay"),
        }
    }
}

/// Stream connection returned by [`Net::dial`]
pub struct NetConn {
    stream: PeerStream,
    route: Route,
    remote: String,
}

impl NetConn {
    pub fn route(&self) -> Route {
        self.route
    }

    /// Address the connection was dialed with, or the accepted peer
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn into_stream(self) -> PeerStream {
        self.stream
    }
}

impl fmt::Debug for NetConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetConn")
            .field("route", &self.route)
            .field("remote", &self.remote)
            .finish()
    }
}

impl AsyncRead for NetConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for NetConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

enum ListenerKind {
    Overlay(Box<dyn OverlayListener>),
    Underlay(TcpListener),
}

/// Stream listener returned by [`Net::listen_tcp`]
pub struct NetListener {
    inner: ListenerKind,
}

impl NetListener {
    pub fn route(&self) -> Route {
        match self.inner {
            ListenerKind::Overlay(_) => Route::Overlay,
            ListenerKind::Underlay(_) => Route::Underlay,
        }
    }

    /// Local address of an underlay listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            ListenerKind::Overlay(_) => None,
            ListenerKind::Underlay(l) => l.local_addr().ok(),
        }
    }

    pub async fn accept(&self) -> Result<NetConn, NetworkError> {
        match &self.inner {
            ListenerKind::Overlay(listener) => {
                let (stream, peer) =
                    listener
                        .accept()
                        .await
                        .map_err(|source| NetworkError::Dial {
                            address: listener.service().to_string(),
                            source,
                        })?;
                Ok(NetConn {
                    stream,
                    route: Route::Overlay,
                    remote: peer,
                })
            }
            ListenerKind::Underlay(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(NetConn {
                    stream: Box::new(stream),
                    route: Route::Underlay,
                    remote: peer.to_string(),
                })
            }
        }
    }
}

/// Network provider consumed by media and signaling stacks
#[async_trait]
pub trait Net: Send + Sync {
    /// Cached interface snapshot
    fn interfaces(&self) -> Vec<Interface>;

    /// Re-read interfaces from the OS
    fn update_interfaces(&self) -> Result<(), NetworkError>;

    fn interface_by_index(&self, index: u32) -> Result<Interface, NetworkError>;

    fn interface_by_name(&self, name: &str) -> Result<Interface, NetworkError>;

    async fn dial(&self, network: &str, address: &str) -> Result<NetConn, NetworkError>;

    async fn dial_tcp(
        &self,
        network: &str,
        laddr: Option<SocketAddr>,
        raddr: &str,
    ) -> Result<NetConn, NetworkError>;

    async fn listen_tcp(&self, network: &str, laddr: &str) -> Result<NetListener, NetworkError>;

    async fn listen_packet(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Box<dyn PacketConn>, NetworkError>;

    async fn listen_udp(&self, network: &str, laddr: &str) -> Result<UdpPacketConn, NetworkError>;

    async fn dial_udp(
        &self,
        network: &str,
        laddr: Option<SocketAddr>,
        raddr: &str,
    ) -> Result<UdpPacketConn, NetworkError>;

    async fn resolve_udp_addr(&self, network: &str, address: &str) -> Result<SocketAddr, NetworkError>;

    async fn resolve_tcp_addr(&self, network: &str, address: &str) -> Result<SocketAddr, NetworkError>;

    async fn resolve_ip_addr(&self, network: &str, host: &str) -> Result<IpAddr, NetworkError>;
}

/// [`Net`] implementation routing through an [`OverlayContext`]
pub struct OverlayNet {
    context: Arc<OverlayContext>,
    fallback: FallbackPolicy,
    default_packet_endpoint: Option<String>,
    mux: MuxConfig,
    interfaces: RwLock<Vec<Interface>>,
}

impl OverlayNet {
    /// Interface enumeration failures leave the snapshot empty
    pub fn new(context: Arc<OverlayContext>, config: &Config) -> Self {
        let net = Self {
            context,
            fallback: config.fallback,
            default_packet_endpoint: config.default_packet_endpoint.clone(),
            mux: MuxConfig {
                framing: config.framing,
                queue_capacity: config.mux_queue_capacity,
            },
            interfaces: RwLock::new(Vec::new()),
        };
        if let Err(e) = net.update_interfaces() {
            warn!("Failed to enumerate interfaces: {}", e);
        }
        net
    }

    pub fn fallback(&self) -> FallbackPolicy {
        self.fallback
    }

    pub fn context(&self) -> &Arc<OverlayContext> {
        &self.context
    }

    fn fall_back(&self, address: &str, overlay: OverlayError) -> Result<OverlayError, NetworkError> {
        match self.fallback {
            FallbackPolicy::Underlay => {
                warn!("Overlay failed for {} ({}), trying underlay", address, overlay);
                Ok(overlay)
            }
            FallbackPolicy::Disabled => Err(NetworkError::Dial {
                address: address.to_string(),
                source: overlay,
            }),
        }
    }

    async fn dial_stream(
        &self,
        network: &str,
        laddr: Option<SocketAddr>,
        raddr: &str,
    ) -> Result<NetConn, NetworkError> {
        let overlay_err = match Dialer::dial(self.context.as_ref(), network, raddr).await {
            Ok(stream) => {
                debug!("Dialed {} {} over the overlay", network, raddr);
                return Ok(NetConn {
                    stream,
                    route: Route::Overlay,
                    remote: raddr.to_string(),
                });
            }
            Err(e) => self.fall_back(raddr, e)?,
        };

        if !is_tcp(network) {
            return Err(NetworkError::Dial {
                address: raddr.to_string(),
                source: overlay_err,
            });
        }

        let stream = match underlay_tcp(network, laddr, raddr).await {
            Ok(stream) => stream,
            Err(underlay) => {
                return Err(NetworkError::Fallback {
                    address: raddr.to_string(),
                    overlay: overlay_err,
                    underlay,
                })
            }
        };
        info!("Dialed {} {} over the underlay", network, raddr);
        Ok(NetConn {
            stream: Box::new(stream),
            route: Route::Underlay,
            remote: raddr.to_string(),
        })
    }

    fn packet_endpoint(&self, address: &str) -> Result<String, NetworkError> {
        if !is_unspecified(address) {
            return Ok(address.to_string());
        }
        self.default_packet_endpoint
            .clone()
            .ok_or(NetworkError::NoPacketEndpoint)
    }
}

async fn underlay_tcp(
    network: &str,
    laddr: Option<SocketAddr>,
    raddr: &str,
) -> io::Result<TcpStream> {
    let Some(laddr) = laddr else {
        return TcpStream::connect(raddr).await;
    };
    let remote = lookup(network, raddr)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(laddr)?;
    socket.connect(remote).await
}

fn is_tcp(network: &str) -> bool {
    matches!(network, "tcp" | "tcp4" | "tcp6")
}

fn is_udp(network: &str) -> bool {
    matches!(network, "udp" | "udp4" | "udp6")
}

/// Empty, wildcard host, or wildcard IP address
fn is_unspecified(address: &str) -> bool {
    let address = address.trim();
    if address.is_empty() || address.starts_with(':') {
        return true;
    }
    match address.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().is_unspecified(),
        Err(_) => address
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false),
    }
}

/// First resolved address matching the network's address family
async fn lookup(network: &str, address: &str) -> Result<SocketAddr, NetworkError> {
    let want_v4 = network.ends_with('4');
    let want_v6 = network.ends_with('6');
    lookup_host(address)
        .await
        .map_err(|e| NetworkError::Resolve(format!("{}: {}", address, e)))?
        .find(|a| (!want_v4 || a.is_ipv4()) && (!want_v6 || a.is_ipv6()))
        .ok_or_else(|| NetworkError::Resolve(address.to_string()))
}

#[async_trait]
impl Net for OverlayNet {
    fn interfaces(&self) -> Vec<Interface> {
        self.interfaces.read().clone()
    }

    fn update_interfaces(&self) -> Result<(), NetworkError> {
        let fresh = interfaces::list_interfaces()?;
        *self.interfaces.write() = fresh;
        Ok(())
    }

    fn interface_by_index(&self, index: u32) -> Result<Interface, NetworkError> {
        interfaces::by_index(&self.interfaces.read(), index)
    }

    fn interface_by_name(&self, name: &str) -> Result<Interface, NetworkError> {
        interfaces::by_name(&self.interfaces.read(), name)
    }

    async fn dial(&self, network: &str, address: &str) -> Result<NetConn, NetworkError> {
        if !is_tcp(network) && !is_udp(network) {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }
        self.dial_stream(network, None, address).await
    }

    async fn dial_tcp(
        &self,
        network: &str,
        laddr: Option<SocketAddr>,
        raddr: &str,
    ) -> Result<NetConn, NetworkError> {
        if !is_tcp(network) {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }
        self.dial_stream(network, laddr, raddr).await
    }

    async fn listen_tcp(&self, network: &str, laddr: &str) -> Result<NetListener, NetworkError> {
        if !is_tcp(network) {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }

        match self.context.listen(network, laddr).await {
            Ok(listener) => {
                info!("Listening on {} {} over the overlay", network, laddr);
                Ok(NetListener {
                    inner: ListenerKind::Overlay(listener),
                })
            }
            Err(e) => {
                self.fall_back(laddr, e)?;
                let listener = TcpListener::bind(laddr).await?;
                info!("Listening on {} over the underlay", listener.local_addr()?);
                Ok(NetListener {
                    inner: ListenerKind::Underlay(listener),
                })
            }
        }
    }

    async fn listen_packet(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Box<dyn PacketConn>, NetworkError> {
        if !is_tcp(network) && !is_udp(network) {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }
        let endpoint = self.packet_endpoint(address)?;

        let dialer: Arc<dyn Dialer> = self.context.clone();
        let mux = PacketMux::new(dialer, self.mux);
        mux.append_conn(&endpoint, network).await?;
        info!("Packet listener on {} {} backed by the overlay", network, endpoint);
        Ok(Box::new(mux))
    }

    async fn listen_udp(&self, network: &str, laddr: &str) -> Result<UdpPacketConn, NetworkError> {
        if !is_udp(network) {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }
        let addr = lookup(network, laddr).await?;
        UdpPacketConn::bind(addr).await
    }

    async fn dial_udp(
        &self,
        network: &str,
        laddr: Option<SocketAddr>,
        raddr: &str,
    ) -> Result<UdpPacketConn, NetworkError> {
        if !is_udp(network) {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }
        let remote = lookup(network, raddr).await?;
        let local = laddr.unwrap_or_else(|| wildcard_for(&remote));
        UdpPacketConn::connect(local, remote).await
    }

    async fn resolve_udp_addr(&self, network: &str, address: &str) -> Result<SocketAddr, NetworkError> {
        if !is_udp(network) {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }
        lookup(network, address).await
    }

    async fn resolve_tcp_addr(&self, network: &str, address: &str) -> Result<SocketAddr, NetworkError> {
        if !is_tcp(network) {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }
        lookup(network, address).await
    }

    async fn resolve_ip_addr(&self, network: &str, host: &str) -> Result<IpAddr, NetworkError> {
        if !matches!(network, "ip" | "ip4" | "ip6") {
            return Err(NetworkError::UnsupportedNetwork(network.to_string()));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        Ok(lookup(network, &format!("{}:0", host)).await?.ip())
    }
}
