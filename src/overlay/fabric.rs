//! TLS data plane to edge routers
//!
//! Every dial or bind is its own mutually authenticated TLS connection to an
//! edge router. The first line on the stream is a JSON request, the router
//! answers with one JSON line, and from then on the stream carries payload
//! bytes untouched.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::identity::IdentityCredential;

use super::catalog::split_host_port;
use super::dial::{Overlay, OverlayListener, PeerStream};
use super::error::OverlayError;

const MAX_HANDSHAKE_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Op {
    Dial,
    Bind,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Dial => "dial",
            Op::Bind => "bind",
        }
    }
}

#[derive(Debug, Serialize)]
struct HandshakeRequest<'a> {
    op: Op,
    service: &'a str,
    session: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HandshakeReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    peer: Option<String>,
}

/// Send the request line and wait for the router's answer
///
/// The reply is read byte by byte so nothing after the newline is consumed.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    op: Op,
    service: &str,
    session: &str,
) -> Result<HandshakeReply, OverlayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(&HandshakeRequest {
        op,
        service,
        session,
    })
    .map_err(|e| OverlayError::Handshake(e.to_string()))?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.flush().await?;

    let mut reply = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await.map_err(|e| {
            OverlayError::Handshake(format!("router closed during handshake: {}", e))
        })?;
        if byte == b'\n' {
            break;
        }
        if reply.len() >= MAX_HANDSHAKE_LINE {
            return Err(OverlayError::Handshake("reply line too long".to_string()));
        }
        reply.push(byte);
    }

    let reply: HandshakeReply = serde_json::from_slice(&reply)
        .map_err(|e| OverlayError::Handshake(format!("malformed reply: {}", e)))?;
    if !reply.ok {
        return Err(OverlayError::Refused {
            op: op.as_str(),
            service: service.to_string(),
            reason: reply.error.unwrap_or_else(|| "no reason given".to_string()),
        });
    }
    Ok(reply)
}

struct FabricInner {
    connector: TlsConnector,
    routers: RwLock<Vec<String>>,
    session: RwLock<String>,
}

/// Overlay backed by TLS connections to edge routers
#[derive(Clone)]
pub struct TlsFabric {
    inner: Arc<FabricInner>,
}

impl TlsFabric {
    /// Build a fabric presenting the identity certificate and trusting its CA bundle
    pub fn new(credential: &IdentityCredential) -> Result<Self, OverlayError> {
        Ok(Self::with_config(Arc::new(client_config(credential)?)))
    }

    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                connector: TlsConnector::from(config),
                routers: RwLock::new(Vec::new()),
                session: RwLock::new(String::new()),
            }),
        }
    }

    pub fn routers(&self) -> Vec<String> {
        self.inner.routers.read().clone()
    }

    async fn open_on(
        &self,
        router: &str,
        op: Op,
        service: &str,
    ) -> Result<(PeerStream, HandshakeReply), OverlayError> {
        let (host, _) = split_host_port(router);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| OverlayError::Address(format!("{}: {}", router, e)))?;

        let tcp = TcpStream::connect(router).await?;
        tcp.set_nodelay(true)?;
        let mut tls = self
            .inner
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| OverlayError::Tls(e.to_string()))?;

        let session = self.inner.session.read().clone();
        let reply = handshake(&mut tls, op, service, &session).await?;
        Ok((Box::new(tls), reply))
    }

    /// Try each router in order until one completes the handshake
    async fn open(&self, op: Op, service: &str) -> Result<(PeerStream, HandshakeReply), OverlayError> {
        let routers = self.routers();
        let mut last_err = None;

        for router in &routers {
            match self.open_on(router, op, service).await {
                Ok(opened) => {
                    debug!("{} {} via router {}", op.as_str(), service, router);
                    return Ok(opened);
                }
                Err(e @ OverlayError::Refused { .. }) => return Err(e),
                Err(e) => {
                    warn!("Router {} unusable for {}: {}", router, service, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| OverlayError::NoRouter(service.to_string())))
    }
}

#[async_trait]
impl Overlay for TlsFabric {
    async fn dial(&self, service: &str) -> Result<PeerStream, OverlayError> {
        let (stream, _) = self.open(Op::Dial, service).await?;
        Ok(stream)
    }

    async fn listen(&self, service: &str) -> Result<Box<dyn OverlayListener>, OverlayError> {
        if self.inner.routers.read().is_empty() {
            return Err(OverlayError::NoRouter(service.to_string()));
        }
        info!("Hosting service {}", service);
        Ok(Box::new(TlsListener {
            fabric: self.clone(),
            service: service.to_string(),
        }))
    }

    fn refresh(&self, routers: Vec<String>, session: &str) {
        debug!("Fabric now using {} edge router(s)", routers.len());
        *self.inner.routers.write() = routers;
        *self.inner.session.write() = session.to_string();
    }
}

/// Each accept parks one bind stream on a router until a dialer arrives
struct TlsListener {
    fabric: TlsFabric,
    service: String,
}

#[async_trait]
impl OverlayListener for TlsListener {
    async fn accept(&self) -> Result<(PeerStream, String), OverlayError> {
        let (stream, reply) = self.fabric.open(Op::Bind, &self.service).await?;
        let peer = reply.peer.unwrap_or_default();
        debug!("Accepted {} on service {}", peer, self.service);
        Ok((stream, peer))
    }

    fn service(&self) -> &str {
        &self.service
    }
}

fn client_config(credential: &IdentityCredential) -> Result<ClientConfig, OverlayError> {
    let mut roots = RootCertStore::empty();
    for der in credential.ca_certificates()? {
        roots
            .add(der)
            .map_err(|e| OverlayError::Tls(format!("invalid CA certificate: {}", e)))?;
    }

    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| OverlayError::Tls(e.to_string()))?
            .with_root_certificates(roots);

    let chain = credential.certificate_chain()?;
    if chain.is_empty() {
        return Ok(builder.with_no_client_auth());
    }
    builder
        .with_client_auth_cert(chain, credential.private_key()?)
        .map_err(|e| OverlayError::Tls(e.to_string()))
}
