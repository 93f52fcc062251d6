//! Connectionless socket over per-peer overlay streams
//!
//! Each appended peer owns a stream and a receive task. Receive tasks feed
//! one bounded queue, so a read returns whichever peer delivered first and
//! a slow reader pushes back on every peer. Writes go to the stream whose
//! address matches the destination; nothing is dialed implicitly.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::overlay::Dialer;
use crate::transport::NetworkError;

use super::conn::{check_deadline, PacketConn};
use super::framing::Framing;
use super::record::{Datagram, PeerRecord};

/// Default receive queue depth, in datagrams
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Multiplexer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    pub framing: Framing,
    pub queue_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Raw,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Packet multiplexer over overlay streams
pub struct PacketMux {
    dialer: Arc<dyn Dialer>,
    framing: Framing,
    records: RwLock<Vec<Arc<PeerRecord>>>,
    next_id: AtomicU64,
    queue_tx: mpsc::Sender<Datagram>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    read_deadline: watch::Sender<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    closed: watch::Sender<bool>,
}

impl PacketMux {
    pub fn new(dialer: Arc<dyn Dialer>, config: MuxConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (read_deadline, _) = watch::channel(None);
        let (closed, _) = watch::channel(false);

        Self {
            dialer,
            framing: config.framing,
            records: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            read_deadline,
            write_deadline: Mutex::new(None),
            closed,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> Result<(), NetworkError> {
        if self.is_closed() {
            Err(NetworkError::Closed)
        } else {
            Ok(())
        }
    }

    fn snapshot(&self) -> Vec<Arc<PeerRecord>> {
        self.records.read().clone()
    }

    /// Dial `address` and add it as a peer; returns the new peer count
    ///
    /// Appending an address that is already present adds a second record.
    pub async fn append_conn(&self, address: &str, network: &str) -> Result<usize, NetworkError> {
        self.ensure_open()?;

        let stream = self
            .dialer
            .dial(network, address)
            .await
            .map_err(|source| NetworkError::Dial {
                address: address.to_string(),
                source,
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(PeerRecord::start(
            id,
            address.to_string(),
            stream,
            self.framing,
            self.queue_tx.clone(),
            *self.write_deadline.lock(),
        ));

        let count = {
            let mut records = self.records.write();
            if self.is_closed() {
                None
            } else {
                records.push(record.clone());
                Some(records.len())
            }
        };

        match count {
            Some(count) => {
                info!("Appended peer {} over {} ({} peer(s))", address, network, count);
                Ok(count)
            }
            None => {
                let _ = record.close().await;
                Err(NetworkError::Closed)
            }
        }
    }

    /// Close and remove every record for `address`; returns how many were removed
    pub async fn close_conn(&self, address: &str) -> Result<usize, NetworkError> {
        self.ensure_open()?;

        let removed: Vec<Arc<PeerRecord>> = {
            let mut records = self.records.write();
            let (removed, kept): (Vec<_>, Vec<_>) =
                records.drain(..).partition(|r| r.address() == address);
            *records = kept;
            removed
        };

        for record in &removed {
            if let Err(e) = record.close().await {
                warn!("Closing peer {} failed: {}", address, e);
            }
        }
        if !removed.is_empty() {
            info!("Removed {} record(s) for {}", removed.len(), address);
        }
        Ok(removed.len())
    }

    /// Addresses of all records, in append order
    pub fn peers(&self) -> Vec<String> {
        self.records
            .read()
            .iter()
            .map(|r| r.address().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    async fn next_datagram(&self) -> Option<Datagram> {
        self.queue_rx.lock().await.recv().await
    }

    fn try_next_datagram(&self) -> Option<Datagram> {
        self.queue_rx.try_lock().ok()?.try_recv().ok()
    }

    fn fan_out<F>(&self, op: &'static str, f: F) -> Result<(), NetworkError>
    where
        F: Fn(&PeerRecord) -> Result<(), NetworkError>,
    {
        let failures: Vec<(String, NetworkError)> = self
            .snapshot()
            .iter()
            .filter_map(|r| f(r.as_ref()).err().map(|e| (r.address().to_string(), e)))
            .collect();
        aggregate(op, failures)
    }
}

fn aggregate(op: &'static str, failures: Vec<(String, NetworkError)>) -> Result<(), NetworkError> {
    if failures.is_empty() {
        return Ok(());
    }
    for (address, e) in &failures {
        warn!("{} failed for {}: {}", op, address, e);
    }
    Err(NetworkError::FanOut { op, failures })
}

fn deliver(datagram: Datagram, buf: &mut [u8]) -> (usize, String) {
    let n = datagram.data.len().min(buf.len());
    buf[..n].copy_from_slice(&datagram.data[..n]);
    if n < datagram.data.len() {
        trace!(
            "Truncated {} byte datagram from {} to {}",
            datagram.data.len(),
            datagram.from,
            n
        );
    }
    (n, datagram.from)
}

#[async_trait]
impl PacketConn for PacketMux {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, String), NetworkError> {
        self.ensure_open()?;
        if self.is_empty() {
            return match self.try_next_datagram() {
                Some(datagram) => Ok(deliver(datagram, buf)),
                None => Err(NetworkError::NoPeers),
            };
        }

        let mut closed = self.closed.subscribe();
        let mut deadline_rx = self.read_deadline.subscribe();

        loop {
            if *closed.borrow_and_update() {
                return Err(NetworkError::Closed);
            }
            let deadline = *deadline_rx.borrow_and_update();
            check_deadline(deadline)?;

            let expiry = async move {
                match deadline {
                    Some(d) => sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                datagram = self.next_datagram() => {
                    return match datagram {
                        Some(datagram) => Ok(deliver(datagram, buf)),
                        None => Err(NetworkError::Closed),
                    };
                }
                _ = closed.changed() => continue,
                _ = deadline_rx.changed() => continue,
                _ = expiry => return Err(NetworkError::Timeout),
            }
        }
    }

    async fn write_to(&self, buf: &[u8], address: &str) -> Result<usize, NetworkError> {
        self.ensure_open()?;
        let record = self
            .records
            .read()
            .iter()
            .rev()
            .find(|r| r.address() == address)
            .cloned()
            .ok_or_else(|| NetworkError::AddressNotFound(address.to_string()))?;
        record.write(buf).await
    }

    async fn close(&self) -> Result<(), NetworkError> {
        if self.closed.send_replace(true) {
            return Err(NetworkError::Closed);
        }

        let records = std::mem::take(&mut *self.records.write());
        let results = join_all(records.iter().map(|r| r.close())).await;
        let failures: Vec<(String, NetworkError)> = records
            .iter()
            .zip(results)
            .filter_map(|(r, res)| res.err().map(|e| (r.address().to_string(), e)))
            .collect();

        info!("Packet mux closed ({} peer(s))", records.len());
        aggregate("close", failures)
    }

    /// Placeholder; peers are identified by the addresses they were appended with
    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError> {
        self.ensure_open()?;
        self.read_deadline.send_replace(deadline);
        *self.write_deadline.lock() = deadline;
        self.fan_out("set_deadline", |r| r.set_write_deadline(deadline))
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError> {
        self.ensure_open()?;
        self.read_deadline.send_replace(deadline);
        debug!("Read deadline set to {:?}", deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError> {
        self.ensure_open()?;
        *self.write_deadline.lock() = deadline;
        self.fan_out("set_write_deadline", |r| r.set_write_deadline(deadline))
    }
}

impl std::fmt::Debug for PacketMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketMux")
            .field("peers", &self.peers())
            .field("framing", &self.framing)
            .field("closed", &self.is_closed())
            .finish()
    }
}
