//! One peer connection inside the multiplexer

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::overlay::PeerStream;
use crate::transport::NetworkError;

use super::conn::check_deadline;
use super::framing::{Framing, MAX_DATAGRAM};

/// A datagram waiting in the shared receive queue
#[derive(Debug)]
pub(crate) struct Datagram {
    pub from: String,
    pub data: Vec<u8>,
}

/// Peer address, its stream, and the task draining it
pub(crate) struct PeerRecord {
    id: u64,
    address: String,
    framing: Framing,
    writer: tokio::sync::Mutex<WriteHalf<PeerStream>>,
    write_deadline: Mutex<Option<Instant>>,
    closed: AtomicBool,
    /// Wakes writes blocked on a full stream when the record closes
    closing: watch::Sender<bool>,
    receiver: JoinHandle<()>,
}

impl PeerRecord {
    /// Split the stream and start its receive task
    pub fn start(
        id: u64,
        address: String,
        stream: PeerStream,
        framing: Framing,
        queue: mpsc::Sender<Datagram>,
        write_deadline: Option<Instant>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let receiver = tokio::spawn(receive_loop(reader, address.clone(), framing, queue));
        debug!("Peer record {} started for {}", id, address);

        Self {
            id,
            address,
            framing,
            writer: tokio::sync::Mutex::new(writer),
            write_deadline: Mutex::new(write_deadline),
            closed: AtomicBool::new(false),
            closing: watch::Sender::new(false),
            receiver,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn ensure_open(&self) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            Err(NetworkError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError> {
        self.ensure_open()?;
        *self.write_deadline.lock() = deadline;
        Ok(())
    }

    /// Write one datagram, bounded by the write deadline
    ///
    /// A write still pending when the record closes fails with
    /// [`NetworkError::Closed`] and releases the writer.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, NetworkError> {
        self.ensure_open()?;
        let deadline = *self.write_deadline.lock();
        check_deadline(deadline)?;

        let frame = self.framing.encode(buf)?;
        let mut closing = self.closing.subscribe();
        let write = async {
            tokio::select! {
                result = async {
                    let mut writer = self.writer.lock().await;
                    writer.write_all(&frame).await?;
                    writer.flush().await
                } => result.map_err(NetworkError::from),
                _ = closing.wait_for(|closed| *closed) => Err(NetworkError::Closed),
            }
        };
        match deadline {
            Some(d) => timeout_at(d, write).await.map_err(|_| NetworkError::Timeout)??,
            None => write.await?,
        }

        trace!("Sent {} bytes to {} (record {})", buf.len(), self.address, self.id);
        Ok(buf.len())
    }

    /// Stop the receive task and shut the stream down
    pub async fn close(&self) -> Result<(), NetworkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::Closed);
        }
        self.closing.send_replace(true);
        self.receiver.abort();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        debug!("Peer record {} for {} closed", self.id, self.address);
        Ok(())
    }
}

impl Drop for PeerRecord {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(
    mut reader: ReadHalf<PeerStream>,
    address: String,
    framing: Framing,
    queue: mpsc::Sender<Datagram>,
) {
    let mut scratch = vec![0u8; MAX_DATAGRAM];
    loop {
        let data = match framing.read_datagram(&mut reader, &mut scratch).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("Peer {} closed its stream", address);
                break;
            }
            Err(e) => {
                warn!("Receive error from {}: {}", address, e);
                break;
            }
        };

        trace!("Received {} bytes from {}", data.len(), address);
        let datagram = Datagram {
            from: address.clone(),
            data,
        };
        if queue.send(datagram).await.is_err() {
            debug!("Receive queue closed, stopping receive loop for {}", address);
            break;
        }
    }
}
