//! Datagram framing over stream connections

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::transport::NetworkError;

/// Largest datagram a single read can yield
pub const MAX_DATAGRAM: usize = 65535;

/// How datagram boundaries are carried on a peer stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Every chunk read from the stream is one datagram
    #[default]
    Raw,
    /// RFC 4571: 16-bit big-endian length before each datagram
    LengthPrefixed,
}

impl Framing {
    /// Bytes to write for one datagram
    pub fn encode(&self, datagram: &[u8]) -> Result<Vec<u8>, NetworkError> {
        match self {
            Framing::Raw => Ok(datagram.to_vec()),
            Framing::LengthPrefixed => {
                let len = u16::try_from(datagram.len())
                    .map_err(|_| NetworkError::FrameTooLarge(datagram.len()))?;
                let mut frame = Vec::with_capacity(datagram.len() + 2);
                frame.extend_from_slice(&len.to_be_bytes());
                frame.extend_from_slice(datagram);
                Ok(frame)
            }
        }
    }

    /// Read the next datagram; `None` on a clean end of stream
    pub async fn read_datagram<R>(&self, reader: &mut R, scratch: &mut [u8]) -> io::Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Framing::Raw => {
                let n = reader.read(scratch).await?;
                Ok((n > 0).then(|| scratch[..n].to_vec()))
            }
            Framing::LengthPrefixed => {
                let mut header = [0u8; 2];
                if reader.read(&mut header[..1]).await? == 0 {
                    return Ok(None);
                }
                reader.read_exact(&mut header[1..]).await?;
                let len = u16::from_be_bytes(header) as usize;
                let mut datagram = vec![0u8; len];
                reader.read_exact(&mut datagram).await?;
                Ok(Some(datagram))
            }
        }
    }
}
