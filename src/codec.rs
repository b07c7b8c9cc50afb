//! Transport codec for the two wire formats on the bus.
//!
//! UDP datagrams carry one bare UTF-8 JSON object each. TCP frames carry one
//! JSON value of any shape behind a length header; the RPC layer decides
//! which shapes it accepts:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)       │
//! │ Big-endian u32   │ UTF-8 JSON object        │
//! └──────────────────┴──────────────────────────┘
//! ```

use crate::error::{BusError, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time;

/// Largest datagram the codec will send or receive.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;
pub const FRAME_HEADER_LEN: usize = 4;
/// Declared frame lengths above this are rejected before allocating.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Outcome of a receive that may legitimately produce nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Reception<T> {
    Received(T),
    TimedOut,
    ClosedByPeer,
}

impl<T> Reception<T> {
    pub fn received(self) -> Option<T> {
        match self {
            Reception::Received(value) => Some(value),
            Reception::TimedOut | Reception::ClosedByPeer => None,
        }
    }
}

pub fn encode_datagram<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(message).map_err(|e| BusError::Encoding(e.to_string()))?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(BusError::Encoding(format!(
            "datagram of {} bytes exceeds {} byte ceiling",
            bytes.len(),
            MAX_DATAGRAM_SIZE
        )));
    }
    Ok(bytes)
}

/// Parses bytes as a UTF-8 JSON value of any shape.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| BusError::MalformedMessage(format!("invalid UTF-8: {}", e)))?;
    serde_json::from_str(text).map_err(|e| BusError::MalformedMessage(format!("invalid JSON: {}", e)))
}

/// Parses bytes as a UTF-8 JSON object.
pub fn decode_object(bytes: &[u8]) -> Result<Value> {
    let value = decode_value(bytes)?;
    if !value.is_object() {
        return Err(BusError::MalformedMessage("expected a JSON object".into()));
    }
    Ok(value)
}

pub async fn send_datagram<T: Serialize>(
    socket: &UdpSocket,
    target: SocketAddr,
    message: &T,
) -> Result<()> {
    let bytes = encode_datagram(message)?;
    socket.send_to(&bytes, target).await?;
    Ok(())
}

/// Receives one datagram, waiting at most `timeout` when one is given.
///
/// A datagram that fails to decode comes back as `Err(MalformedMessage)`;
/// the socket stays usable and callers are expected to keep receiving.
pub async fn receive_datagram(
    socket: &UdpSocket,
    timeout: Option<Duration>,
) -> Result<Reception<(Value, SocketAddr)>> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, peer) = match timeout {
        Some(limit) => match time::timeout(limit, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Ok(Reception::TimedOut),
        },
        None => socket.recv_from(&mut buf).await?,
    };

    let value = decode_object(&buf[..len])?;
    Ok(Reception::Received((value, peer)))
}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message).map_err(|e| BusError::Encoding(e.to_string()))?;
    let len = u32::try_from(body.len())
        .map_err(|_| BusError::Encoding(format!("frame of {} bytes is too large", body.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Writes header and body with a single `write_all` so frames never interleave.
pub async fn send_framed<W, T>(stream: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn receive_framed<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Value> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    read_full(stream, &mut header).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(BusError::MalformedMessage(format!(
            "declared frame length {} exceeds {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    read_full(stream, &mut body).await?;
    decode_value(&body)
}

/// Like [`receive_framed`], with a peer close reported as [`Reception::ClosedByPeer`].
pub async fn receive_framed_within<R: AsyncRead + Unpin>(
    stream: &mut R,
    timeout: Duration,
) -> Result<Reception<Value>> {
    match time::timeout(timeout, receive_framed(stream)).await {
        Err(_) => Ok(Reception::TimedOut),
        Ok(Ok(value)) => Ok(Reception::Received(value)),
        Ok(Err(BusError::ConnectionClosed)) => Ok(Reception::ClosedByPeer),
        Ok(Err(e)) => Err(e),
    }
}

async fn read_full<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = match stream.read(&mut buf[filled..]).await {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) => {
                return Err(BusError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(BusError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(())
}
