//! XMODEM-CRC sender used to upload boot assets to the boot loader's `loadx`.
//!
//! 128-byte blocks, CRC-16/XMODEM, last block padded with SUB.

use std::collections::VecDeque;
use std::time::Duration;

use benchwarden_core::ChannelError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub const BLOCK_SIZE: usize = 128;
pub const MAX_RETRIES: u32 = 10;

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const CRC_MODE: u8 = b'C';
const SUB: u8 = 0x1A;

#[derive(Debug, thiserror::Error)]
pub enum XmodemError {
    #[error("receiver never requested a CRC transfer")]
    NoHandshake,

    #[error("receiver cancelled the transfer")]
    Cancelled,

    #[error("block {block} not acknowledged after repeated attempts")]
    TooManyRetries { block: u32 },

    #[error("end of transfer not acknowledged")]
    EotNotAcknowledged,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<XmodemError> for ChannelError {
    fn from(err: XmodemError) -> Self {
        match err {
            XmodemError::Io(e) => ChannelError::Io(e),
            other => ChannelError::Transport(format!("xmodem: {other}")),
        }
    }
}

/// CRC-16/XMODEM (poly 0x1021, init 0).
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Build one framed block. `chunk` must be at most [`BLOCK_SIZE`] bytes.
fn frame(number: u8, chunk: &[u8]) -> Vec<u8> {
    let mut payload = [SUB; BLOCK_SIZE];
    payload[..chunk.len()].copy_from_slice(chunk);
    let crc = crc16_xmodem(&payload);

    let mut packet = Vec::with_capacity(BLOCK_SIZE + 5);
    packet.push(SOH);
    packet.push(number);
    packet.push(!number);
    packet.extend_from_slice(&payload);
    packet.extend_from_slice(&crc.to_be_bytes());
    packet
}

/// Byte reader that serves already-buffered input before touching the port.
struct Responses<'a, S> {
    io: &'a mut S,
    pending: VecDeque<u8>,
}

impl<S: AsyncRead + Unpin> Responses<'_, S> {
    async fn next(&mut self, wait: Duration) -> Result<Option<u8>, XmodemError> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }
        let mut byte = [0u8; 1];
        match tokio::time::timeout(wait, self.io.read(&mut byte)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(XmodemError::Io(std::io::ErrorKind::UnexpectedEof.into())),
            Ok(Ok(_)) => Ok(Some(byte[0])),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

/// Send `data` over `io`. `pending` holds bytes the caller already read from
/// the receiver (the handshake `C` often arrives with the loader banner).
///
/// `wait` bounds each individual response. Returns the number of blocks sent.
pub async fn send<S>(
    io: &mut S,
    pending: &[u8],
    data: &[u8],
    wait: Duration,
) -> Result<u32, XmodemError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rx = Responses {
        io,
        pending: pending.iter().copied().collect(),
    };

    // Banner text may precede the request; only silent periods count.
    let mut quiet = 0;
    loop {
        match rx.next(wait).await? {
            Some(CRC_MODE) => break,
            Some(CAN) => return Err(XmodemError::Cancelled),
            Some(_) => continue,
            None => {
                quiet += 1;
                if quiet >= MAX_RETRIES {
                    return Err(XmodemError::NoHandshake);
                }
            }
        }
    }

    let mut blocks = 0u32;
    for (index, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        let block = index as u32 + 1;
        let packet = frame(block as u8, chunk);
        let mut acked = false;
        for attempt in 1..=MAX_RETRIES {
            rx.io.write_all(&packet).await?;
            rx.io.flush().await?;
            match rx.next(wait).await? {
                Some(ACK) => {
                    acked = true;
                    break;
                }
                Some(CAN) => return Err(XmodemError::Cancelled),
                other => {
                    debug!(block, attempt, response = ?other, "block not acknowledged, resending");
                }
            }
        }
        if !acked {
            warn!(block, "xmodem transfer gave up");
            return Err(XmodemError::TooManyRetries { block });
        }
        blocks = block;
    }

    for _ in 0..MAX_RETRIES {
        rx.io.write_all(&[EOT]).await?;
        rx.io.flush().await?;
        match rx.next(wait).await? {
            Some(ACK) => return Ok(blocks),
            Some(NAK) | None => continue,
            Some(CAN) => return Err(XmodemError::Cancelled),
            Some(_) => continue,
        }
    }
    Err(XmodemError::EotNotAcknowledged)
}
