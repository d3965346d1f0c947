//! Packet framing for stream transports
//!
//! Frame format:
//! ```text
//! +--------+--------+-----------------------------------+
//! |  Length (2B BE) |  Sealed packet (nonce|ct|tag)     |
//! +--------+--------+-----------------------------------+
//! ```

use super::TransportError;
use crate::crypto::Cipher;
use crate::protocol::MAX_FRAME_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Seal `packet` and write it as one frame
pub async fn write_frame<W>(writer: &mut W, cipher: &Cipher, packet: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let sealed = cipher.seal(packet)?;
    if sealed.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(sealed.len()));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + sealed.len());
    frame.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    frame.extend_from_slice(&sealed);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and open it.
///
/// A clean end of stream before a length prefix yields `Closed`.
pub async fn read_frame<R>(reader: &mut R, cipher: &Cipher) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut sealed = vec![0u8; len];
    reader.read_exact(&mut sealed).await?;

    Ok(cipher.open(&sealed)?)
}
