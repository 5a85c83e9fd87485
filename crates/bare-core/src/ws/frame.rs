//! Minimal WebSocket data-frame codec, covering only what v3's initial
//! `{type:"connect",...}`/`{type:"open",...}` JSON exchange needs
//! (spec.md §6.2 v3). Header layout and masking follow
//! `paritytech-soketto::base::Codec` (`decode_header`/`apply_mask`),
//! trimmed to single-frame (`fin=1`), non-fragmented text/binary
//! messages — once that exchange completes, the relay degrades to a
//! raw byte tunnel (see `server.rs`) and this codec is not used again
//! for the lifetime of the connection.

use futures_lite::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BareError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_byte(b: u8) -> Result<Self, BareError> {
        match b {
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(BareError::invalid(format!("unsupported websocket opcode {other:#x}"))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

/// Reads a single, complete (non-fragmented) frame. Per RFC 6455
/// client frames MUST be masked; this rejects unmasked client frames.
pub async fn read_masked_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Frame, BareError> {
    let mut first_two = [0u8; 2];
    stream.read_exact(&mut first_two).await.map_err(BareError::from)?;

    let fin = first_two[0] & 0x80 != 0;
    if !fin {
        return Err(BareError::invalid("fragmented websocket frames are not supported"));
    }
    let opcode = OpCode::from_byte(first_two[0] & 0x0F)?;

    let masked = first_two[1] & 0x80 != 0;
    if !masked {
        return Err(BareError::invalid("client websocket frame must be masked"));
    }

    let len_field = first_two[1] & 0x7F;
    let payload_len: u64 = match len_field {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.map_err(BareError::from)?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.map_err(BareError::from)?;
            u64::from_be_bytes(ext)
        }
        n => n as u64,
    };

    const MAX_FRAME_BYTES: u64 = 1024 * 1024;
    if payload_len > MAX_FRAME_BYTES {
        return Err(BareError::invalid("websocket frame exceeds maximum size"));
    }

    let mut mask = [0u8; 4];
    stream.read_exact(&mut mask).await.map_err(BareError::from)?;

    let mut payload = vec![0u8; payload_len as usize];
    stream.read_exact(&mut payload).await.map_err(BareError::from)?;
    apply_mask(&mut payload, mask);

    Ok(Frame { opcode, payload })
}

/// Writes a single, unmasked (server-to-client) frame.
pub async fn write_unmasked_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    opcode: OpCode,
    payload: &[u8],
) -> Result<(), BareError> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.to_byte());

    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);

    stream.write_all(&out).await.map_err(BareError::from)?;
    stream.flush().await.map_err(BareError::from)
}

pub async fn write_text<W: AsyncWrite + Unpin>(stream: &mut W, text: &str) -> Result<(), BareError> {
    write_unmasked_frame(stream, OpCode::Text, text.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_masked_frame() {
        smol::block_on(async {
            let payload = b"hello";
            let mask = [1u8, 2, 3, 4];
            let mut masked = payload.to_vec();
            apply_mask(&mut masked, mask);

            let mut wire = vec![0x81, 0x80 | payload.len() as u8];
            wire.extend_from_slice(&mask);
            wire.extend_from_slice(&masked);

            let mut cursor = futures_lite::io::Cursor::new(wire);
            let frame = read_masked_frame(&mut cursor).await.unwrap();
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.payload, payload);
        });
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        smol::block_on(async {
            let mut cursor = futures_lite::io::Cursor::new(vec![0x81, 0x00]);
            assert!(read_masked_frame(&mut cursor).await.is_err());
        });
    }

    #[test]
    fn write_text_produces_unmasked_frame() {
        smol::block_on(async {
            let mut out = Vec::new();
            write_text(&mut out, "hi").await.unwrap();
            assert_eq!(out, vec![0x81, 0x02, b'h', b'i']);
        });
    }
}
