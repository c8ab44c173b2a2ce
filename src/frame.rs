//! Length-prefixed DNS message framing.
//!
//! DNS over TCP and DNS over TLS share the same envelope: a 2-byte
//! big-endian length followed by the message. The first two bytes of the
//! message are its transaction ID; the rest is carried as opaque bytes.
//!
//! ```text
//! +--------+--------+------------------+
//! | length |   id   | body[length - 2] |
//! +--------+--------+------------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Size of the transaction ID at the start of every message.
pub const ID_LEN: usize = 2;

/// Largest body that still fits the 16-bit length prefix.
pub const MAX_BODY_LEN: usize = u16::MAX as usize - ID_LEN;

/// One DNS message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(id: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }

    /// Value of the length prefix for this frame.
    pub fn wire_len(&self) -> usize {
        ID_LEN + self.body.len()
    }

    /// The same message under another transaction ID.
    pub fn with_id(self, id: u16) -> Self {
        Self { id, ..self }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_frame(self.id, &self.body)
    }
}

/// Encode `id` and `body` as `len || id || body`.
pub fn encode_frame(id: u16, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.len() > MAX_BODY_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    let wire_len = (ID_LEN + body.len()) as u16;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + ID_LEN + body.len());
    buf.extend_from_slice(&wire_len.to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(body);

    Ok(buf)
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte of
/// a frame. Waits for slow peers without polling; callers bound the wait
/// with a timeout.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];

    let n = reader.read(&mut prefix).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < LENGTH_PREFIX_LEN {
        reader.read_exact(&mut prefix[n..]).await?;
    }

    let wire_len = u16::from_be_bytes(prefix);
    if (wire_len as usize) < ID_LEN {
        return Err(FrameError::Malformed(wire_len));
    }

    let mut message = vec![0u8; wire_len as usize];
    reader.read_exact(&mut message).await?;

    let id = u16::from_be_bytes([message[0], message[1]]);
    message.drain(..ID_LEN);

    Ok(Some(Frame { id, body: message }))
}

/// Encode `frame` and write it with a single `write_all`, then flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;

    Ok(())
}
