//! Length-prefixed framing.
//!
//! The header is the payload's UTF-8 byte length in decimal, left-justified
//! into [`HEADER_LEN`] bytes and padded with spaces. Four header bytes cap a
//! payload at [`MAX_PAYLOAD`] bytes; anything longer is refused rather than
//! written with a header that no longer matches.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload representable in the header.
pub const MAX_PAYLOAD: usize = 9999;

/// Framing failures. All of them are fatal to the connection they occur on.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("malformed length header {0:?}")]
    Malformed(String),
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD} byte frame limit")]
    TooLarge(usize),
}

/// Append one encoded frame for `text` to `out`.
pub fn encode(text: &str, out: &mut BytesMut) -> Result<(), FrameError> {
    let payload = text.as_bytes();
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let header = format!("{:<width$}", payload.len(), width = HEADER_LEN);
    out.reserve(HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Size on the wire of a frame carrying `text`, if it fits in one frame.
pub fn encoded_len(text: &str) -> Option<usize> {
    (text.len() <= MAX_PAYLOAD).then_some(HEADER_LEN + text.len())
}

/// Parse a header into a payload length.
fn parse_header(header: &[u8; HEADER_LEN]) -> Result<usize, FrameError> {
    let raw = std::str::from_utf8(header)
        .map_err(|_| FrameError::Malformed(String::from_utf8_lossy(header).into_owned()))?;
    raw.trim()
        .parse()
        .map_err(|_| FrameError::Malformed(raw.to_string()))
}

/// Reading side of a framed connection.
pub struct FrameReader<R> {
    inner: R,
    payload: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            payload: Vec::new(),
        }
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly, that is
    /// before sending any byte of a new header.
    pub async fn receive(&mut self) -> Result<Option<String>, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                };
            }
            filled += n;
        }

        let length = parse_header(&header)?;
        self.payload.clear();
        self.payload.resize(length, 0);
        self.inner
            .read_exact(&mut self.payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
                _ => FrameError::Io(e),
            })?;

        let text = std::str::from_utf8(&self.payload).map_err(|_| FrameError::InvalidUtf8)?;
        Ok(Some(text.to_string()))
    }
}

/// Writing side of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(HEADER_LEN + 256),
        }
    }

    /// Send one message. Header and payload go out in a single write.
    pub async fn send(&mut self, text: &str) -> Result<(), FrameError> {
        self.buffer.clear();
        encode(text, &mut self.buffer)?;
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write direction of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
