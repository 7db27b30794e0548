//! Framing over the host pipe: a stream of whitespace-separated JSON
//! documents in, whole documents out.

use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to read from host: {0}")]
    Read(std::io::Error),
    #[error("failed to write to host: {0}")]
    Write(std::io::Error),
    #[error("failed to serialize message: {0}")]
    Serialize(serde_json::Error),
}

/// Decodes one JSON value at a time from a byte stream.
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
    boundary: Boundary,
    /// Set when the buffered bytes may hold a complete document.
    ready: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            boundary: Boundary::default(),
            ready: false,
            eof: false,
        }
    }

    /// Next document, or `None` once the stream ends. A truncated or
    /// malformed trailing document ends the stream as well.
    pub async fn read_message(&mut self) -> Result<Option<Value>, TransportError> {
        loop {
            if !self.ready && !self.eof {
                self.fill().await?;
                continue;
            }
            match self.try_decode() {
                Decoded::Message(value) => return Ok(Some(value)),
                Decoded::Malformed(err) => {
                    tracing::warn!(error = %err, "malformed JSON from host, treating as end of stream");
                    self.buf.clear();
                    self.eof = true;
                    return Ok(None);
                }
                Decoded::NeedMore if self.eof => {
                    if !self.buf.is_empty() {
                        tracing::debug!(bytes = self.buf.len(), "discarding truncated trailing document");
                        self.buf.clear();
                    }
                    return Ok(None);
                }
                Decoded::NeedMore => self.ready = false,
            }
        }
    }

    async fn fill(&mut self) -> Result<(), TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self
            .inner
            .read(&mut chunk)
            .await
            .map_err(TransportError::Read)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
            self.ready = self.boundary.advance(&self.buf);
        }
        Ok(())
    }

    fn try_decode(&mut self) -> Decoded {
        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };
        match next {
            None => {
                self.buf.clear();
                self.boundary = Boundary::default();
                Decoded::NeedMore
            }
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                self.boundary = Boundary::default();
                self.ready = self.boundary.advance(&self.buf);
                Decoded::Message(value)
            }
            Some(Err(err)) if err.is_eof() => Decoded::NeedMore,
            Some(Err(err)) => Decoded::Malformed(err),
        }
    }
}

enum Decoded {
    Message(Value),
    NeedMore,
    Malformed(serde_json::Error),
}

/// Incremental scan for the end of a top-level JSON value. Each byte is
/// looked at once, so a document arriving in many small reads is only
/// handed to the parser when it can actually be complete.
#[derive(Debug, Default)]
struct Boundary {
    depth: usize,
    in_string: bool,
    escaped: bool,
    scanned: usize,
}

impl Boundary {
    fn advance(&mut self, buf: &[u8]) -> bool {
        let mut complete = false;
        for &byte in &buf[self.scanned.min(buf.len())..] {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    complete |= self.depth == 0;
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    complete |= self.depth == 0;
                }
                _ if byte.is_ascii_whitespace() => complete |= self.depth == 0,
                _ => {}
            }
        }
        self.scanned = buf.len();
        complete
    }
}

type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Shared handle to the outbound half of the pipe.
///
/// Each message is serialized before the lock is taken, and the lock is
/// held for exactly one document, so concurrent producers never interleave.
#[derive(Clone)]
pub struct MessageWriter {
    inner: Arc<Mutex<BoxedWrite>>,
}

impl MessageWriter {
    pub fn new<W: AsyncWrite + Send + 'static>(inner: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::pin(inner))),
        }
    }

    pub async fn write_message<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), TransportError> {
        let mut bytes = serde_json::to_vec(message).map_err(TransportError::Serialize)?;
        bytes.extend_from_slice(b"\n\n");
        let mut out = self.inner.lock().await;
        out.write_all(&bytes).await.map_err(TransportError::Write)?;
        out.flush().await.map_err(TransportError::Write)
    }
}
