use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use log::{debug, trace};
use thiserror::Error;

use crate::splitter::MessageSplitter;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("the serial stream was closed")]
    Closed,
    /// The stream ended partway through a frame; holds what arrived of it.
    #[error("the serial stream ended inside a frame ({} bytes)", .0.len())]
    Truncated(Vec<u8>),
}

/// How the bytes following a request are turned into one response.
#[derive(Debug)]
pub enum ResponseParser {
    /// One complete RCP frame.
    Message(MessageSplitter),
    /// Exactly `len` raw bytes.
    FixedLength { len: usize, buf: Vec<u8> },
    /// Raw bytes up to and including the first `delimiter`.
    Delimiter { delimiter: Vec<u8>, buf: Vec<u8> },
}

pub enum ParseResult {
    /// The response is complete. `rest` holds whatever was read past its end.
    Ready { unit: Vec<u8>, rest: Vec<u8> },
    /// More bytes are needed.
    Incomplete,
}

impl ResponseParser {
    pub fn message() -> Self {
        Self::Message(MessageSplitter::new())
    }

    pub fn fixed_length(len: usize) -> Self {
        Self::FixedLength {
            len,
            buf: Vec::with_capacity(len),
        }
    }

    pub fn delimiter(delimiter: &[u8]) -> Self {
        Self::Delimiter {
            delimiter: delimiter.to_vec(),
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> ParseResult {
        match self {
            Self::Message(splitter) => {
                splitter.push(chunk);
                match splitter.next_message() {
                    Some(unit) => ParseResult::Ready {
                        unit,
                        rest: splitter.flush(),
                    },
                    None => ParseResult::Incomplete,
                }
            }

            Self::FixedLength { len, buf } => {
                buf.extend_from_slice(chunk);
                if buf.len() < *len {
                    return ParseResult::Incomplete;
                }
                let rest = buf.split_off(*len);
                ParseResult::Ready {
                    unit: std::mem::take(buf),
                    rest,
                }
            }

            Self::Delimiter { delimiter, buf } => {
                // only the tail of the old data can start a new match
                let from = buf.len().saturating_sub(delimiter.len().saturating_sub(1));
                buf.extend_from_slice(chunk);
                let end = if delimiter.is_empty() {
                    Some(0)
                } else {
                    buf[from..]
                        .windows(delimiter.len())
                        .position(|w| w == delimiter.as_slice())
                        .map(|pos| from + pos + delimiter.len())
                };
                match end {
                    Some(end) => {
                        let rest = buf.split_off(end);
                        ParseResult::Ready {
                            unit: std::mem::take(buf),
                            rest,
                        }
                    }
                    None => ParseResult::Incomplete,
                }
            }
        }
    }

    /// The error for a stream that ended before the response completed.
    /// A frame wait hands back its unvalidated tail as [`TransportError::Truncated`].
    pub fn finish(self) -> TransportError {
        match self {
            Self::Message(mut splitter) => {
                let tail = splitter.flush();
                if tail.is_empty() {
                    TransportError::Closed
                } else {
                    TransportError::Truncated(tail)
                }
            }
            Self::FixedLength { .. } | Self::Delimiter { .. } => TransportError::Closed,
        }
    }
}

/// Acknowledged writes, and "write then wait for one response" on top of a
/// raw byte stream.
///
/// Only one wait may be outstanding at a time; each wait uses a fresh
/// [`ResponseParser`] that is thrown away once it completes. Bytes read past
/// the end of a response are kept for whoever reads next.
pub struct Transport<S> {
    stream: S,
    backlog: Vec<u8>,
    read_buf: Vec<u8>,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            backlog: Vec::new(),
            read_buf: vec![0; READ_CHUNK],
        }
    }

    /// Resolves once the stream has taken all of `bytes`.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        debug!("writing {} bytes: {:x?}", bytes.len(), &bytes[..bytes.len().min(32)]);
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write `request` and return the next complete frame.
    ///
    /// If the stream ends first, any partial frame comes back inside
    /// [`TransportError::Truncated`], never as a response.
    pub async fn query(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.write(request).await?;
        self.wait_for(ResponseParser::message()).await
    }

    /// Write `request` and return exactly the next `len` bytes.
    pub async fn write_and_wait_for_bytes(
        &mut self,
        request: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.write(request).await?;
        self.wait_for(ResponseParser::fixed_length(len)).await
    }

    /// Write `request` and return everything up to and including `delimiter`.
    pub async fn write_and_wait_for_delimiter(
        &mut self,
        request: &[u8],
        delimiter: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.write(request).await?;
        self.wait_for(ResponseParser::delimiter(delimiter)).await
    }

    pub async fn wait_for(&mut self, mut parser: ResponseParser) -> Result<Vec<u8>, TransportError> {
        let mut chunk = std::mem::take(&mut self.backlog);
        loop {
            if let ParseResult::Ready { unit, rest } = parser.feed(&chunk) {
                trace!("response complete, {} bytes left over", rest.len());
                self.backlog = rest;
                return Ok(unit);
            }
            chunk = match self.read_stream().await {
                Ok(chunk) => chunk,
                Err(TransportError::Closed) => return Err(parser.finish()),
                Err(e) => return Err(e),
            };
        }
    }

    /// Next bytes not claimed by any wait: left-overs first, then the stream.
    ///
    /// Cancel safe; nothing is lost if the future is dropped before it
    /// resolves.
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.backlog.is_empty() {
            return Ok(std::mem::take(&mut self.backlog));
        }
        self.read_stream().await
    }

    async fn read_stream(&mut self) -> Result<Vec<u8>, TransportError> {
        let n = self.stream.read(&mut self.read_buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        trace!("read {n} bytes");
        Ok(self.read_buf[..n].to_vec())
    }
}
