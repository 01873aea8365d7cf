use std::{
    io,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

/// A serial device opened as a file, with separate handles for each
/// direction.
///
/// A single tokio `File` runs one operation at a time, so a read parked on
/// a silent radio would hold up the request meant to wake it.
pub struct SerialPort {
    reader: Compat<tokio::fs::File>,
    writer: Compat<tokio::fs::File>,
}

impl SerialPort {
    /// The line itself (115200 baud, raw) has to be set up beforehand,
    /// e.g. `stty -F /dev/ttyUSB0 115200 raw -echo`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let writer = file.try_clone()?;
        Ok(Self {
            reader: tokio::fs::File::from_std(file).compat(),
            writer: tokio::fs::File::from_std(writer).compat(),
        })
    }
}

impl AsyncRead for SerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_close(cx)
    }
}
