use std::time::Duration;

use futures::{AsyncRead, AsyncWrite};
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    Code, MEMORY_IMAGE_LEN,
    codec::{STX, pack},
    command::{Command, Frequency, ParseFrequencyError, RxMode, build_command},
    payload::{Lcd, ParsePayloadError, Status},
    pending::{Continuation, PendingResponses},
    splitter::MessageSplitter,
    transport::{Transport, TransportError},
};

/// Time the radio needs between entering programming mode and streaming
/// its memory.
const DOWNLOAD_PREPARE_DELAY: Duration = Duration::from_millis(500);

/// Bare byte the radio sends once it is ready to receive an image.
const TRANSFER_READY: u8 = Code::TransferInitiate as u8;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("the session driver is not running")]
    Disconnected,
    #[error("malformed reply: {0}")]
    Payload(#[from] ParsePayloadError),
    #[error(transparent)]
    Frequency(#[from] ParseFrequencyError),
    #[error("memory images are {expected} bytes long, got {got}")]
    InvalidImageLength { expected: usize, got: usize },
}

/// What the driver does with incoming bytes.
///
/// The driver's own control flow enforces this: a transfer runs to
/// completion inside one operation, and the idle splitter is only fed from
/// the main loop between operations. The field records the state for logs
/// and checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Bytes are split into frames and handed to waiting requests.
    Idle,
    /// A memory transfer owns the link; bytes are raw image data or the
    /// ready signal.
    AwaitingBulkTransferReady,
}

enum Op {
    Write {
        frame: Vec<u8>,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Request {
        code: u8,
        frame: Vec<u8>,
        reply: Continuation,
    },
    Download {
        reply: oneshot::Sender<Result<Vec<u8>, TransportError>>,
    },
    Upload {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Handle used to talk to the radio.
///
/// Cheap to clone. Every operation is carried out by the [`SessionDriver`]
/// returned next to it, which has to be polled (awaited or spawned) for
/// anything to happen. Operations are written to the radio in the order they
/// are issued, and a new request may be issued before earlier replies have
/// arrived.
///
/// Nothing here times out. A reply that never arrives, or arrives corrupted,
/// leaves its caller waiting; wrap calls in `tokio::time::timeout` if that
/// matters.
#[derive(Clone, Debug)]
pub struct Session {
    ops: mpsc::UnboundedSender<Op>,
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write { frame, .. } => write!(f, "Write({frame:x?})"),
            Self::Request { code, .. } => write!(f, "Request(0x{code:x})"),
            Self::Download { .. } => write!(f, "Download"),
            Self::Upload { image, .. } => write!(f, "Upload({} bytes)", image.len()),
        }
    }
}

impl Session {
    pub fn new<S>(stream: S) -> (Self, SessionDriver<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let driver = SessionDriver {
            transport: Transport::new(stream),
            ops: ops_rx,
            inbound: MessageSplitter::new(),
            pending: PendingResponses::new(),
            state: SessionState::Idle,
        };
        (Self { ops: ops_tx }, driver)
    }

    async fn submit<T>(
        &self,
        op: impl FnOnce(oneshot::Sender<Result<T, TransportError>>) -> Op,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(op(tx))
            .map_err(|_| SessionError::Disconnected)?;
        Ok(rx.await.map_err(|_| SessionError::Disconnected)??)
    }

    async fn write(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.submit(|ack| Op::Write { frame, ack }).await
    }

    async fn query(&self, code: u8, frame: Vec<u8>) -> Result<Vec<u8>, SessionError> {
        self.submit(|reply| Op::Request { code, frame, reply }).await
    }

    /// Write an arbitrary command without waiting for a reply.
    pub async fn write_command(&self, code: u8, data: &[u8]) -> Result<(), SessionError> {
        let mut payload = vec![code];
        payload.extend_from_slice(data);
        self.write(pack(&payload)).await
    }

    /// Write an arbitrary command and return the raw frame of the next reply
    /// carrying the same code.
    pub async fn request(&self, code: u8, data: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut payload = vec![code];
        payload.extend_from_slice(data);
        self.query(code, pack(&payload)).await
    }

    /// Emulate a key press.
    pub async fn send_key(&self, key: u8) -> Result<(), SessionError> {
        self.write(build_command(&Command::SendKey { key })).await
    }

    /// Tune to `frequency`, given in MHz (e.g. "162.55").
    pub async fn tune(&self, frequency: &str, rx_mode: RxMode) -> Result<(), SessionError> {
        let frequency: Frequency = frequency.parse()?;
        self.write(build_command(&Command::Tune { frequency, rx_mode }))
            .await
    }

    pub async fn get_lcd(&self) -> Result<Lcd, SessionError> {
        let reply = self
            .query(Code::GetLcd as u8, build_command(&Command::GetLcd))
            .await?;
        Ok(Lcd::parse(&reply)?)
    }

    pub async fn get_status(&self) -> Result<Status, SessionError> {
        let reply = self
            .query(Code::Status as u8, build_command(&Command::GetStatus))
            .await?;
        Ok(Status::parse(&reply)?)
    }

    /// Read the radio's whole memory image.
    pub async fn download(&self) -> Result<Vec<u8>, SessionError> {
        self.submit(|reply| Op::Download { reply }).await
    }

    /// Replace the radio's memory with `image`, which must be
    /// [`MEMORY_IMAGE_LEN`] bytes long.
    pub async fn upload(&self, image: &[u8]) -> Result<(), SessionError> {
        if image.len() != MEMORY_IMAGE_LEN {
            return Err(SessionError::InvalidImageLength {
                expected: MEMORY_IMAGE_LEN,
                got: image.len(),
            });
        }
        let image = image.to_vec();
        self.submit(|reply| Op::Upload { image, reply }).await
    }
}

/// Owns the link to the radio and carries out what [`Session`] handles ask.
pub struct SessionDriver<S> {
    transport: Transport<S>,
    ops: mpsc::UnboundedReceiver<Op>,
    inbound: MessageSplitter,
    pending: PendingResponses,
    state: SessionState,
}

impl<S> SessionDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run until every [`Session`] handle is dropped or the stream ends.
    ///
    /// Fails only if reading from the stream fails; write errors go to the
    /// operation that caused them.
    pub async fn run(mut self) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                biased;

                op = self.ops.recv() => {
                    let Some(op) = op else {
                        debug!("all session handles dropped");
                        return Ok(());
                    };
                    debug!("handling {op:?}");
                    self.handle(op).await;
                }

                chunk = self.transport.read_chunk() => match chunk {
                    Ok(chunk) => self.receive(&chunk),
                    Err(TransportError::Closed) => {
                        self.finish();
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    async fn handle(&mut self, op: Op) {
        match op {
            Op::Write { frame, ack } => {
                let _ = ack.send(self.transport.write(&frame).await);
            }

            Op::Request { code, frame, reply } => match self.transport.write(&frame).await {
                Ok(()) => self.pending.queue_for_response(code, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Op::Download { reply } => {
                self.enter(SessionState::AwaitingBulkTransferReady);
                let image = self.download_image().await;
                self.enter(SessionState::Idle);
                let _ = reply.send(image);
            }

            Op::Upload { image, reply } => {
                self.enter(SessionState::AwaitingBulkTransferReady);
                let done = self.upload_image(&image).await;
                self.enter(SessionState::Idle);
                let _ = reply.send(done);
            }
        }
    }

    fn enter(&mut self, state: SessionState) {
        debug!("session state {:?} -> {state:?}", self.state);
        self.state = state;
    }

    async fn download_image(&mut self) -> Result<Vec<u8>, TransportError> {
        info!("starting memory download");
        self.transport
            .write(&build_command(&Command::DownloadRequest))
            .await?;
        self.transport
            .write(&build_command(&Command::PrepareDownload))
            .await?;
        tokio::time::sleep(DOWNLOAD_PREPARE_DELAY).await;
        let image = self
            .transport
            .write_and_wait_for_bytes(&build_command(&Command::TransferInitiate), MEMORY_IMAGE_LEN)
            .await?;
        info!("memory download complete");
        Ok(image)
    }

    async fn upload_image(&mut self, image: &[u8]) -> Result<(), TransportError> {
        info!("starting memory upload");
        self.transport
            .write_and_wait_for_delimiter(&build_command(&Command::PrepareUpload), &[TRANSFER_READY])
            .await?;
        debug!("radio ready for the image");
        self.transport.write(image).await?;
        info!("memory upload complete");
        Ok(())
    }

    fn receive(&mut self, chunk: &[u8]) {
        debug_assert_eq!(self.state, SessionState::Idle);
        trace!("received {} bytes", chunk.len());
        for message in self.inbound.ingest(chunk) {
            self.pending.dispatch(message);
        }
    }

    fn finish(&mut self) {
        let tail = self.inbound.flush();
        if tail.len() >= 2 && tail[0] == STX {
            warn!("stream ended inside a frame ({} bytes)", tail.len());
            let code = tail[1];
            self.pending.reject(code, TransportError::Truncated(tail));
        } else if !tail.is_empty() {
            debug!("discarding {} bytes at end of stream", tail.len());
        }
        debug!("stream closed");
    }
}

#[cfg(test)]
mod test {
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream},
        time::Instant,
    };
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

    use super::*;

    const STATUS_REQUEST: [u8; 4] = [0x02, 0x41, 0x03, 0x44];
    const LCD_REQUEST: [u8; 4] = [0x02, 0x4c, 0x03, 0x4f];
    const STATUS_REPLY: [u8; 20] = [
        0x02, 0x41, 0x00, 0x00, 0xf4, 0x01, 0x42, 0x02, 0xb9, 0x01, 0x70, 0xdd, 0xb1, 0xf8, 0xad,
        0xc9, 0x08, 0x01, 0x03, 0xac,
    ];

    fn connect() -> (Session, SessionDriver<Compat<DuplexStream>>, DuplexStream) {
        let (host, device) = tokio::io::duplex(1 << 17);
        let (session, driver) = Session::new(host.compat());
        (session, driver, device)
    }

    async fn read_bytes(device: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        device.read_exact(&mut buf).await.unwrap();
        buf
    }

    fn lcd_reply(row: &[u8; 16]) -> Vec<u8> {
        let mut payload = vec![Code::GetLcd as u8];
        for _ in 0..4 {
            payload.extend_from_slice(row);
        }
        payload.extend_from_slice(&[0x00, 0x00]);
        pack(&payload)
    }

    fn image() -> Vec<u8> {
        (0..MEMORY_IMAGE_LEN).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn send_key() {
        let (session, driver, mut device) = connect();
        let client = async move {
            session.send_key(0x20).await.unwrap();
        };
        let (_, result) = tokio::join!(client, driver.run());
        result.unwrap();
        assert_eq!(read_bytes(&mut device, 5).await, [0x02, 0x4b, 0x20, 0x03, 0x6e]);
    }

    #[tokio::test]
    async fn tune() {
        let (session, driver, mut device) = connect();
        let client = async move {
            session.tune("123.456", RxMode::Fm).await.unwrap();
            let err = session.tune("12x", RxMode::Fm).await.unwrap_err();
            assert!(matches!(err, SessionError::Frequency(_)), "{err}");
        };
        let (_, result) = tokio::join!(client, driver.run());
        result.unwrap();
        let frame = read_bytes(&mut device, 9).await;
        assert_eq!(frame[..2], [0x02, 0x54]);
        assert_eq!(frame[2..7], [0x00, 0xca, 0x5b, 0x07, 0x01]);
        assert_eq!(frame[7], 0x03);
    }

    #[tokio::test]
    async fn get_lcd() {
        let (session, driver, mut device) = connect();
        let client = async move { session.get_lcd().await.unwrap() };
        let radio = async move {
            assert_eq!(read_bytes(&mut device, 4).await, LCD_REQUEST);
            device.write_all(&lcd_reply(b"PRIORITY SCAN   ")).await.unwrap();
            device
        };
        let (lcd, result, _device) = tokio::join!(client, driver.run(), radio);
        result.unwrap();
        assert_eq!(lcd.rows[0], "PRIORITY SCAN   ");
    }

    #[tokio::test]
    async fn overlapping_requests_get_their_own_replies() {
        let (session, driver, mut device) = connect();
        let client = async move {
            tokio::join!(session.get_lcd(), session.get_status(), session.get_lcd())
        };
        let radio = async move {
            let requests = read_bytes(&mut device, 12).await;
            assert_eq!(requests, [LCD_REQUEST, STATUS_REQUEST, LCD_REQUEST].concat());
            let replies = [
                &[0xff, 0x00][..],
                &STATUS_REPLY[..],
                &lcd_reply(b"first           ")[..],
                &lcd_reply(b"second          ")[..],
            ]
            .concat();
            for chunk in replies.chunks(7) {
                device.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            device
        };
        let ((first, status, second), result, _device) =
            tokio::join!(client, driver.run(), radio);
        result.unwrap();
        assert_eq!(first.unwrap().rows[0], "first           ");
        assert_eq!(second.unwrap().rows[0], "second          ");
        assert_eq!(status.unwrap().frequency.to_string(), "147.435");
    }

    #[tokio::test]
    async fn unrequested_reply_is_dropped() {
        let (session, driver, mut device) = connect();
        let client = async move { session.get_status().await.unwrap() };
        let radio = async move {
            device.write_all(&lcd_reply(b"nobody asked    ")).await.unwrap();
            assert_eq!(read_bytes(&mut device, 4).await, STATUS_REQUEST);
            device.write_all(&STATUS_REPLY).await.unwrap();
            device
        };
        let (status, result, _device) = tokio::join!(client, driver.run(), radio);
        result.unwrap();
        assert_eq!(status.rssi, 578);
    }

    #[tokio::test]
    async fn generic_request() {
        let (session, driver, mut device) = connect();
        let client = async move { session.request(0x41, &[]).await.unwrap() };
        let radio = async move {
            assert_eq!(read_bytes(&mut device, 4).await, STATUS_REQUEST);
            device.write_all(&STATUS_REPLY).await.unwrap();
            device
        };
        let (reply, result, _device) = tokio::join!(client, driver.run(), radio);
        result.unwrap();
        assert_eq!(reply, STATUS_REPLY);
    }

    #[tokio::test(start_paused = true)]
    async fn download() {
        let (session, driver, mut device) = connect();
        let client = async move {
            let image = session.download().await.unwrap();
            // normal framing resumes after the transfer
            let status = session.get_status().await.unwrap();
            (image, status)
        };
        let radio = async move {
            assert_eq!(read_bytes(&mut device, 5).await, [0x02, 0x43, 0x00, 0x03, 0x46]);
            assert_eq!(read_bytes(&mut device, 5).await, [0x02, 0x50, 0x01, 0x03, 0x54]);
            let prepared = Instant::now();
            assert_eq!(read_bytes(&mut device, 4).await, [0x02, 0x45, 0x03, 0x48]);
            assert!(prepared.elapsed() >= DOWNLOAD_PREPARE_DELAY);

            let image = image();
            for chunk in image.chunks(5000) {
                device.write_all(chunk).await.unwrap();
            }
            assert_eq!(read_bytes(&mut device, 4).await, STATUS_REQUEST);
            device.write_all(&STATUS_REPLY).await.unwrap();
            device
        };
        let ((got, status), result, _device) = tokio::join!(client, driver.run(), radio);
        result.unwrap();
        assert_eq!(got.len(), MEMORY_IMAGE_LEN);
        assert_eq!(got, image());
        assert_eq!(status.zm, 441);
    }

    #[tokio::test(start_paused = true)]
    async fn short_download_fails_when_the_stream_ends() {
        let (session, driver, mut device) = connect();
        let client = async move { session.download().await };
        let radio = async move {
            read_bytes(&mut device, 14).await;
            device.write_all(&image()[..1000]).await.unwrap();
            device.shutdown().await.unwrap();
            device
        };
        let (got, result, _device) = tokio::join!(client, driver.run(), radio);
        result.unwrap();
        let err = got.unwrap_err();
        assert!(
            matches!(err, SessionError::Transport(TransportError::Closed)),
            "{err}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn upload_waits_for_ready_signal() {
        let (session, driver, mut device) = connect();
        let client = async move { session.upload(&image()).await };
        let radio = async move {
            assert_eq!(read_bytes(&mut device, 5).await, [0x02, 0x50, 0x03, 0x03, 0x56]);
            let mut byte = [0u8; 1];
            let early =
                tokio::time::timeout(Duration::from_millis(100), device.read(&mut byte)).await;
            assert!(early.is_err(), "image sent before the radio was ready");

            device.write_all(&[TRANSFER_READY]).await.unwrap();
            assert_eq!(read_bytes(&mut device, MEMORY_IMAGE_LEN).await, image());
            device
        };
        let (done, result, _device) = tokio::join!(client, driver.run(), radio);
        result.unwrap();
        done.unwrap();
    }

    #[tokio::test]
    async fn upload_rejects_wrong_length() {
        let (session, _driver, _device) = connect();
        let err = session.upload(&[0; 10]).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidImageLength {
                expected: MEMORY_IMAGE_LEN,
                got: 10
            }
        ));
    }

    #[tokio::test]
    async fn no_driver() {
        let (session, driver, _device) = connect();
        drop(driver);
        let err = session.get_status().await.unwrap_err();
        assert!(matches!(err, SessionError::Disconnected));
    }

    #[tokio::test]
    async fn write_failure_reaches_the_caller() {
        let (session, driver, device) = connect();
        drop(device);
        let client = async move { session.send_key(1).await };
        let (sent, result) = tokio::join!(client, driver.run());
        result.unwrap();
        assert!(matches!(
            sent.unwrap_err(),
            SessionError::Transport(TransportError::Io(_))
        ));
    }

    async fn reply_cut_short(tail: &[u8]) -> Result<Status, SessionError> {
        let (session, driver, mut device) = connect();
        let client = async move { session.get_status().await };
        let radio = async move {
            assert_eq!(read_bytes(&mut device, 4).await, STATUS_REQUEST);
            device.write_all(tail).await.unwrap();
            device.shutdown().await.unwrap();
            device
        };
        let (status, result, _device) = tokio::join!(client, driver.run(), radio);
        result.unwrap();
        status
    }

    #[tokio::test]
    async fn truncated_reply_at_stream_end() {
        for len in [10, 18, 19] {
            let err = reply_cut_short(&STATUS_REPLY[..len]).await.unwrap_err();
            assert!(
                matches!(
                    &err,
                    SessionError::Transport(TransportError::Truncated(tail)) if tail.len() == len
                ),
                "{len} bytes: {err}"
            );
        }
    }

    #[tokio::test]
    async fn reply_with_bad_sum_is_never_decoded() {
        let mut corrupt = STATUS_REPLY;
        corrupt[19] = 0x00;
        let err = reply_cut_short(&corrupt).await.unwrap_err();
        assert!(
            matches!(err, SessionError::Transport(TransportError::Truncated(_))),
            "{err}"
        );
    }

    #[tokio::test]
    async fn stream_end_without_a_frame_disconnects_waiters() {
        let err = reply_cut_short(&[0xff, 0x00]).await.unwrap_err();
        assert!(matches!(err, SessionError::Disconnected), "{err}");
    }
}
