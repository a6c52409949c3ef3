//! Per-connection receive loop.
//!
//! The loop draws byte chunks from a `Transport` and hands them to a
//! `LoopHandler` until one terminal event: graceful end of stream, a fatal
//! transport error, or server shutdown. Retryable transport conditions
//! (would-block, which covers a TLS session that wants to read or write, and
//! signal interruption) are retried the same way in both transport modes and
//! never reach the handler.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Size of the loop-local read buffer.
pub const READ_CHUNK: usize = 4096;

/// Whether the transport carries an encryption layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Plaintext,
    Encrypted,
}

/// Why a receive loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// The peer ended the stream.
    PeerClosed,
    /// The server asked every connection to stop.
    Shutdown,
}

/// Terminal result of `run_receive_loop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Closed(CloseStatus),
    Failed,
}

/// How a failed draw must be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawFailure {
    /// Not ready yet; repeat the same draw.
    Retryable,
    Fatal,
}

/// Source of raw bytes for one connection.
#[async_trait]
pub trait Transport: Send {
    fn mode(&self) -> TransportMode;

    /// Reads up to `buf.len()` bytes. `Ok(0)` means the peer closed the stream.
    async fn draw(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Receives the outcome of each draw. Calls never overlap for one loop.
#[async_trait]
pub trait LoopHandler: Send {
    /// Bytes for the decoder.
    async fn on_data(&mut self, chunk: &[u8]);

    /// Graceful end; called at most once and never together with `on_error`.
    async fn on_close(&mut self, status: CloseStatus, reason: &str);

    /// Fatal transport error; called at most once and never together with `on_close`.
    async fn on_error(&mut self, reason: &str);
}

/// `Transport` over any tokio byte stream, plain TCP or a TLS session.
#[derive(derive_more::Debug)]
pub struct StreamTransport<R> {
    #[debug(skip)]
    reader: R,
    mode: TransportMode,
}

impl<R> StreamTransport<R> {
    pub fn new(reader: R, mode: TransportMode) -> Self {
        StreamTransport { reader, mode }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Transport for StreamTransport<R> {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    async fn draw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }
}

/// Classifies a draw error. The policy does not depend on the transport mode.
pub fn classify(err: &io::Error) -> DrawFailure {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => DrawFailure::Retryable,
        _ => DrawFailure::Fatal,
    }
}

fn error_reason(mode: TransportMode) -> &'static str {
    match mode {
        TransportMode::Plaintext => "Read error",
        TransportMode::Encrypted => "TLS read error",
    }
}

/// Runs the receive loop for one connection until a terminal event.
pub async fn run_receive_loop<T, H>(
    transport: &mut T,
    handler: &mut H,
    shutdown: &CancellationToken,
) -> LoopExit
where
    T: Transport + ?Sized,
    H: LoopHandler + ?Sized,
{
    let mode = transport.mode();
    let mut buffer = vec![0u8; READ_CHUNK];

    loop {
        let drawn = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Receive loop stopped by shutdown");
                handler.on_close(CloseStatus::Shutdown, "Server shutting down").await;
                return LoopExit::Closed(CloseStatus::Shutdown);
            }
            drawn = transport.draw(&mut buffer) => drawn,
        };

        match drawn {
            Ok(0) => {
                debug!("Peer closed the {:?} stream", mode);
                handler
                    .on_close(CloseStatus::PeerClosed, "Connection closed by peer")
                    .await;
                return LoopExit::Closed(CloseStatus::PeerClosed);
            }
            Ok(n) => handler.on_data(&buffer[..n]).await,
            Err(e) => match classify(&e) {
                DrawFailure::Retryable => {
                    trace!("Retrying {:?} draw after {:?}", mode, e.kind());
                    tokio::task::yield_now().await;
                }
                DrawFailure::Fatal => {
                    warn!("{} on {:?} transport: {}", error_reason(mode), mode, e);
                    handler.on_error(error_reason(mode)).await;
                    return LoopExit::Failed;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Plays back a fixed script of draw outcomes, then stays pending.
    struct ScriptedTransport {
        mode: TransportMode,
        script: VecDeque<io::Result<Vec<u8>>>,
        draws: usize,
    }

    impl ScriptedTransport {
        fn new(mode: TransportMode, script: Vec<io::Result<Vec<u8>>>) -> Self {
            ScriptedTransport {
                mode,
                script: script.into(),
                draws: 0,
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn mode(&self) -> TransportMode {
            self.mode
        }

        async fn draw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.draws += 1;
            match self.script.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Data(Vec<u8>),
        Close(CloseStatus),
        Error(String),
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<Seen>,
    }

    #[async_trait]
    impl LoopHandler for Recorder {
        async fn on_data(&mut self, chunk: &[u8]) {
            self.seen.push(Seen::Data(chunk.to_vec()));
        }

        async fn on_close(&mut self, status: CloseStatus, _reason: &str) {
            self.seen.push(Seen::Close(status));
        }

        async fn on_error(&mut self, reason: &str) {
            self.seen.push(Seen::Error(reason.to_string()));
        }
    }

    fn would_block() -> io::Result<Vec<u8>> {
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    #[tokio::test]
    async fn retries_silently_until_data_arrives() {
        for mode in [TransportMode::Plaintext, TransportMode::Encrypted] {
            let mut transport = ScriptedTransport::new(
                mode,
                vec![
                    would_block(),
                    would_block(),
                    Err(io::Error::from(io::ErrorKind::Interrupted)),
                    would_block(),
                    Ok(b"hello\n".to_vec()),
                    Ok(Vec::new()),
                ],
            );
            let mut recorder = Recorder::default();

            let exit =
                run_receive_loop(&mut transport, &mut recorder, &CancellationToken::new()).await;

            assert_eq!(exit, LoopExit::Closed(CloseStatus::PeerClosed));
            assert_eq!(transport.draws, 6);
            assert_eq!(
                recorder.seen,
                vec![
                    Seen::Data(b"hello\n".to_vec()),
                    Seen::Close(CloseStatus::PeerClosed)
                ]
            );
        }
    }

    #[tokio::test]
    async fn end_of_stream_closes_once_without_error() {
        let mut transport = ScriptedTransport::new(
            TransportMode::Plaintext,
            vec![Ok(Vec::new()), Ok(b"never read".to_vec())],
        );
        let mut recorder = Recorder::default();

        let exit = run_receive_loop(&mut transport, &mut recorder, &CancellationToken::new()).await;

        assert_eq!(exit, LoopExit::Closed(CloseStatus::PeerClosed));
        assert_eq!(recorder.seen, vec![Seen::Close(CloseStatus::PeerClosed)]);
        assert_eq!(transport.draws, 1);
    }

    #[tokio::test]
    async fn fatal_error_reports_once_and_stops_decoding() {
        let mut transport = ScriptedTransport::new(
            TransportMode::Encrypted,
            vec![
                Ok(b"a".to_vec()),
                Err(io::Error::new(io::ErrorKind::InvalidData, "bad record mac")),
                Ok(b"b".to_vec()),
            ],
        );
        let mut recorder = Recorder::default();

        let exit = run_receive_loop(&mut transport, &mut recorder, &CancellationToken::new()).await;

        assert_eq!(exit, LoopExit::Failed);
        assert_eq!(
            recorder.seen,
            vec![
                Seen::Data(b"a".to_vec()),
                Seen::Error("TLS read error".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn reset_connection_is_fatal_in_plaintext() {
        let mut transport = ScriptedTransport::new(
            TransportMode::Plaintext,
            vec![Err(io::Error::from(io::ErrorKind::ConnectionReset))],
        );
        let mut recorder = Recorder::default();

        let exit = run_receive_loop(&mut transport, &mut recorder, &CancellationToken::new()).await;

        assert_eq!(exit, LoopExit::Failed);
        assert_eq!(recorder.seen, vec![Seen::Error("Read error".to_string())]);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_pending_draw() {
        let mut transport = ScriptedTransport::new(TransportMode::Plaintext, vec![]);
        let mut recorder = Recorder::default();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            canceller.cancel();
        });

        let exit = run_receive_loop(&mut transport, &mut recorder, &token).await;

        assert_eq!(exit, LoopExit::Closed(CloseStatus::Shutdown));
        assert_eq!(recorder.seen, vec![Seen::Close(CloseStatus::Shutdown)]);
    }

    #[test]
    fn classification_is_mode_independent() {
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::WouldBlock)),
            DrawFailure::Retryable
        );
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::Interrupted)),
            DrawFailure::Retryable
        );
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::UnexpectedEof)),
            DrawFailure::Fatal
        );
    }
}
