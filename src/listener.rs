//! Newline-delimited TCP/TLS front-end.
//!
//! Each accepted stream gets its own task running `run_receive_loop`; a
//! `LineDecoder` turns the drawn bytes into text messages for the router, and
//! outgoing payloads are written one per line.

use crate::config::TlsConfig;
use crate::error::ChatError;
use crate::handlers::{close_connection, open_connection, ClientSender};
use crate::receive::{
    run_receive_loop, CloseStatus, LoopExit, LoopHandler, StreamTransport, TransportMode,
};
use crate::router::route_message;
use crate::state::{AppState, ConnectionId};
use crate::Sender;
use async_trait::async_trait;
use std::future::Future;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest accepted line, in bytes. Longer input is discarded up to the next newline.
pub const MAX_LINE: usize = 8192;

/// A TLS client that has not finished its handshake by then is dropped.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept`, so a persistent error (e.g. out of file descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Writes each payload as one `\n`-terminated line.
#[derive(derive_more::Debug)]
pub struct LineSender {
    #[debug(skip)]
    writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
}

impl LineSender {
    pub fn new(writer: impl AsyncWrite + Send + Sync + Unpin + 'static) -> Self {
        LineSender {
            writer: Box::new(writer),
        }
    }
}

#[async_trait]
impl Sender for LineSender {
    async fn send(&mut self, payload: String) -> Result<(), ChatError> {
        debug!("Sending line: {}", payload);
        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Splits a byte stream into `\n`-terminated text lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completes, terminator included.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for piece in chunk.split_inclusive(|b| *b == b'\n') {
            let complete = piece.last() == Some(&b'\n');
            if self.discarding {
                self.discarding = !complete;
                continue;
            }
            self.pending.extend_from_slice(piece);
            if self.pending.len() > MAX_LINE {
                warn!("Discarding line longer than {} bytes", MAX_LINE);
                self.pending.clear();
                self.discarding = !complete;
                continue;
            }
            if complete {
                lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                self.pending.clear();
            }
        }
        lines
    }

    /// Bytes of an unfinished line.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Routes decoded lines for one connection and marks it closing on a terminal event.
struct LineSession<S: Sender> {
    id: ConnectionId,
    state: AppState<S>,
    decoder: LineDecoder,
}

#[async_trait]
impl<S: Sender + 'static> LoopHandler for LineSession<S> {
    async fn on_data(&mut self, chunk: &[u8]) {
        for line in self.decoder.push(chunk) {
            route_message(&self.state, &self.id, &line).await;
        }
    }

    async fn on_close(&mut self, status: CloseStatus, reason: &str) {
        info!("{} ({}): {:?}", reason, self.id, status);
        if self.decoder.pending() > 0 {
            debug!(
                "Dropping {} bytes of unterminated input from {}",
                self.decoder.pending(),
                self.id
            );
        }
        self.state.registry.begin_close(&self.id).await;
    }

    async fn on_error(&mut self, reason: &str) {
        warn!("{} on connection {}", reason, self.id);
        self.state.registry.begin_close(&self.id).await;
    }
}

/// Runs one line connection from registration to unregistration.
///
/// # Errors
///
/// Only registration failures are returned; transport problems end the loop
/// and are reported through logging.
pub async fn handle_line_connection<R, W>(
    reader: R,
    writer: W,
    mode: TransportMode,
    state: AppState<ClientSender>,
) -> Result<LoopExit, ChatError>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Sync + Unpin + 'static,
{
    let id = state.registry.next_id();
    open_connection(&state, id, mode, ClientSender::Line(LineSender::new(writer))).await?;

    let mut transport = StreamTransport::new(reader, mode);
    let mut session = LineSession {
        id,
        state: state.clone(),
        decoder: LineDecoder::new(),
    };
    let exit = run_receive_loop(&mut transport, &mut session, &state.shutdown_token()).await;
    debug!("Receive loop for {} ended: {:?}", id, exit);

    close_connection(&state, &id).await;
    Ok(exit)
}

/// Accepts line connections until shutdown. With an acceptor, every stream is TLS.
pub async fn serve_lines(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    state: AppState<ClientSender>,
) {
    let shutdown = state.shutdown_token();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept line connection: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
                continue;
            }
        };
        info!("New line connection at {}", addr);

        let state = state.clone();
        let tls = tls.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => {
                    let handshake = acceptor.accept(stream);
                    match bounded_handshake(handshake, TLS_HANDSHAKE_TIMEOUT, &shutdown).await {
                        Ok(Some(tls_stream)) => {
                            let (reader, writer) = tokio::io::split(tls_stream);
                            handle_line_connection(reader, writer, TransportMode::Encrypted, state)
                                .await
                        }
                        Ok(None) => {
                            debug!("Abandoning TLS handshake with {} on shutdown", addr);
                            return;
                        }
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", addr, e);
                            return;
                        }
                    }
                }
                None => {
                    let (reader, writer) = stream.into_split();
                    handle_line_connection(reader, writer, TransportMode::Plaintext, state).await
                }
            };
            if let Err(e) = result {
                error!("Line connection from {} failed: {}", addr, e);
            }
        });
    }
    info!("Line listener stopped");
}

/// Awaits `handshake` for at most `limit`. Returns `Ok(None)` if shutdown begins first.
async fn bounded_handshake<T>(
    handshake: impl Future<Output = io::Result<T>>,
    limit: Duration,
    shutdown: &CancellationToken,
) -> io::Result<Option<T>> {
    tokio::select! {
        _ = shutdown.cancelled() => Ok(None),
        finished = tokio::time::timeout(limit, handshake) => match finished {
            Ok(result) => result.map(Some),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no handshake within {:?}", limit),
            )),
        },
    }
}

/// Loads the PEM certificate chain and private key into a `TlsAcceptor`.
pub fn load_tls(config: &TlsConfig) -> Result<TlsAcceptor, ChatError> {
    let cert_file = std::fs::File::open(&config.cert_path)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(ChatError::Tls(format!(
            "no certificates found in {}",
            config.cert_path.display()
        )));
    }

    let key_file = std::fs::File::open(&config.key_path)?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))?.ok_or_else(|| {
        ChatError::Tls(format!(
            "no private key found in {}",
            config.key_path.display()
        ))
    })?;

    let tls_config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_joins_split_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"/nick Al").is_empty());
        assert_eq!(decoder.pending(), 8);
        assert_eq!(decoder.push(b"ice\r\nhel"), vec!["/nick Alice\r\n"]);
        assert_eq!(decoder.push(b"lo\nbye\n"), vec!["hello\n", "bye\n"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_discards_overlong_lines() {
        let mut decoder = LineDecoder::new();
        let long = vec![b'x'; MAX_LINE + 1];
        assert!(decoder.push(&long).is_empty());
        assert!(decoder.push(b"still the long line").is_empty());
        assert_eq!(decoder.push(b"\nok\n"), vec!["ok\n"]);
    }

    #[tokio::test]
    async fn silent_handshake_times_out() {
        let shutdown = CancellationToken::new();
        let silent = std::future::pending::<io::Result<()>>();

        let result = bounded_handshake(silent, Duration::from_millis(50), &shutdown).await;

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_handshake() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let silent = std::future::pending::<io::Result<()>>();

        let result = bounded_handshake(silent, TLS_HANDSHAKE_TIMEOUT, &shutdown).await;

        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn completed_handshake_is_passed_through() {
        let shutdown = CancellationToken::new();
        let result =
            bounded_handshake(async { Ok(7u8) }, TLS_HANDSHAKE_TIMEOUT, &shutdown).await;
        assert_eq!(result.unwrap(), Some(7));
    }

    #[test]
    fn missing_tls_files_are_reported() {
        let config = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        assert!(matches!(load_tls(&config), Err(ChatError::Io(_))));
    }
}
