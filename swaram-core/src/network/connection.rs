//! One physical WebSocket connection to the detection server.
//!
//! A [`Connection`] splits the socket into a writer task fed by an
//! unbounded channel and a reader task that hands every text record to a
//! [`LinkHandler`]. Each connection is stamped with the session epoch it
//! was dialed in, so callbacks from a replaced connection can be told
//! apart from the live one.

use std::borrow::Cow;
use std::sync::Weak;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SwaramError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Callbacks ────────────────────────────────────────────────────

/// Why the transport went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The server sent a close frame or the stream ended.
    Remote { code: Option<u16>, reason: String },
    /// Read or write failed at the I/O or framing layer.
    Error(String),
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote {
                code: Some(code),
                reason,
            } => write!(f, "closed by server ({code}): {reason}"),
            Self::Remote { code: None, reason } => write!(f, "closed by server: {reason}"),
            Self::Error(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Receives transport events on the connection's I/O tasks.
///
/// Calls are synchronous and must not block.
pub trait LinkHandler: Send + Sync + 'static {
    /// One decoded-as-UTF-8 record arrived.
    fn on_text(&self, epoch: u64, text: &str);

    /// The transport closed without a local [`Connection::close`].
    fn on_closed(&self, epoch: u64, cause: CloseCause);
}

// ── Dial ─────────────────────────────────────────────────────────

/// Open a WebSocket to `url`, abandoning the attempt after `timeout`.
pub async fn dial(url: &str, timeout: Duration) -> Result<WsStream, SwaramError> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SwaramError::Transport(format!(
            "dial timed out after {timeout:?}"
        ))),
    }
}

// ── Connection ───────────────────────────────────────────────────

/// Handle to a live connection. Owned exclusively by the session.
#[derive(Debug)]
pub struct Connection {
    epoch: u64,
    url: String,
    // Session -> Network
    outbound: mpsc::UnboundedSender<WsMessage>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Take ownership of an open socket and start its I/O tasks.
    pub fn spawn(
        stream: WsStream,
        epoch: u64,
        url: String,
        handler: Weak<dyn LinkHandler>,
    ) -> Self {
        let (mut net_writer, mut net_reader) = stream.split();
        let (outbound, mut network_rx) = mpsc::unbounded_channel::<WsMessage>();
        let shutdown = CancellationToken::new();

        // Writer task: Session -> Network
        let writer_shutdown = shutdown.clone();
        let writer_handler = handler.clone();
        tokio::spawn(async move {
            while let Some(msg) = network_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = net_writer.send(msg).await {
                    if !writer_shutdown.is_cancelled() {
                        writer_shutdown.cancel();
                        if let Some(h) = writer_handler.upgrade() {
                            h.on_closed(epoch, CloseCause::Error(e.to_string()));
                        }
                    }
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = net_writer.close().await;
        });

        // Reader task: Network -> Session
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let cause = loop {
                let next = tokio::select! {
                    _ = reader_shutdown.cancelled() => return,
                    next = net_reader.next() => next,
                };

                let text = match next {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(epoch, "dropping non-UTF-8 binary record");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(f) => CloseCause::Remote {
                                code: Some(u16::from(f.code)),
                                reason: f.reason.into_owned(),
                            },
                            None => CloseCause::Remote {
                                code: None,
                                reason: "no close frame".into(),
                            },
                        };
                    }
                    Some(Ok(_)) => continue, // ping / pong / raw frame
                    Some(Err(e)) => break CloseCause::Error(e.to_string()),
                    None => {
                        break CloseCause::Remote {
                            code: None,
                            reason: "stream ended".into(),
                        };
                    }
                };

                match handler.upgrade() {
                    Some(h) => h.on_text(epoch, &text),
                    None => return,
                }
            };

            if reader_shutdown.is_cancelled() {
                return;
            }
            reader_shutdown.cancel();
            debug!(epoch, %cause, "reader finished");
            if let Some(h) = handler.upgrade() {
                h.on_closed(epoch, cause);
            }
        });

        Self {
            epoch,
            url,
            outbound,
            shutdown,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the connection has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    /// Queue one text record on the writer task without waiting.
    ///
    /// Fails when the connection is already closing; the caller decides
    /// whether to keep the record for a later connection.
    pub fn send_text(&self, text: String) -> Result<(), SwaramError> {
        if self.shutdown.is_cancelled() {
            return Err(SwaramError::Transport("connection is closing".into()));
        }
        self.outbound
            .send(WsMessage::Text(text))
            .map_err(|_| SwaramError::Transport("writer task has exited".into()))
    }

    /// Close with a normal-closure code. No `on_closed` callback follows.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("client disconnect"),
        };
        let _ = self.outbound.send(WsMessage::Close(Some(frame)));
    }
}

#[cfg(test)]
impl Connection {
    /// A connection with no socket behind it. Whatever the session writes
    /// shows up on the returned receiver.
    pub(crate) fn detached(epoch: u64, url: &str) -> (Self, mpsc::UnboundedReceiver<WsMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Self {
            epoch,
            url: url.to_owned(),
            outbound,
            shutdown: CancellationToken::new(),
        };
        (conn, rx)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
