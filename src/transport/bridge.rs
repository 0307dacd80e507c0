//! WebSocket bridge transport.
//!
//! Talks JSON over WebSocket to a bridge process that owns the actual
//! messaging session. One WebSocket connection backs one session handle.
//!
//! # Event Loop
//!
//! Each connection spawns a tokio task that handles:
//!
//! - Incoming frames from the bridge (responses, events)
//! - Outgoing commands from the session handle
//! - Request/response correlation by UUID
//! - Forwarding parsed [`TransportEvent`]s to the handle's event stream
//!
//! When the socket ends without the bridge reporting a close, a transient
//! [`TransportEvent::Close`] is synthesized so the manager reconnects.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, SplitSink};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{from_str, to_string};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::{RecipientId, RequestId};
use crate::protocol::{
    BridgeCommand, BridgeEvent, CloseReason, Credentials, Request, Response, TransportEvent,
};

use super::{Connected, Session, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for bridge requests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the `session.end` request during teardown.
const END_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum pending requests before rejecting new ones.
const MAX_PENDING_REQUESTS: usize = 100;

/// Default suffix appended to recipient digits to form a transport address.
const DEFAULT_ADDRESS_SUFFIX: &str = "@s.whatsapp.net";

// ============================================================================
// Types
// ============================================================================

/// Map of request IDs to response channels.
type CorrelationMap = FxHashMap<RequestId, oneshot::Sender<Result<Response>>>;

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Send a request and wait for response.
    Send {
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
    },
    /// Remove a timed-out correlation entry.
    RemoveCorrelation(RequestId),
    /// Close the socket.
    Shutdown,
}

// ============================================================================
// BridgeTransportBuilder
// ============================================================================

/// Builder for [`BridgeTransport`].
#[derive(Debug, Clone)]
pub struct BridgeTransportBuilder {
    url: Option<String>,
    address_suffix: String,
    request_timeout: Duration,
}

impl Default for BridgeTransportBuilder {
    fn default() -> Self {
        Self {
            url: None,
            address_suffix: DEFAULT_ADDRESS_SUFFIX.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl BridgeTransportBuilder {
    /// Sets the bridge WebSocket URL (`ws://` or `wss://`).
    #[inline]
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the suffix appended to recipient digits.
    #[inline]
    #[must_use]
    pub fn address_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.address_suffix = suffix.into();
        self
    }

    /// Sets the per-request timeout. Also bounds the WebSocket handshake.
    #[inline]
    #[must_use]
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL is missing, malformed, or not `ws`/`wss`
    /// - [`Error::Config`] if the request timeout is zero
    pub fn build(self) -> Result<BridgeTransport> {
        let raw = self.url.ok_or_else(|| {
            Error::config(
                "Bridge URL is required. Use .url() to set it.\n\
                 Example: BridgeTransport::builder().url(\"ws://127.0.0.1:8787\")",
            )
        })?;

        let url = Url::parse(&raw)
            .map_err(|e| Error::config(format!("Invalid bridge URL {raw:?}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Bridge URL must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::config("Bridge request timeout must be non-zero"));
        }

        Ok(BridgeTransport {
            url,
            address_suffix: self.address_suffix,
            request_timeout: self.request_timeout,
        })
    }
}

// ============================================================================
// BridgeTransport
// ============================================================================

/// [`Transport`] backed by a bridge process over WebSocket.
#[derive(Debug, Clone)]
pub struct BridgeTransport {
    url: Url,
    address_suffix: String,
    request_timeout: Duration,
}

impl BridgeTransport {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> BridgeTransportBuilder {
        BridgeTransportBuilder::default()
    }

    /// Returns the bridge URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Connected> {
        let handshake = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws_stream, _) = timeout(self.request_timeout, handshake)
            .await
            .map_err(|_| Error::connection_timeout(self.request_timeout.as_millis() as u64))??;

        info!(url = %self.url, "Bridge WebSocket established");

        let (connection, events_rx) = BridgeConnection::new(ws_stream);

        let command = BridgeCommand::Connect {
            credentials: credentials.as_ref().map(Credentials::to_base64),
        };
        if let Err(e) = connection
            .send_with_timeout(Request::new(command), self.request_timeout)
            .await
            .and_then(Response::into_result)
        {
            connection.shutdown();
            return Err(e);
        }

        let session = Arc::new(BridgeSession {
            connection,
            address_suffix: self.address_suffix.clone(),
            request_timeout: self.request_timeout,
        });

        let events = stream::unfold(events_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();

        Ok(Connected { session, events })
    }
}

// ============================================================================
// BridgeSession
// ============================================================================

/// Session handle backed by one bridge connection.
struct BridgeSession {
    connection: BridgeConnection,
    address_suffix: String,
    request_timeout: Duration,
}

#[async_trait]
impl Session for BridgeSession {
    async fn send_text(&self, recipient: &RecipientId, text: &str) -> Result<()> {
        let command = BridgeCommand::SendText {
            to: format!("{recipient}{}", self.address_suffix),
            text: text.to_string(),
        };

        self.connection
            .send_with_timeout(Request::new(command), self.request_timeout)
            .await?
            .into_result()?;

        trace!(%recipient, "Bridge send acknowledged");
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        let result = self
            .connection
            .send_with_timeout(Request::new(BridgeCommand::End), END_TIMEOUT)
            .await
            .and_then(Response::into_result)
            .map(|_| ());

        self.connection.shutdown();
        result
    }
}

// ============================================================================
// BridgeConnection
// ============================================================================

/// WebSocket connection to a bridge process.
///
/// Handles request/response correlation and event forwarding.
struct BridgeConnection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Correlation map (shared with event loop).
    correlation: Arc<Mutex<CorrelationMap>>,
}

impl BridgeConnection {
    /// Creates a connection from a WebSocket stream.
    ///
    /// Spawns the event loop task and returns the receiving side of the
    /// event channel.
    fn new<S>(ws_stream: WebSocketStream<S>) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));

        tokio::spawn(Self::run_event_loop(
            ws_stream,
            command_rx,
            Arc::clone(&correlation),
            events_tx,
        ));

        (
            Self {
                command_tx,
                correlation,
            },
            events_rx,
        )
    }

    /// Sends a request and waits for response with custom timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if connection is closed
    /// - [`Error::ChannelClosed`] if the event loop dropped the request
    /// - [`Error::RequestTimeout`] if response not received within timeout
    /// - [`Error::Protocol`] if too many pending requests
    async fn send_with_timeout(
        &self,
        request: Request,
        request_timeout: Duration,
    ) -> Result<Response> {
        let request_id = request.id;

        {
            let correlation = self.correlation.lock();
            if correlation.len() >= MAX_PENDING_REQUESTS {
                warn!(
                    pending = correlation.len(),
                    max = MAX_PENDING_REQUESTS,
                    "Too many pending bridge requests"
                );
                return Err(Error::protocol(format!(
                    "Too many pending requests: {}/{}",
                    correlation.len(),
                    MAX_PENDING_REQUESTS
                )));
            }
        }

        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(ConnectionCommand::Send {
                request,
                response_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        match timeout(request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::ChannelClosed(e)),
            Err(_) => {
                let _ = self
                    .command_tx
                    .send(ConnectionCommand::RemoveCorrelation(request_id));

                Err(Error::request_timeout(
                    request_id,
                    request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Closes the socket.
    fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop<S>(
        ws_stream: WebSocketStream<S>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let mut saw_close = false;
        let mut local_shutdown = false;

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            saw_close |= Self::handle_incoming_message(
                                &text,
                                &correlation,
                                &events_tx,
                            );
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("Bridge closed WebSocket");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "Bridge WebSocket error");
                            break;
                        }

                        None => {
                            debug!("Bridge WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send { request, response_tx }) => {
                            Self::handle_send_command(
                                request,
                                response_tx,
                                &mut ws_write,
                                &correlation,
                            ).await;
                        }

                        Some(ConnectionCommand::RemoveCorrelation(request_id)) => {
                            correlation.lock().remove(&request_id);
                            debug!(%request_id, "Removed timed-out correlation");
                        }

                        Some(ConnectionCommand::Shutdown) | None => {
                            debug!("Bridge connection shutting down");
                            local_shutdown = true;
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        Self::fail_pending_requests(&correlation);

        if !saw_close && !local_shutdown {
            let _ = events_tx.send(TransportEvent::Close(CloseReason::transient(
                "bridge connection closed",
            )));
        }

        debug!("Bridge event loop terminated");
    }

    /// Handles an incoming text frame.
    ///
    /// Returns `true` if the frame carried a close event.
    fn handle_incoming_message(
        text: &str,
        correlation: &Arc<Mutex<CorrelationMap>>,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> bool {
        if let Ok(response) = from_str::<Response>(text) {
            let tx = correlation.lock().remove(&response.id);

            if let Some(tx) = tx {
                let _ = tx.send(Ok(response));
            } else {
                warn!(id = %response.id, "Response for unknown request");
            }

            return false;
        }

        if let Ok(event) = from_str::<BridgeEvent>(text) {
            let mut saw_close = false;
            for event in event.into_events() {
                saw_close |= matches!(event, TransportEvent::Close(_));
                let _ = events_tx.send(event);
            }
            return saw_close;
        }

        warn!(text = %text, "Failed to parse bridge frame");
        false
    }

    /// Handles a send command from the session handle.
    async fn handle_send_command<S>(
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
        ws_write: &mut SplitSink<WebSocketStream<S>, Message>,
        correlation: &Arc<Mutex<CorrelationMap>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let request_id = request.id;
        let method = request.command.method();

        let json = match to_string(&request) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(Error::Json(e)));
                return;
            }
        };

        correlation.lock().insert(request_id, response_tx);

        if let Err(e) = ws_write.send(Message::Text(json.into())).await
            && let Some(tx) = correlation.lock().remove(&request_id)
        {
            let _ = tx.send(Err(Error::WebSocket(e)));
        }

        trace!(%request_id, method, "Bridge request sent");
    }

    /// Fails all pending requests with ConnectionClosed error.
    fn fail_pending_requests(correlation: &Arc<Mutex<CorrelationMap>>) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending bridge requests");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
