//! In-process transport for tests and local development.
//!
//! [`LoopbackTransport`] hands out sessions that record every send and
//! expose a control surface for injecting lifecycle events, so the
//! manager can be driven through pairing, open, close and credential
//! rotation without a real messaging network.
//!
//! # Example
//!
//! ```ignore
//! let transport = Arc::new(LoopbackTransport::new());
//! let manager = ConnectionManager::builder()
//!     .transport(transport.clone())
//!     .build()?;
//!
//! manager.start().await?;
//! transport.open();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::RecipientId;
use crate::protocol::{CloseReason, Credentials, TransportEvent};

use super::{Connected, Session, Transport};

// ============================================================================
// SentMessage
// ============================================================================

/// A message accepted by a loopback session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Index of the session (connect order, starting at 0).
    pub session: usize,
    /// Recipient.
    pub recipient: RecipientId,
    /// Message body.
    pub text: String,
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Default)]
struct LoopbackState {
    /// Every session ever created, in connect order.
    sessions: Vec<Arc<LoopbackSession>>,
    /// Credentials presented at each connect.
    presented: Vec<Option<Credentials>>,
    /// Remaining connects to refuse.
    refuse_connects: usize,
    /// Remaining sends to fail.
    fail_sends: usize,
    /// All accepted messages.
    sent: Vec<SentMessage>,
}

// ============================================================================
// LoopbackTransport
// ============================================================================

/// Scriptable in-process [`Transport`].
///
/// Control methods act on the most recently connected session.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransport {
    /// Creates a transport with no sessions.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses the next `count` connect attempts.
    pub fn refuse_next_connects(&self, count: usize) {
        self.state.lock().refuse_connects = count;
    }

    /// Fails the next `count` sends on any session.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().fail_sends = count;
    }

    /// Emits an event on the latest session.
    ///
    /// Returns `false` if there is no session or its stream is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let session = self.state.lock().sessions.last().cloned();
        match session {
            Some(session) => session.events_tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Emits [`TransportEvent::Open`].
    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Open)
    }

    /// Emits a transient [`TransportEvent::Close`].
    pub fn drop_connection(&self, message: &str) -> bool {
        self.emit(TransportEvent::Close(CloseReason::transient(message)))
    }

    /// Emits a terminal [`TransportEvent::Close`].
    pub fn log_out(&self) -> bool {
        self.emit(TransportEvent::Close(CloseReason::LoggedOut {
            message: "logged out".into(),
        }))
    }

    /// Emits a [`TransportEvent::PairingChallenge`].
    pub fn challenge(&self, payload: &str) -> bool {
        self.emit(TransportEvent::PairingChallenge {
            payload: payload.into(),
        })
    }

    /// Emits a [`TransportEvent::CredentialsUpdated`].
    pub fn rotate_credentials(&self, credentials: Credentials) -> bool {
        self.emit(TransportEvent::CredentialsUpdated(credentials))
    }

    /// Returns the number of sessions created.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Returns the number of sessions not yet ended.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|s| !s.ended.load(Ordering::SeqCst))
            .count()
    }

    /// Returns the credentials presented at each connect.
    #[must_use]
    pub fn presented_credentials(&self) -> Vec<Option<Credentials>> {
        self.state.lock().presented.clone()
    }

    /// Returns every accepted message in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    /// Returns accepted message bodies in send order.
    #[must_use]
    pub fn sent_texts(&self) -> Vec<String> {
        self.state.lock().sent.iter().map(|m| m.text.clone()).collect()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Connected> {
        let mut state = self.state.lock();
        state.presented.push(credentials);

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            debug!(remaining = state.refuse_connects, "Loopback refusing connect");
            return Err(Error::connection("loopback connect refused"));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(LoopbackSession {
            index: state.sessions.len(),
            events_tx,
            ended: AtomicBool::new(false),
            shared: Arc::downgrade(&self.state),
        });
        state.sessions.push(Arc::clone(&session));

        debug!(index = session.index, "Loopback session created");

        let events = stream::unfold(events_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();

        Ok(Connected { session, events })
    }
}

// ============================================================================
// LoopbackSession
// ============================================================================

struct LoopbackSession {
    index: usize,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    ended: AtomicBool,
    shared: Weak<Mutex<LoopbackState>>,
}

#[async_trait]
impl Session for LoopbackSession {
    async fn send_text(&self, recipient: &RecipientId, text: &str) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let shared = self.shared.upgrade().ok_or(Error::ConnectionClosed)?;
        {
            let mut state = shared.lock();
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                return Err(Error::connection("loopback send rejected"));
            }
            state.sent.push(SentMessage {
                session: self.index,
                recipient: recipient.clone(),
                text: text.to_string(),
            });
        }

        trace!(index = self.index, %recipient, "Loopback send accepted");
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        if !self.ended.swap(true, Ordering::SeqCst) {
            debug!(index = self.index, "Loopback session ended");
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> RecipientId {
        RecipientId::parse("15551234567").expect("valid recipient")
    }

    #[tokio::test]
    async fn test_events_reach_stream() {
        let transport = LoopbackTransport::new();
        let mut connected = transport.connect(None).await.expect("connect");

        assert!(transport.challenge("qr-1"));
        assert!(transport.open());

        assert_eq!(
            connected.events.next().await,
            Some(TransportEvent::PairingChallenge {
                payload: "qr-1".into()
            })
        );
        assert_eq!(connected.events.next().await, Some(TransportEvent::Open));
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let transport = LoopbackTransport::new();
        transport.refuse_next_connects(1);

        assert!(transport.connect(None).await.is_err());
        assert!(transport.connect(None).await.is_ok());
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(transport.presented_credentials().len(), 2);
    }

    #[tokio::test]
    async fn test_send_failures_and_end() {
        let transport = LoopbackTransport::new();
        let connected = transport.connect(None).await.expect("connect");
        transport.fail_next_sends(1);

        assert!(connected.session.send_text(&recipient(), "a").await.is_err());
        connected
            .session
            .send_text(&recipient(), "b")
            .await
            .expect("send");
        assert_eq!(transport.sent_texts(), vec!["b".to_string()]);

        connected.session.end().await.expect("end");
        assert_eq!(transport.live_sessions(), 0);
        assert!(matches!(
            connected.session.send_text(&recipient(), "c").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_emit_without_session() {
        assert!(!LoopbackTransport::new().open());
    }
}
