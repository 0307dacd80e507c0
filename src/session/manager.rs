//! Session lifecycle coordinator.
//!
//! [`ConnectionManager`] owns the single live session handle and drives it
//! through connect, pairing, open, close and reconnect. Transport events are
//! forwarded into one channel consumed by a dispatcher task, so state
//! transitions happen in event order. Sends go through [`ConnectionManager::send`],
//! which dispatches when the session is open and queues otherwise.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use session_courier::{ConnectionManager, Delivery, LoopbackTransport};
//!
//! # async fn example() -> session_courier::Result<()> {
//! let transport = LoopbackTransport::new();
//! let manager = ConnectionManager::builder()
//!     .transport(Arc::new(transport.clone()))
//!     .build()?;
//!
//! manager.start().await?;
//! let delivery = manager.send("15551234567", "hello").await?;
//! assert!(delivery.is_queued());
//!
//! transport.open();
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{RecipientId, SessionId};
use crate::protocol::{CloseReason, Credentials, TransportEvent};
use crate::time::{Clock, Timer};
use crate::transport::{Connected, CredentialStore, EventStream, Session, Transport};

use super::builder::ManagerBuilder;
use super::options::ManagerOptions;
use super::outcome::Delivery;
use super::pairing::{ChallengeVerdict, PairingFlow, PairingView};
use super::queue::{OutboundQueue, QueueEntry};
use super::reconnect::{BackoffPolicy, ReconnectScheduler};
use super::state::ConnectionState;
use super::status::{Health, LastError, StatusSnapshot};

// ============================================================================
// Types
// ============================================================================

/// Input to the dispatcher task.
#[derive(Debug)]
enum ManagerEvent {
    /// An event from the handle with generation `session_id`.
    Transport {
        session_id: SessionId,
        event: TransportEvent,
    },
    /// The reconnect timer armed with `delay` fired.
    ReconnectDue { delay: Duration },
    /// Exit after the event in progress.
    Stop,
}

/// The live session handle and its event forwarder.
struct SessionSlot {
    id: SessionId,
    session: Arc<dyn Session>,
    forwarder: JoinHandle<()>,
    /// `end` was already called on the handle.
    ended: bool,
}

/// State guarded by a single lock. Never held across `.await`.
struct Core {
    state: ConnectionState,
    slot: Option<SessionSlot>,
    pairing: PairingFlow,
    last_error: Option<LastError>,
    logged_out: bool,
}

/// Clears the `initializing` flag when dropped.
struct InitGuard<'a>(&'a AtomicBool);

impl<'a> InitGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Internal shared state for the manager.
pub(crate) struct ManagerInner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    timer: Arc<dyn Timer>,
    clock: Arc<dyn Clock>,
    options: ManagerOptions,
    backoff: BackoffPolicy,

    core: Mutex<Core>,
    queue: OutboundQueue,
    scheduler: ReconnectScheduler,

    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,

    started: AtomicBool,
    initializing: AtomicBool,
    closing: AtomicBool,
    draining: AtomicBool,
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Owns the transport session and the outbound queue.
///
/// Cheap to clone; clones share state. Dropping the last clone stops the
/// dispatcher but does not end the session gracefully, so call
/// [`shutdown`](Self::shutdown) first.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("queue_depth", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionManager - Construction
// ============================================================================

impl ConnectionManager {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Assembles the manager and spawns the dispatcher.
    ///
    /// Requires a tokio runtime; [`ManagerBuilder::build`] checks for one.
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        timer: Arc<dyn Timer>,
        clock: Arc<dyn Clock>,
        options: ManagerOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ManagerInner {
            transport,
            store,
            scheduler: ReconnectScheduler::new(Arc::clone(&timer)),
            timer,
            clock,
            backoff: BackoffPolicy::new(options.backoff_factor, options.max_reconnect_delay),
            core: Mutex::new(Core {
                state: ConnectionState::Disconnected,
                slot: None,
                pairing: PairingFlow::new(options.max_pairing_attempts),
                last_error: None,
                logged_out: false,
            }),
            queue: OutboundQueue::new(options.drain_failure_policy),
            options,
            events_tx,
            dispatcher: Mutex::new(None),
            drain_task: Mutex::new(None),
            started: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        });

        let dispatcher = tokio::spawn(run_dispatcher(Arc::downgrade(&inner), events_rx));
        *inner.dispatcher.lock() = Some(dispatcher);

        debug!("Connection manager created");
        Self { inner }
    }
}

// ============================================================================
// ConnectionManager - Lifecycle
// ============================================================================

impl ConnectionManager {
    /// Opens the first session.
    ///
    /// Idempotent: returns `Ok(())` without effect if the manager was
    /// already started, a start is in progress, or the manager was shut
    /// down. On failure a reconnect is scheduled after the start-failure
    /// delay and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the credential store or transport error of the attempt.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;

        if inner.closing.load(Ordering::SeqCst) {
            debug!("Manager is shut down, start ignored");
            return Ok(());
        }

        let Some(guard) = InitGuard::acquire(&inner.initializing) else {
            debug!("Start already in progress");
            return Ok(());
        };

        if inner.started.swap(true, Ordering::SeqCst) {
            debug!("Manager already started");
            return Ok(());
        }

        info!("Starting connection manager");
        let result = inner.open_session().await;
        drop(guard);

        if let Err(ref err) = result {
            let retry = inner.options.start_failure_delay;
            error!(error = %err, retry_ms = retry.as_millis() as u64, "Initial connect failed");
            inner.schedule_reconnect(retry);
        }

        result
    }

    /// Stops the manager.
    ///
    /// Cancels any pending reconnect, stops the dispatcher and ends the
    /// live session. Queued entries are discarded with a warning.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Currently infallible; teardown failures are logged.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;

        if inner.closing.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            return Ok(());
        }

        info!("Shutting down connection manager");
        inner.scheduler.cancel();
        inner.core.lock().state = ConnectionState::Closing;

        // The handler in progress may own a handle outside the slot, so it
        // runs to completion instead of being aborted.
        let dispatcher = inner.dispatcher.lock().take();
        if let Some(task) = dispatcher {
            let _ = inner.events_tx.send(ManagerEvent::Stop);
            if let Err(err) = task.await {
                warn!(error = %err, "Dispatcher task failed");
            }
        }
        if let Some(task) = inner.drain_task.lock().take() {
            task.abort();
        }

        let slot = {
            let mut core = inner.core.lock();
            core.state = ConnectionState::Closing;
            core.slot.take()
        };

        if let Some(slot) = slot {
            teardown(slot).await;
        }

        let undelivered = inner.queue.clear();
        if undelivered > 0 {
            warn!(undelivered, "Discarding queued messages on shutdown");
        }

        info!("Connection manager stopped");
        Ok(())
    }
}

// ============================================================================
// ConnectionManager - Sending
// ============================================================================

impl ConnectionManager {
    /// Sends `text` to `recipient`, or queues it until the session opens.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the recipient is not 10-15 digits or
    ///   the text is empty; nothing is queued
    /// - [`Error::NotInitialized`] if no session handle exists yet (or the
    ///   manager is shut down). A handle ended by pairing exhaustion or
    ///   logout still counts, so sends queue until the next session opens.
    /// - [`Error::DispatchFailed`] if the open session rejected the send;
    ///   the message is not retried
    pub async fn send(&self, recipient: &str, text: &str) -> Result<Delivery> {
        let recipient = RecipientId::parse(recipient)?;
        if text.is_empty() {
            return Err(Error::invalid_argument("message text must not be empty"));
        }

        let inner = &self.inner;
        if inner.closing.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }

        let session = {
            let core = inner.core.lock();
            let Some(slot) = core.slot.as_ref() else {
                return Err(Error::NotInitialized);
            };
            core.state.is_open().then(|| Arc::clone(&slot.session))
        };

        let Some(session) = session else {
            let entry = QueueEntry::new(recipient, text, inner.clock.now());
            let entry_id = entry.id();
            let depth = inner.queue.enqueue(entry);
            info!(%entry_id, depth, "Session not open, message queued");

            // The session may have opened after the state check.
            if inner.open_session_id().is_some() {
                inner.spawn_drain(Duration::ZERO);
            }
            return Ok(Delivery::Queued { entry_id, depth });
        };

        match session.send_text(&recipient, text).await {
            Ok(()) => {
                debug!(%recipient, "Message dispatched");
                Ok(Delivery::Sent)
            }
            Err(err) => {
                warn!(%recipient, error = %err, "Dispatch failed");
                Err(Error::dispatch_failed(err.to_string()))
            }
        }
    }
}

// ============================================================================
// ConnectionManager - Inspection
// ============================================================================

impl ConnectionManager {
    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    /// Returns `true` if sends dispatch immediately.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Point-in-time status. No side effects.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let inner = &self.inner;
        let (state, logged_out, pairing_attempts, last_error) = {
            let core = inner.core.lock();
            (
                core.state,
                core.logged_out,
                core.pairing.attempts(),
                core.last_error.clone(),
            )
        };
        let queue_depth = inner.queue.len();
        let initializing = inner.initializing.load(Ordering::SeqCst);

        StatusSnapshot {
            state,
            health: Health::classify(
                state,
                logged_out,
                initializing,
                queue_depth,
                inner.options.degraded_queue_depth,
            ),
            queue_depth,
            pairing_attempts,
            reconnect_pending: inner.scheduler.is_pending(),
            initializing,
            last_error,
        }
    }

    /// Pairing challenge and attempt count for an operator display.
    #[must_use]
    pub fn pairing(&self) -> PairingView {
        self.inner.core.lock().pairing.view()
    }

    /// The outbound queue.
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    /// Options in effect.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

async fn run_dispatcher(
    inner: Weak<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<ManagerEvent>,
) {
    debug!("Dispatcher started");

    while let Some(event) = rx.recv().await {
        if matches!(event, ManagerEvent::Stop) {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }

    debug!("Dispatcher stopped");
}

/// Copies one handle's events into the dispatcher channel.
async fn forward_events(
    session_id: SessionId,
    mut events: EventStream,
    tx: mpsc::UnboundedSender<ManagerEvent>,
) {
    while let Some(event) = events.next().await {
        if tx.send(ManagerEvent::Transport { session_id, event }).is_err() {
            break;
        }
    }
    trace!(%session_id, "Event stream ended");
}

/// Stops a handle's forwarder and ends the handle unless already ended.
async fn teardown(slot: SessionSlot) {
    slot.forwarder.abort();
    if !slot.ended {
        end_session(slot.id, slot.session.as_ref()).await;
    }
}

async fn end_session(session_id: SessionId, session: &dyn Session) {
    match session.end().await {
        Ok(()) => debug!(%session_id, "Session handle ended"),
        Err(err) => warn!(%session_id, error = %err, "Session teardown failed"),
    }
}

// ============================================================================
// ManagerInner - Event Handling
// ============================================================================

impl ManagerInner {
    async fn handle_event(self: &Arc<Self>, event: ManagerEvent) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        match event {
            ManagerEvent::Transport { session_id, event } => {
                if !self.is_current(session_id) {
                    trace!(%session_id, ?event, "Ignoring event from superseded session");
                    return;
                }
                self.handle_transport_event(session_id, event).await;
            }
            ManagerEvent::ReconnectDue { delay } => self.reconnect(delay).await,
            ManagerEvent::Stop => {}
        }
    }

    async fn handle_transport_event(
        self: &Arc<Self>,
        session_id: SessionId,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::Connecting => {
                self.core.lock().state = ConnectionState::Connecting;
                debug!(%session_id, "Session connecting");
            }
            TransportEvent::PairingChallenge { payload } => {
                self.on_challenge(session_id, payload).await;
            }
            TransportEvent::Open => self.on_open(session_id),
            TransportEvent::Close(reason) => self.on_close(session_id, reason),
            TransportEvent::CredentialsUpdated(credentials) => {
                self.persist_credentials(session_id, credentials).await;
            }
        }
    }

    fn on_open(self: &Arc<Self>, session_id: SessionId) {
        {
            let mut core = self.core.lock();
            core.state = ConnectionState::Open;
            core.pairing.reset();
            core.logged_out = false;
        }
        self.scheduler.cancel();

        info!(%session_id, queued = self.queue.len(), "Session open");
        self.spawn_drain(self.options.drain_start_delay);
    }

    fn on_close(&self, session_id: SessionId, reason: CloseReason) {
        let terminal = reason.is_terminal();
        let recorded = if terminal {
            Error::session_logged_out(reason.message())
        } else {
            Error::connection(format!("session dropped ({reason})"))
        };

        {
            let mut core = self.core.lock();
            core.state = ConnectionState::Disconnected;
            core.pairing.reset();
            core.logged_out = terminal;
            core.last_error = Some(self.last_error(&recorded));
        }

        if terminal {
            warn!(%session_id, %reason, "Session logged out, not reconnecting");
            self.scheduler.cancel();
        } else {
            info!(%session_id, %reason, "Session closed, scheduling reconnect");
            self.schedule_reconnect(self.options.reconnect_delay);
        }
    }

    async fn on_challenge(&self, session_id: SessionId, payload: String) {
        let verdict = {
            let mut core = self.core.lock();
            core.state = ConnectionState::AwaitingPairing;
            core.pairing.on_challenge(payload, self.clock.now())
        };

        match verdict {
            ChallengeVerdict::Pending { attempt } => {
                info!(%session_id, attempt, "Awaiting pairing");
            }
            ChallengeVerdict::Exhausted => {
                let penalty = self.options.pairing_penalty_delay;
                let err = Error::connection(format!(
                    "pairing not completed after {} challenges",
                    self.options.max_pairing_attempts
                ));

                // The ended handle stays in the slot so sends keep queueing
                // through the penalty.
                let ending = {
                    let mut core = self.core.lock();
                    core.state = ConnectionState::Disconnected;
                    core.last_error = Some(self.last_error(&err));
                    core.slot.as_mut().filter(|slot| !slot.ended).map(|slot| {
                        slot.forwarder.abort();
                        slot.ended = true;
                        Arc::clone(&slot.session)
                    })
                };

                warn!(
                    %session_id,
                    retry_ms = penalty.as_millis() as u64,
                    "Pairing attempts exhausted, tearing session down"
                );

                if let Some(session) = ending {
                    end_session(session_id, session.as_ref()).await;
                }
                self.schedule_reconnect(penalty);
            }
        }
    }

    async fn persist_credentials(&self, session_id: SessionId, credentials: Credentials) {
        match self.store.save(&credentials).await {
            Ok(()) => debug!(%session_id, bytes = credentials.len(), "Credentials persisted"),
            Err(err) => {
                warn!(%session_id, error = %err, "Failed to persist credentials");
                self.core.lock().last_error = Some(self.last_error(&err));
            }
        }
    }
}

// ============================================================================
// ManagerInner - Session Handles
// ============================================================================

impl ManagerInner {
    /// Replaces the current handle with a fresh one.
    ///
    /// The previous handle is ended before the transport is asked for a
    /// new one.
    async fn open_session(&self) -> Result<()> {
        let previous = {
            let mut core = self.core.lock();
            if self.closing.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed);
            }
            core.state = ConnectionState::Connecting;
            core.slot.take()
        };
        if let Some(slot) = previous {
            teardown(slot).await;
        }

        match self.connect().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut core = self.core.lock();
                if !self.closing.load(Ordering::SeqCst) {
                    core.state = ConnectionState::Disconnected;
                }
                core.last_error = Some(self.last_error(&err));
                Err(err)
            }
        }
    }

    async fn connect(&self) -> Result<()> {
        let credentials = self.store.load().await?;
        debug!(resumed = credentials.is_some(), "Requesting session handle");

        let Connected { session, events } = self.transport.connect(credentials).await?;
        let session_id = SessionId::next();

        // The forwarder starts under the lock, so the slot is in place
        // before the dispatcher checks the handle's first event.
        let installed = {
            let mut core = self.core.lock();
            if self.closing.load(Ordering::SeqCst) {
                false
            } else {
                let forwarder = tokio::spawn(forward_events(
                    session_id,
                    events,
                    self.events_tx.clone(),
                ));
                core.slot = Some(SessionSlot {
                    id: session_id,
                    session: Arc::clone(&session),
                    forwarder,
                    ended: false,
                });
                true
            }
        };

        if !installed {
            debug!(%session_id, "Shutdown during connect, ending new handle");
            end_session(session_id, session.as_ref()).await;
            return Err(Error::ConnectionClosed);
        }

        info!(%session_id, "Session handle created");
        Ok(())
    }

    async fn reconnect(&self, delay: Duration) {
        if self.core.lock().state.is_open() {
            debug!("Session already open, reconnect skipped");
            return;
        }

        let Some(guard) = InitGuard::acquire(&self.initializing) else {
            debug!("Start in progress, reconnect skipped");
            return;
        };

        info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        let result = self.open_session().await;
        drop(guard);

        if let Err(err) = result {
            let next = self.backoff.next_delay(delay);
            warn!(error = %err, next_ms = next.as_millis() as u64, "Reconnect failed");
            self.schedule_reconnect(next);
        }
    }

    fn schedule_reconnect(&self, delay: Duration) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let tx = self.events_tx.clone();
        self.scheduler.schedule(delay, move |delay| {
            let _ = tx.send(ManagerEvent::ReconnectDue { delay });
        });
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        self.core
            .lock()
            .slot
            .as_ref()
            .is_some_and(|slot| slot.id == session_id && !slot.ended)
    }

    /// Id of the live handle if the session is open.
    fn open_session_id(&self) -> Option<SessionId> {
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        let core = self.core.lock();
        if !core.state.is_open() {
            return None;
        }
        core.slot.as_ref().map(|slot| slot.id)
    }

    fn last_error(&self, err: &Error) -> LastError {
        LastError {
            message: err.to_string(),
            at: self.clock.now(),
        }
    }
}

// ============================================================================
// ManagerInner - Draining
// ============================================================================

impl ManagerInner {
    /// Starts a drain task after `settle`, unless one is already running.
    fn spawn_drain(self: &Arc<Self>, settle: Duration) {
        if self.draining.swap(true, Ordering::SeqCst) {
            trace!("Drain already running");
            return;
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.timer.sleep(settle).await;
            inner.drain_while_open().await;
            inner.draining.store(false, Ordering::SeqCst);

            // Entries may have been queued after the last readiness check.
            if !inner.queue.is_empty() && inner.open_session_id().is_some() {
                inner.spawn_drain(Duration::ZERO);
            }
        });
        *self.drain_task.lock() = Some(task);
    }

    async fn drain_while_open(self: &Arc<Self>) {
        while let Some(session_id) = self.open_session_id() {
            let report = self
                .queue
                .drain(
                    || self.open_session_id() == Some(session_id),
                    |entry| {
                        let inner = Arc::clone(self);
                        async move { inner.dispatch_queued(session_id, entry).await }
                    },
                    self.options.drain_pacing,
                    self.timer.as_ref(),
                )
                .await;

            // Stopped for a handle that went away; a newer one may be open.
            if !report.interrupted() {
                break;
            }
        }
    }

    async fn dispatch_queued(&self, session_id: SessionId, entry: QueueEntry) -> Result<()> {
        let session = {
            let core = self.core.lock();
            core.slot
                .as_ref()
                .filter(|slot| slot.id == session_id)
                .map(|slot| Arc::clone(&slot.session))
        };
        let session = session.ok_or(Error::ConnectionClosed)?;
        session.send_text(entry.recipient(), entry.text()).await
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.drain_task.get_mut().take() {
            task.abort();
        }
        if let Some(slot) = self.core.get_mut().slot.take() {
            slot.forwarder.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::time::testing::{HoldingTimer, InstantTimer};
    use crate::transport::{LoopbackTransport, MemoryCredentialStore};

    const RECIPIENT: &str = "15551234567";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    struct Fixture {
        manager: ConnectionManager,
        transport: LoopbackTransport,
        store: Arc<MemoryCredentialStore>,
    }

    fn fixture(timer: Arc<dyn Timer>) -> Fixture {
        init_tracing();
        let transport = LoopbackTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = ConnectionManager::builder()
            .transport(Arc::new(transport.clone()))
            .credential_store(store.clone())
            .timer(timer)
            .build()
            .expect("build manager");

        Fixture {
            manager,
            transport,
            store,
        }
    }

    /// Reconnect delays (5 s and up) stay armed; drain waits pass through.
    fn holding() -> (Fixture, Arc<HoldingTimer>) {
        let timer = HoldingTimer::new(Duration::from_secs(5));
        (fixture(timer.clone()), timer)
    }

    fn instant() -> (Fixture, Arc<InstantTimer>) {
        let timer = Arc::new(InstantTimer::default());
        (fixture(timer.clone()), timer)
    }

    fn manager_with(transport: Arc<dyn Transport>, timer: Arc<dyn Timer>) -> ConnectionManager {
        init_tracing();
        ConnectionManager::builder()
            .transport(transport)
            .timer(timer)
            .build()
            .expect("build manager")
    }

    /// Hands out sessions whose event stream already holds `Open`.
    struct OpenOnConnect(LoopbackTransport);

    #[async_trait]
    impl Transport for OpenOnConnect {
        async fn connect(&self, credentials: Option<Credentials>) -> Result<Connected> {
            let connected = self.0.connect(credentials).await?;
            self.0.open();
            Ok(connected)
        }
    }

    /// Holds every connect after the first until a permit is added.
    struct GatedConnect {
        inner: LoopbackTransport,
        gate: Semaphore,
        waiting: AtomicUsize,
    }

    #[async_trait]
    impl Transport for GatedConnect {
        async fn connect(&self, credentials: Option<Credentials>) -> Result<Connected> {
            if self.inner.connect_count() > 0 {
                self.waiting.fetch_add(1, Ordering::SeqCst);
                self.gate
                    .acquire()
                    .await
                    .map_err(|_| Error::ConnectionClosed)?
                    .forget();
            }
            self.inner.connect(credentials).await
        }
    }

    /// Passes every sleep except drain pacing, which waits for a permit.
    struct PacingGate {
        pacing: Duration,
        permits: Semaphore,
        calls: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Timer for PacingGate {
        async fn sleep(&self, duration: Duration) {
            self.calls.lock().push(duration);
            if duration == self.pacing
                && let Ok(permit) = self.permits.acquire().await
            {
                permit.forget();
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_initialized() {
        let (fx, _) = holding();
        let err = fx.manager.send(RECIPIENT, "hi").await.expect_err("no handle");
        assert!(matches!(err, Error::NotInitialized));
        assert!(fx.manager.queue().is_empty());
    }

    #[tokio::test]
    async fn test_queued_then_drained_on_open() {
        let (fx, timer) = holding();
        fx.manager.start().await.expect("start");
        assert_eq!(fx.manager.state(), ConnectionState::Connecting);

        let delivery = fx.manager.send(RECIPIENT, "hello").await.expect("send");
        assert!(matches!(delivery, Delivery::Queued { depth: 1, .. }));
        assert_eq!(fx.manager.status().queue_depth, 1);

        assert!(fx.transport.open());
        wait_until(|| fx.transport.sent_texts() == ["hello"]).await;
        wait_until(|| timer.calls.lock().contains(&Duration::from_secs(1))).await;
        assert!(fx.manager.queue().is_empty());

        let sent = fx.transport.sent();
        assert_eq!(sent[0].recipient.as_str(), RECIPIENT);

        let calls = timer.calls.lock().clone();
        assert!(calls.contains(&Duration::from_secs(2)), "settle delay: {calls:?}");
        assert!(calls.contains(&Duration::from_secs(1)), "pacing: {calls:?}");
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let (fx, _) = holding();
        fx.manager.start().await.expect("start");

        for text in ["one", "two", "three"] {
            fx.manager.send(RECIPIENT, text).await.expect("queue");
        }
        let queued: Vec<_> = fx
            .manager
            .queue()
            .entries()
            .iter()
            .map(|e| e.text().to_string())
            .collect();
        assert_eq!(queued, ["one", "two", "three"]);

        fx.transport.open();
        wait_until(|| fx.transport.sent_texts().len() == 3).await;
        assert_eq!(fx.transport.sent_texts(), ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_send_while_open_dispatches_now() {
        let (fx, _) = holding();
        fx.manager.start().await.expect("start");
        fx.transport.open();
        wait_until(|| fx.manager.is_open()).await;

        let delivery = fx.manager.send(RECIPIENT, "now").await.expect("send");
        assert_eq!(delivery, Delivery::Sent);
        assert_eq!(fx.transport.sent_texts(), ["now"]);

        fx.transport.fail_next_sends(1);
        let err = fx.manager.send(RECIPIENT, "again").await.expect_err("rejected");
        assert!(matches!(err, Error::DispatchFailed { .. }));
        assert!(fx.manager.queue().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_not_queued() {
        let (fx, _) = holding();
        fx.manager.start().await.expect("start");
        fx.manager.send(RECIPIENT, "queued").await.expect("queue");

        let err = fx.manager.send("abc", "hello").await.expect_err("bad recipient");
        assert!(matches!(err, Error::InvalidArgument { .. }));

        let err = fx.manager.send(RECIPIENT, "").await.expect_err("empty text");
        assert!(matches!(err, Error::InvalidArgument { .. }));

        assert_eq!(fx.manager.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_third_challenge_tears_down_and_waits_penalty() {
        let (fx, timer) = holding();
        fx.manager.start().await.expect("start");

        fx.transport.challenge("qr-1");
        wait_until(|| fx.manager.pairing().attempts == 1).await;
        assert_eq!(fx.manager.state(), ConnectionState::AwaitingPairing);
        assert_eq!(
            fx.manager.pairing().challenge.map(|c| c.payload).as_deref(),
            Some("qr-1")
        );

        fx.transport.challenge("qr-2");
        fx.transport.challenge("qr-3");
        wait_until(|| !timer.held().is_empty()).await;

        assert_eq!(timer.held(), [Duration::from_secs(10)]);
        assert_eq!(fx.transport.live_sessions(), 0);

        let status = fx.manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.pairing_attempts, 0);
        assert!(status.reconnect_pending);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_send_queues_during_pairing_penalty() {
        let (fx, timer) = holding();
        fx.manager.start().await.expect("start");

        for payload in ["qr-1", "qr-2", "qr-3"] {
            fx.transport.challenge(payload);
        }
        wait_until(|| !timer.held().is_empty()).await;

        let delivery = fx
            .manager
            .send(RECIPIENT, "during penalty")
            .await
            .expect("queued");
        assert!(matches!(delivery, Delivery::Queued { depth: 1, .. }));
        assert_eq!(fx.transport.live_sessions(), 0);
        assert!(fx.transport.sent().is_empty());

        // A late challenge from the ended handle is ignored.
        fx.transport.challenge("qr-4");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.manager.pairing().attempts, 0);
        assert_eq!(fx.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_open_buffered_before_install_is_handled() {
        for _ in 0..200 {
            let transport = LoopbackTransport::new();
            let manager = manager_with(
                Arc::new(OpenOnConnect(transport.clone())),
                HoldingTimer::new(Duration::from_secs(5)),
            );

            manager.start().await.expect("start");
            wait_until(|| manager.is_open()).await;

            manager.shutdown().await.expect("shutdown");
            assert_eq!(transport.live_sessions(), 0);
        }
    }

    #[tokio::test]
    async fn test_disconnect_mid_drain_keeps_remainder_for_next_open() {
        let transport = LoopbackTransport::new();
        let timer = Arc::new(PacingGate {
            pacing: Duration::from_secs(1),
            permits: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
        });
        let manager = manager_with(Arc::new(transport.clone()), timer.clone());

        manager.start().await.expect("start");
        for text in ["one", "two", "three"] {
            manager.send(RECIPIENT, text).await.expect("queue");
        }

        transport.open();
        wait_until(|| timer.calls.lock().contains(&Duration::from_secs(1))).await;
        assert_eq!(transport.sent_texts(), ["one"]);

        transport.drop_connection("stream errored");
        wait_until(|| transport.connect_count() == 2).await;

        timer.permits.add_permits(1);
        wait_until(|| !manager.inner.draining.load(Ordering::SeqCst)).await;
        let remaining: Vec<_> = manager
            .queue()
            .entries()
            .iter()
            .map(|e| e.text().to_string())
            .collect();
        assert_eq!(remaining, ["two", "three"]);

        timer.permits.add_permits(10);
        transport.open();
        wait_until(|| transport.sent_texts().len() == 3).await;

        assert_eq!(transport.sent_texts(), ["one", "two", "three"]);
        let sessions: Vec<_> = transport.sent().iter().map(|m| m.session).collect();
        assert_eq!(sessions, [0, 1, 1]);
        assert!(manager.queue().is_empty());
    }

    #[tokio::test]
    async fn test_open_resets_pairing() {
        let (fx, _) = holding();
        fx.manager.start().await.expect("start");

        fx.transport.challenge("qr-1");
        fx.transport.challenge("qr-2");
        fx.transport.open();
        wait_until(|| fx.manager.is_open()).await;

        let view = fx.manager.pairing();
        assert_eq!(view.attempts, 0);
        assert!(view.challenge.is_none());
        assert_eq!(view.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_repeated_closes_arm_one_timer() {
        let (fx, timer) = holding();
        fx.manager.start().await.expect("start");
        fx.transport.open();
        wait_until(|| fx.manager.is_open()).await;

        fx.transport.drop_connection("stream errored");
        fx.transport.drop_connection("stream errored");
        wait_until(|| !timer.held().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(timer.held(), [Duration::from_secs(5)]);
        let status = fx.manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.health, Health::Degraded);
        assert!(status.reconnect_pending);
    }

    #[tokio::test]
    async fn test_reconnect_tears_down_previous_handle() {
        let (fx, _) = instant();
        fx.manager.start().await.expect("start");
        fx.transport.open();
        wait_until(|| fx.manager.is_open()).await;

        fx.transport.drop_connection("restart required");
        wait_until(|| fx.transport.connect_count() == 2).await;

        assert_eq!(fx.transport.live_sessions(), 1);
        assert_eq!(fx.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_failed_reconnects_back_off() {
        let (fx, timer) = instant();
        fx.manager.start().await.expect("start");
        fx.transport.open();
        wait_until(|| fx.manager.is_open()).await;

        fx.transport.refuse_next_connects(2);
        fx.transport.drop_connection("connection lost");
        wait_until(|| fx.transport.connect_count() == 2).await;

        let reconnects: Vec<_> = timer
            .calls
            .lock()
            .iter()
            .copied()
            .filter(|d| *d >= Duration::from_secs(5))
            .collect();
        assert_eq!(
            reconnects,
            [
                Duration::from_millis(5_000),
                Duration::from_millis(7_500),
                Duration::from_millis(11_250),
            ]
        );
        assert_eq!(fx.transport.presented_credentials().len(), 4);
    }

    #[tokio::test]
    async fn test_start_failure_schedules_retry() {
        let (fx, timer) = holding();
        fx.transport.refuse_next_connects(1);

        let err = fx.manager.start().await.expect_err("refused");
        assert!(err.is_connection_error());

        let status = fx.manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.is_some());
        assert!(status.reconnect_pending);
        wait_until(|| !timer.held().is_empty()).await;
        assert_eq!(timer.held(), [Duration::from_secs(10)]);

        // A second start is a no-op; the scheduled retry owns recovery.
        fx.manager.start().await.expect("idempotent");
        assert_eq!(fx.transport.presented_credentials().len(), 1);
    }

    #[tokio::test]
    async fn test_logged_out_does_not_reconnect() {
        let (fx, timer) = holding();
        fx.manager.start().await.expect("start");
        fx.transport.open();
        wait_until(|| fx.manager.is_open()).await;

        fx.transport.log_out();
        wait_until(|| fx.manager.state() == ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = fx.manager.status();
        assert_eq!(status.health, Health::LoggedOut);
        assert!(!status.reconnect_pending);
        assert!(timer.held().is_empty());
        assert!(
            status
                .last_error
                .is_some_and(|e| e.message.contains("logged out"))
        );
    }

    #[tokio::test]
    async fn test_credentials_saved_and_resumed() {
        let (fx, _) = instant();
        fx.manager.start().await.expect("start");

        let credentials = Credentials::new(vec![7, 7, 7]);
        fx.transport.rotate_credentials(credentials.clone());
        wait_until(|| fx.store.save_count() == 1).await;
        assert_eq!(fx.store.current(), Some(credentials.clone()));

        fx.transport.drop_connection("restart required");
        wait_until(|| fx.transport.connect_count() == 2).await;
        assert_eq!(
            fx.transport.presented_credentials(),
            vec![None, Some(credentials)]
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (fx, _) = holding();
        let (a, b) = tokio::join!(fx.manager.start(), fx.manager.start());
        a.expect("first");
        b.expect("second");
        fx.manager.start().await.expect("third");
        assert_eq!(fx.transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_discards_queue_and_ends_session() {
        let (fx, _) = holding();
        fx.manager.start().await.expect("start");
        fx.manager.send(RECIPIENT, "pending").await.expect("queue");

        fx.manager.shutdown().await.expect("shutdown");
        assert_eq!(fx.manager.state(), ConnectionState::Closing);
        assert_eq!(fx.transport.live_sessions(), 0);
        assert!(fx.manager.queue().is_empty());

        fx.manager.shutdown().await.expect("second shutdown");
        fx.manager.start().await.expect("start after shutdown");
        assert_eq!(fx.transport.connect_count(), 1);

        let err = fx.manager.send(RECIPIENT, "late").await.expect_err("closed");
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn test_shutdown_ends_handle_from_reconnect_in_flight() {
        let transport = Arc::new(GatedConnect {
            inner: LoopbackTransport::new(),
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        });
        let manager = manager_with(transport.clone(), Arc::new(InstantTimer::default()));

        manager.start().await.expect("start");
        transport.inner.open();
        wait_until(|| manager.is_open()).await;

        transport.inner.drop_connection("connection lost");
        wait_until(|| transport.waiting.load(Ordering::SeqCst) == 1).await;

        let shutdown = tokio::spawn({
            let manager = manager.clone();
            async move { manager.shutdown().await }
        });
        wait_until(|| manager.state() == ConnectionState::Closing).await;
        transport.gate.add_permits(1);

        shutdown.await.expect("join").expect("shutdown");
        assert_eq!(transport.inner.connect_count(), 2);
        assert_eq!(transport.inner.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_reconnect() {
        let (fx, timer) = holding();
        fx.manager.start().await.expect("start");
        fx.transport.drop_connection("lost");
        wait_until(|| !timer.held().is_empty()).await;

        fx.manager.shutdown().await.expect("shutdown");
        assert!(!fx.manager.status().reconnect_pending);
    }

    #[tokio::test]
    async fn test_status_health() {
        let (fx, _) = holding();
        assert_eq!(fx.manager.status().health, Health::Degraded);

        fx.manager.start().await.expect("start");
        fx.transport.open();
        wait_until(|| fx.manager.is_open()).await;

        let status = fx.manager.status();
        assert_eq!(status.health, Health::Healthy);
        assert!(!status.initializing);
        assert_eq!(status.queue_depth, 0);
    }
}
