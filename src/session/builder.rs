//! Builder for [`ConnectionManager`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use session_courier::{BridgeTransport, ConnectionManager, FileCredentialStore};
//!
//! # async fn example() -> session_courier::Result<()> {
//! let transport = BridgeTransport::builder()
//!     .url("ws://127.0.0.1:8787")
//!     .build()?;
//!
//! let manager = ConnectionManager::builder()
//!     .transport(Arc::new(transport))
//!     .credential_store(Arc::new(FileCredentialStore::new("./auth")))
//!     .build()?;
//!
//! manager.start().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::time::{Clock, SystemClock, Timer, TokioTimer};
use crate::transport::{CredentialStore, MemoryCredentialStore, Transport};

use super::manager::ConnectionManager;
use super::options::ManagerOptions;

// ============================================================================
// ManagerBuilder
// ============================================================================

/// Builder for configuring a [`ConnectionManager`].
///
/// Use [`ConnectionManager::builder()`] to create one. Only the transport
/// is required; the credential store defaults to an in-memory store, the
/// timer to tokio's and the clock to the system clock.
#[derive(Default)]
pub struct ManagerBuilder {
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn CredentialStore>>,
    timer: Option<Arc<dyn Timer>>,
    clock: Option<Arc<dyn Clock>>,
    options: ManagerOptions,
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("has_transport", &self.transport.is_some())
            .field("has_store", &self.store.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ManagerBuilder Implementation
// ============================================================================

impl ManagerBuilder {
    /// Creates an empty builder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transport that creates session handles.
    #[inline]
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets where credentials are loaded from and saved to.
    #[inline]
    #[must_use]
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the timer used for reconnect backoff and drain pacing.
    #[inline]
    #[must_use]
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Sets the clock used for timestamps.
    #[inline]
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the tuning options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the manager and spawns its event dispatcher.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no transport was set
    /// - [`Error::Config`] if the options are inconsistent
    /// - [`Error::Config`] if called outside a tokio runtime
    pub fn build(self) -> Result<ConnectionManager> {
        let transport = self
            .transport
            .ok_or_else(|| Error::config("a transport is required"))?;

        self.options.validate()?;

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::config(
                "ConnectionManager must be built inside a tokio runtime",
            ));
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()));
        let timer = self.timer.unwrap_or_else(|| Arc::new(TokioTimer));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(ConnectionManager::new(
            transport,
            store,
            timer,
            clock,
            self.options,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================
