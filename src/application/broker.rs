//! Shared connection to the billing service.
//!
//! One real bind is multiplexed behind a waiter list: the first caller that
//! finds the broker disconnected starts the bind, everyone arriving before the
//! platform reports back is queued, and all of them receive a handle to the
//! same connection (or the same failure). Handles are reference counted; when
//! the last one is dropped the connection is unbound after an idle window,
//! unless a new caller shows up first.

use super::settings::BillingSettings;
use crate::domain::ports::{RemoteBillingService, RemoteServiceArc, ServiceBinderBox};
use crate::error::{BillingError, ConnectFailure, Result};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub connect_retries: u32,
    pub idle_timeout: Duration,
}

impl From<&BillingSettings> for ConnectionSettings {
    fn from(settings: &BillingSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            connect_retries: settings.connect_retries,
            idle_timeout: settings.idle_timeout(),
        }
    }
}

type Delivery = std::result::Result<ConnectionHandle, ConnectFailure>;
type Waiter = oneshot::Sender<Delivery>;

enum Phase {
    Disconnected,
    Connecting,
    Connected(RemoteServiceArc),
}

struct BrokerState {
    phase: Phase,
    /// Identifies the current bind attempt; bumped on every new attempt.
    generation: u64,
    attempt: u32,
    references: usize,
    waiters: Vec<Waiter>,
    teardown: Option<JoinHandle<()>>,
    teardown_epoch: u64,
}

struct BrokerShared {
    binder: ServiceBinderBox,
    settings: ConnectionSettings,
    runtime: Handle,
    state: Mutex<BrokerState>,
}

enum Admission {
    Ready(ConnectionHandle),
    Queued {
        receiver: oneshot::Receiver<Delivery>,
        bind: Option<u64>,
    },
}

enum TimeoutAction {
    Ignore,
    Retry(u64),
    Fail(Vec<Waiter>, u32),
}

impl BrokerShared {
    fn admit(self: &Arc<Self>) -> Admission {
        let mut state = self.state.lock();

        if let Phase::Connected(service) = &state.phase {
            let service = Arc::clone(service);
            let generation = state.generation;
            Self::cancel_teardown(&mut state);
            state.references += 1;
            debug!(count = state.references, "Connection reused");
            return Admission::Ready(ConnectionHandle::new(Arc::clone(self), service, generation));
        }

        let (sender, receiver) = oneshot::channel();
        state.waiters.push(sender);
        let bind = if matches!(state.phase, Phase::Disconnected) {
            state.generation += 1;
            state.attempt = 1;
            state.phase = Phase::Connecting;
            Some(state.generation)
        } else {
            None
        };
        debug!(waiting = state.waiters.len(), "Queued for connection");
        Admission::Queued { receiver, bind }
    }

    /// Arms the attempt timer and asks the platform to bind. Never called with
    /// the state lock held.
    fn start_attempt(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let timeout = self.settings.connect_timeout;
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_attempt_timeout(generation);
            }
        });

        info!(generation, "Created new service connection");
        let listener = ConnectionListener {
            shared: Arc::downgrade(self),
            generation,
        };
        if let Err(e) = self.binder.bind(listener) {
            self.fail_attempt(generation, ConnectFailure::Rejected(e.to_string()));
        }
    }

    fn on_connected(self: &Arc<Self>, generation: u64, service: RemoteServiceArc) {
        let mut state = self.state.lock();
        if state.generation != generation || !matches!(state.phase, Phase::Connecting) {
            warn!(generation, "Ignoring connect from a superseded attempt");
            return;
        }

        state.phase = Phase::Connected(Arc::clone(&service));
        state.attempt = 0;
        let waiters = std::mem::take(&mut state.waiters);
        info!(generation, waiting = waiters.len(), "onServiceConnected");

        // Handles whose receiver is gone come back here and must be dropped
        // only after the lock is released.
        let mut orphaned = Vec::new();
        for waiter in waiters {
            state.references += 1;
            let handle = ConnectionHandle::new(Arc::clone(self), Arc::clone(&service), generation);
            if let Err(Ok(handle)) = waiter.send(Ok(handle)) {
                orphaned.push(handle);
            }
        }
        if state.references == 0 {
            self.schedule_teardown(&mut state);
        }
        drop(state);
        drop(orphaned);
    }

    fn on_disconnected(&self, generation: u64) {
        let unbind = {
            let mut state = self.state.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Connected(_)) {
                return;
            }
            state.phase = Phase::Disconnected;
            Self::cancel_teardown(&mut state);
            true
        };
        info!(generation, "onServiceDisconnected");
        // The platform keeps a crashed binding registered until it is unbound.
        if unbind {
            self.binder.unbind();
        }
    }

    fn fail_attempt(&self, generation: u64, failure: ConnectFailure) {
        let waiters = {
            let mut state = self.state.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Connecting) {
                return;
            }
            state.phase = Phase::Disconnected;
            state.attempt = 0;
            std::mem::take(&mut state.waiters)
        };

        warn!(generation, waiting = waiters.len(), %failure, "Connect attempt failed");
        for waiter in waiters {
            let _ = waiter.send(Err(failure.clone()));
        }
    }

    fn on_attempt_timeout(self: &Arc<Self>, generation: u64) {
        let action = {
            let mut state = self.state.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Connecting) {
                TimeoutAction::Ignore
            } else if state.attempt <= self.settings.connect_retries {
                state.attempt += 1;
                state.generation += 1;
                TimeoutAction::Retry(state.generation)
            } else {
                let attempts = state.attempt;
                state.phase = Phase::Disconnected;
                state.attempt = 0;
                TimeoutAction::Fail(std::mem::take(&mut state.waiters), attempts)
            }
        };

        match action {
            TimeoutAction::Ignore => {}
            TimeoutAction::Retry(next) => {
                warn!(generation, "Bind timed out, retrying");
                self.binder.unbind();
                self.start_attempt(next);
            }
            TimeoutAction::Fail(waiters, attempts) => {
                self.binder.unbind();
                let failure = ConnectFailure::TimedOut {
                    attempts,
                    timeout_ms: self.settings.connect_timeout.as_millis() as u64,
                };
                warn!(generation, waiting = waiters.len(), %failure, "Giving up on bind");
                for waiter in waiters {
                    let _ = waiter.send(Err(failure.clone()));
                }
            }
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        match state.references.checked_sub(1) {
            Some(count) => state.references = count,
            None => {
                error!("Connection released more often than acquired");
                return;
            }
        }
        debug!(count = state.references, "Connection released");
        if state.references == 0 && matches!(state.phase, Phase::Connected(_)) {
            self.schedule_teardown(&mut state);
        }
    }

    fn schedule_teardown(self: &Arc<Self>, state: &mut BrokerState) {
        Self::cancel_teardown(state);
        let epoch = state.teardown_epoch;
        let weak = Arc::downgrade(self);
        let idle = self.settings.idle_timeout;
        state.teardown = Some(self.runtime.spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(shared) = weak.upgrade() {
                shared.teardown_if_idle(epoch);
            }
        }));
    }

    fn cancel_teardown(state: &mut BrokerState) {
        if let Some(task) = state.teardown.take() {
            task.abort();
        }
        state.teardown_epoch += 1;
    }

    /// Runs when the idle window elapses. Reads the count as it is now, not as
    /// it was when the teardown was scheduled.
    fn teardown_if_idle(&self, epoch: u64) {
        let unbind = {
            let mut state = self.state.lock();
            if state.teardown_epoch != epoch
                || state.references != 0
                || !matches!(state.phase, Phase::Connected(_))
            {
                false
            } else {
                state.phase = Phase::Disconnected;
                state.teardown = None;
                true
            }
        };
        if unbind {
            self.binder.unbind();
            info!("Disconnected from service");
        }
    }
}

impl Drop for BrokerShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(task) = state.teardown.take() {
            task.abort();
        }
        if matches!(state.phase, Phase::Connected(_)) {
            self.binder.unbind();
        }
    }
}

/// Owns the lifecycle of the single shared connection.
pub struct ServiceConnectionBroker {
    shared: Arc<BrokerShared>,
}

impl ServiceConnectionBroker {
    /// Creates a disconnected broker.
    ///
    /// Must be called from within a Tokio runtime; the runtime is kept to arm
    /// connect and idle timers from whichever thread ends up needing them.
    pub fn new(binder: ServiceBinderBox, settings: ConnectionSettings) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            BillingError::Config("connection broker must be created inside a Tokio runtime".into())
        })?;
        Ok(Self {
            shared: Arc::new(BrokerShared {
                binder,
                settings,
                runtime,
                state: Mutex::new(BrokerState {
                    phase: Phase::Disconnected,
                    generation: 0,
                    attempt: 0,
                    references: 0,
                    waiters: Vec::new(),
                    teardown: None,
                    teardown_epoch: 0,
                }),
            }),
        })
    }

    /// Returns a live handle, binding first if needed.
    ///
    /// Suspends the task rather than its thread, so it is safe on executor
    /// threads and any other context that must stay responsive.
    pub async fn acquire(&self) -> Result<ConnectionHandle> {
        match self.shared.admit() {
            Admission::Ready(handle) => Ok(handle),
            Admission::Queued { receiver, bind } => {
                if let Some(generation) = bind {
                    self.shared.start_attempt(generation);
                }
                settle(receiver.await)
            }
        }
    }

    /// Blocking flavour of [`acquire`](Self::acquire) for threads that are
    /// free to block.
    ///
    /// # Panics
    ///
    /// Panics when called from an async task, like any other blocking receive.
    pub fn acquire_blocking(&self) -> Result<ConnectionHandle> {
        match self.shared.admit() {
            Admission::Ready(handle) => Ok(handle),
            Admission::Queued { receiver, bind } => {
                if let Some(generation) = bind {
                    self.shared.start_attempt(generation);
                }
                settle(receiver.blocking_recv())
            }
        }
    }

    /// Gives a handle back. Equivalent to dropping it.
    pub fn release(&self, handle: ConnectionHandle) {
        drop(handle);
    }

    pub fn reference_count(&self) -> usize {
        self.shared.state.lock().references
    }

    pub fn pending_connectors(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.shared.state.lock().phase, Phase::Connected(_))
    }
}

fn settle(
    received: std::result::Result<Delivery, oneshot::error::RecvError>,
) -> Result<ConnectionHandle> {
    match received {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(failure)) => Err(failure.into()),
        Err(_) => Err(ConnectFailure::Closed.into()),
    }
}

/// Capability to call the bound service.
///
/// Counts as one reference on the shared connection until dropped. Release
/// consumes the handle, so a handle cannot be released twice.
pub struct ConnectionHandle {
    service: RemoteServiceArc,
    broker: Arc<BrokerShared>,
    generation: u64,
}

impl ConnectionHandle {
    fn new(broker: Arc<BrokerShared>, service: RemoteServiceArc, generation: u64) -> Self {
        Self {
            service,
            broker,
            generation,
        }
    }

    /// Identifies the underlying bind; equal for handles sharing a connection.
    pub fn connection_id(&self) -> u64 {
        self.generation
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn RemoteBillingService;

    fn deref(&self) -> &Self::Target {
        self.service.as_ref()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.broker.release();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.generation)
            .finish()
    }
}

/// Receives the platform's connection lifecycle events for one bind attempt.
///
/// Events may arrive on any thread. Events for an attempt the broker has
/// already given up on are ignored.
#[derive(Clone, Debug)]
pub struct ConnectionListener {
    shared: Weak<BrokerShared>,
    generation: u64,
}

impl ConnectionListener {
    pub fn on_connected(&self, service: RemoteServiceArc) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_connected(self.generation, service);
        }
    }

    pub fn on_disconnected(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_disconnected(self.generation);
        }
    }

    pub fn on_bind_failed(&self, reason: impl Into<String>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.fail_attempt(self.generation, ConnectFailure::Rejected(reason.into()));
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
