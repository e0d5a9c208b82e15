//! Connection lifecycle and automatic reconnection
//!
//! [`ReconnectionCoordinator`] is the single owner of [`ConnectionState`].
//! It builds a transport for the requested target, spawns a
//! [`ProtocolEngine`] on it and runs the handshake in a background task.
//!
//! When the link drops without [`disconnect`](ReconnectionCoordinator::disconnect)
//! being called, the coordinator retries with exponential backoff and
//! publishes a per-second countdown. Permanent failures (the OS refusing
//! access to the device, a transport missing from this build) skip backoff
//! and end in [`ConnectionState::Error`].
//!
//! Mesh state and pending deliveries live in the shared [`MeshContext`] and
//! survive reconnects, so a late ACK still resolves its message.
//!
//! Every transport connection gets a generation number. Events carry the
//! generation they were raised under and are ignored once a newer connect
//! or disconnect has happened.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionParameters, MeshlinkConfig};
use crate::engine::ProtocolEngine;
use crate::error::{MeshlinkError, Result};
use crate::interface::{RadioTransport, TransportCallback, TransportEvent, TransportFactory};
use crate::session::InboundBuffer;
use crate::state::MeshContext;

/// Connection lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry; `delay_secs` counts down to the next attempt
    Reconnecting { attempt: u32, delay_secs: u64 },
    /// Terminal failure, not retried
    Error { message: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting {
                attempt,
                delay_secs,
            } => write!(f, "reconnecting (attempt {}, in {}s)", attempt, delay_secs),
            ConnectionState::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Link loss reported under a given connection generation
struct LinkLost {
    generation: u64,
    reason: String,
    permanent: bool,
}

#[derive(Default)]
struct Inner {
    target: Option<ConnectionParameters>,
    transport: Option<Arc<dyn RadioTransport>>,
    engine: Option<ProtocolEngine>,
    init_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    generation: u64,
    attempt: u32,
}

impl Inner {
    fn cancel_tasks(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = self.init_task.take() {
            task.abort();
        }
    }
}

struct Shared {
    factory: TransportFactory,
    ctx: Arc<MeshContext>,
    config: MeshlinkConfig,
    state: watch::Sender<ConnectionState>,
    link_lost: mpsc::UnboundedSender<LinkLost>,
    inner: Mutex<Inner>,
}

/// Owns the connection lifecycle
///
/// Must be created inside a tokio runtime.
pub struct ReconnectionCoordinator {
    shared: Arc<Shared>,
    monitor: JoinHandle<()>,
}

impl ReconnectionCoordinator {
    pub fn new(factory: TransportFactory, ctx: Arc<MeshContext>, config: MeshlinkConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (link_lost, events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            factory,
            ctx,
            config,
            state,
            link_lost,
            inner: Mutex::new(Inner::default()),
        });
        let monitor = tokio::spawn(monitor(Arc::downgrade(&shared), events));
        Self { shared, monitor }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn context(&self) -> &Arc<MeshContext> {
        &self.shared.ctx
    }

    /// Engine of the live connection, if any
    pub async fn engine(&self) -> Option<ProtocolEngine> {
        self.shared.inner.lock().await.engine.clone()
    }

    /// Target of the last explicit connect
    pub async fn target(&self) -> Option<ConnectionParameters> {
        self.shared.inner.lock().await.target.clone()
    }

    /// Reconnect attempts made since the last successful connect
    pub async fn attempt(&self) -> u32 {
        self.shared.inner.lock().await.attempt
    }

    /// Connect to `params`, replacing any current connection
    ///
    /// Returns once the transport is up; the handshake continues in the
    /// background. A failure here is not retried.
    pub async fn connect(&self, params: ConnectionParameters) -> Result<()> {
        if let Err(e) = params.validate() {
            self.shared.set_state(ConnectionState::Error {
                message: e.to_string(),
            });
            return Err(e);
        }

        let mut inner = self.shared.inner.lock().await;
        inner.cancel_tasks();
        self.shared.teardown(&mut inner).await;
        inner.target = Some(params);
        inner.attempt = 0;

        match self.shared.establish(&mut inner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let state = if e.is_permanent() {
                    ConnectionState::Error {
                        message: e.to_string(),
                    }
                } else {
                    ConnectionState::Disconnected
                };
                self.shared.set_state(state);
                Err(e)
            }
        }
    }

    /// Close the connection and stop reconnecting
    pub async fn disconnect(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        inner.cancel_tasks();
        inner.generation += 1;
        inner.attempt = 0;

        if let Some(engine) = inner.engine.as_ref() {
            if let Err(e) = engine.send_disconnect().await {
                debug!(error = %e, "Could not say goodbye to radio");
            }
        }
        self.shared.teardown(&mut inner).await;
        inner.target = None;

        self.shared.set_state(ConnectionState::Disconnected);
        info!("Disconnected from radio");
        Ok(())
    }
}

impl Drop for ReconnectionCoordinator {
    fn drop(&mut self) {
        self.monitor.abort();
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            inner.cancel_tasks();
        }
    }
}

impl std::fmt::Debug for ReconnectionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionCoordinator")
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        debug!(%state, "Connection state");
        self.state.send_replace(state.clone());
        self.ctx.notify_connection_state(&state);
    }

    /// Build, connect and start the protocol for the current target
    async fn establish(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        let target = inner
            .target
            .clone()
            .ok_or_else(|| MeshlinkError::InvalidParameters("no connection target".to_string()))?;
        inner.generation += 1;
        let generation = inner.generation;
        self.set_state(ConnectionState::Connecting);

        let transport = (self.factory)(&target)?;
        let inbound = InboundBuffer::new();
        let callback = self.callback(inbound.clone(), generation);
        transport.connect(&target, callback).await?;

        let engine = ProtocolEngine::spawn(
            transport.clone(),
            inbound,
            self.ctx.clone(),
            self.config.protocol.clone(),
        );
        inner.transport = Some(transport);
        inner.engine = Some(engine.clone());
        inner.attempt = 0;
        self.set_state(ConnectionState::Connected);
        info!(target = %target, "Connected, starting handshake");

        let link_lost = self.link_lost.clone();
        inner.init_task = Some(tokio::spawn(async move {
            match engine.initialize().await {
                Ok(true) => {}
                Ok(false) => warn!("Radio connected but not ready"),
                Err(e) => {
                    warn!(error = %e, "Initialization failed");
                    let _ = link_lost.send(LinkLost {
                        generation,
                        permanent: e.is_permanent(),
                        reason: e.to_string(),
                    });
                }
            }
        }));
        Ok(())
    }

    /// Transport callback: bytes go to the engine, link loss to the monitor
    fn callback(&self, inbound: InboundBuffer, generation: u64) -> TransportCallback {
        let link_lost = self.link_lost.clone();
        Arc::new(move |event| match event {
            TransportEvent::Received(bytes) => inbound.push(&bytes),
            TransportEvent::Disconnected { reason, permanent } => {
                let _ = link_lost.send(LinkLost {
                    generation,
                    reason,
                    permanent,
                });
            }
        })
    }

    async fn teardown(&self, inner: &mut Inner) {
        if let Some(engine) = inner.engine.take() {
            engine.shutdown().await;
        }
        if let Some(transport) = inner.transport.take() {
            if let Err(e) = transport.disconnect().await {
                debug!(error = %e, "Transport close failed");
            }
        }
    }

    async fn on_link_lost(self: &Arc<Self>, lost: LinkLost) {
        let mut inner = self.inner.lock().await;
        if lost.generation != inner.generation {
            debug!(
                generation = lost.generation,
                current = inner.generation,
                "Ignoring stale link event"
            );
            return;
        }
        warn!(reason = %lost.reason, permanent = lost.permanent, "Radio link lost");

        inner.cancel_tasks();
        self.teardown(&mut inner).await;
        inner.generation += 1;

        if lost.permanent {
            error!(reason = %lost.reason, "Permanent failure, not reconnecting");
            self.set_state(ConnectionState::Error {
                message: lost.reason,
            });
            return;
        }
        if !self.config.reconnect.enabled || inner.target.is_none() {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let generation = inner.generation;
        inner.reconnect_task = Some(tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            generation,
        )));
    }
}

/// Handles link loss for the coordinator's lifetime
async fn monitor(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<LinkLost>) {
    while let Some(lost) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.on_link_lost(lost).await;
    }
}

/// Retry the last target with backoff until connected, cancelled or out of attempts
async fn reconnect_loop(shared: Weak<Shared>, mut generation: u64) {
    loop {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        let reconnect = &strong.config.reconnect;

        let attempt = {
            let mut inner = strong.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.attempt += 1;
            inner.attempt
        };
        if reconnect.max_attempts > 0 && attempt > reconnect.max_attempts {
            warn!(attempts = reconnect.max_attempts, "Giving up on reconnection");
            strong.set_state(ConnectionState::Error {
                message: format!("gave up after {} reconnect attempts", reconnect.max_attempts),
            });
            return;
        }

        let delay = reconnect.delay_for_attempt(attempt);
        info!(attempt, delay = ?delay, "Scheduling reconnect");
        countdown(&strong, attempt, delay).await;

        let mut inner = strong.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        match strong.establish(&mut inner).await {
            Ok(()) => {
                info!(attempt, "Reconnected");
                // This task is the one stored in reconnect_task
                inner.reconnect_task = None;
                return;
            }
            Err(e) if e.is_permanent() => {
                error!(error = %e, "Permanent failure while reconnecting");
                strong.set_state(ConnectionState::Error {
                    message: e.to_string(),
                });
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                generation = inner.generation;
            }
        }
    }
}

/// Sleep for `delay`, publishing the remaining whole seconds
async fn countdown(shared: &Shared, attempt: u32, delay: Duration) {
    let mut remaining = delay;
    while !remaining.is_zero() {
        let secs = remaining.as_secs_f64().ceil() as u64;
        shared.set_state(ConnectionState::Reconnecting {
            attempt,
            delay_secs: secs,
        });
        let step = remaining.min(Duration::from_secs(1));
        tokio::time::sleep(step).await;
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Reconnecting {
                attempt: 2,
                delay_secs: 4
            }
            .to_string(),
            "reconnecting (attempt 2, in 4s)"
        );
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting {
            attempt: 1,
            delay_secs: 1,
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"reconnecting","attempt":1,"delay_secs":1}"#);
    }
}
