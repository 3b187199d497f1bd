//! Realtime connection manager.
//!
//! One supervisor task per [`RealtimeManager::connect`] owns the channel. It
//! drives the heartbeat, forwards outbound frames, fans inbound envelopes out
//! to subscribers and, after an unintentional loss, reconnects with doubling
//! delay until the attempt budget runs out.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::RealtimeConfig;
use crate::envelope::Envelope;
use crate::error::RealtimeError;
use crate::transport::{Connection, Connector};

/// Lifecycle phase of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Handle returned by [`RealtimeManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Shared {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    subscribers: DashMap<String, Vec<(SubscriptionId, Handler)>>,
    next_subscription: AtomicU64,
    reconnect_attempts: AtomicU32,
    phase: watch::Sender<ConnectionPhase>,
}

impl Shared {
    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(from = %previous, to = %phase, "realtime phase change");
        }
    }

    fn dispatch(&self, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed realtime frame");
                return;
            }
        };

        // Clone the handler list out so handlers may (un)subscribe re-entrantly.
        let handlers: Vec<Handler> = self
            .subscribers
            .get(&envelope.tag)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| handler(&envelope.data)));
            if delivered.is_err() {
                tracing::error!(tag = %envelope.tag, "realtime subscriber panicked");
            }
        }
    }
}

struct Session {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Owner of one persistent realtime channel.
///
/// Cloning yields another handle to the same channel. Dropping every handle
/// stops the supervisor.
#[derive(Clone)]
pub struct RealtimeManager {
    shared: Arc<Shared>,
    session: Arc<Mutex<Option<Session>>>,
}

impl RealtimeManager {
    pub fn new(config: RealtimeConfig, connector: Arc<dyn Connector>) -> Self {
        let (phase, _) = watch::channel(ConnectionPhase::Closed);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                subscribers: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                reconnect_attempts: AtomicU32::new(0),
                phase,
            }),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Manager over the default WebSocket connector.
    #[cfg(feature = "websocket")]
    pub fn websocket(config: RealtimeConfig) -> Self {
        Self::new(config, Arc::new(crate::transport::WebSocketConnector))
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the channel to `address`.
    ///
    /// Resolves once the first attempt finishes. A failed first attempt is
    /// returned as an error but still counts as a loss, so reconnection goes
    /// on in the background. Any previous session is shut down first.
    pub async fn connect(&self, address: impl Into<String>) -> Result<(), RealtimeError> {
        let address = address.into();
        self.stop_session().await;

        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);
        self.shared.set_phase(ConnectionPhase::Connecting);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ready, ready_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            address,
            outbound_rx,
            shutdown_rx,
            ready,
        ));
        *self.lock_session() = Some(Session {
            outbound,
            shutdown,
            task,
        });

        ready_rx
            .await
            .unwrap_or_else(|_| Err(RealtimeError::ChannelLost("supervisor exited".into())))
    }

    /// Close the channel on purpose. No reconnect follows.
    pub async fn disconnect(&self) {
        self.stop_session().await;
        self.shared.set_phase(ConnectionPhase::Closed);
        tracing::info!("realtime channel closed");
    }

    async fn stop_session(&self) {
        let session = self.lock_session().take();
        let Some(session) = session else {
            return;
        };
        self.shared.set_phase(ConnectionPhase::Closing);
        drop(session.outbound);
        let _ = session.shutdown.send(true);
        if let Err(err) = session.task.await {
            if err.is_panic() {
                tracing::error!(error = %err, "realtime supervisor panicked");
            }
        }
    }

    /// Transmit `payload` under `tag`. Fails without queuing unless the channel is open.
    pub fn send(&self, tag: &str, payload: Value) -> Result<(), RealtimeError> {
        if self.phase() != ConnectionPhase::Open {
            tracing::warn!(tag, "realtime channel not open, dropping outbound message");
            return Err(RealtimeError::NotConnected);
        }
        let frame = Envelope::new(tag, payload).encode()?;
        let session = self.lock_session();
        let session = session.as_ref().ok_or(RealtimeError::NotConnected)?;
        session
            .outbound
            .send(frame)
            .map_err(|_| RealtimeError::ChannelLost("supervisor exited".into()))
    }

    /// Register `handler` for envelopes tagged `tag`.
    pub fn subscribe<F>(&self, tag: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);
        self.shared
            .subscribers
            .entry(tag.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, tag: &str, id: SubscriptionId) -> bool {
        let mut removed = false;
        let now_empty = match self.shared.subscribers.get_mut(tag) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|(sub, _)| *sub != id);
                removed = subs.len() != before;
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.shared.subscribers.remove_if(tag, |_, subs| subs.is_empty());
        }
        removed
    }

    pub fn subscriber_count(&self, tag: &str) -> usize {
        self.shared.subscribers.get(tag).map_or(0, |subs| subs.len())
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.shared.phase.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Open
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Phase change notifications.
    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.shared.phase.subscribe()
    }
}

impl fmt::Debug for RealtimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("config", &self.shared.config)
            .field("phase", &self.phase())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}

async fn supervise(
    shared: Arc<Shared>,
    address: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<(), RealtimeError>>,
) {
    let mut ready = Some(ready);

    loop {
        shared.set_phase(ConnectionPhase::Connecting);
        let attempt = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            attempt = shared.connector.connect(&address) => attempt,
        };

        match attempt {
            Ok(connection) => {
                shared.reconnect_attempts.store(0, Ordering::SeqCst);
                // Frames accepted just before a previous loss are not replayed.
                // Drained before Open so nothing sent after Open is discarded.
                while outbound.try_recv().is_ok() {}
                shared.set_phase(ConnectionPhase::Open);
                tracing::info!(address = %address, "realtime channel open");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                match run_session(&shared, connection, &mut outbound, &mut shutdown).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost(reason) => {
                        tracing::warn!(address = %address, reason = %reason, "realtime channel lost");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(address = %address, error = %err, "realtime connect failed");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(err));
                }
            }
        }

        let attempts = shared.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= shared.config.max_reconnect_attempts {
            tracing::warn!(
                address = %address,
                attempts,
                "reconnect budget exhausted, channel stays closed"
            );
            shared.set_phase(ConnectionPhase::Closed);
            return;
        }

        let attempt = attempts + 1;
        shared.reconnect_attempts.store(attempt, Ordering::SeqCst);
        let delay = shared.config.reconnect_delay(attempt);
        tracing::info!(
            address = %address,
            attempt,
            max_attempts = shared.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        shared.set_phase(ConnectionPhase::Connecting);
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session(
    shared: &Shared,
    connection: Connection,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let Connection {
        mut sink,
        mut stream,
    } = connection;

    let period = shared.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_reply_since: Option<Instant> = None;

    loop {
        let pong_deadline = shared
            .config
            .pong_timeout
            .zip(awaiting_reply_since)
            .map(|(timeout, since)| since + timeout);
        let deadline_sleep =
            tokio::time::sleep_until(pong_deadline.unwrap_or_else(|| Instant::now() + period));

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if let Err(err) = sink.close().await {
                    tracing::debug!(error = %err, "error closing realtime channel");
                }
                return SessionEnd::Shutdown;
            }
            frame = stream.next() => match frame {
                Some(Ok(text)) => {
                    awaiting_reply_since = None;
                    shared.dispatch(&text);
                }
                Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                None => return SessionEnd::Lost("closed by peer".into()),
            },
            Some(frame) = outbound.recv() => {
                if let Err(err) = sink.send(frame).await {
                    return SessionEnd::Lost(err.to_string());
                }
            }
            _ = heartbeat.tick() => {
                let ping = match Envelope::ping().encode() {
                    Ok(ping) => ping,
                    Err(err) => return SessionEnd::Lost(err.to_string()),
                };
                if let Err(err) = sink.send(ping).await {
                    return SessionEnd::Lost(err.to_string());
                }
                awaiting_reply_since.get_or_insert_with(Instant::now);
            }
            _ = deadline_sleep, if pong_deadline.is_some() => {
                return SessionEnd::Lost("no reply to heartbeat".into());
            }
        }
    }
}
