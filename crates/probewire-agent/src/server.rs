//! Accept loop and live-session tracking.
//!
//! The [`SessionRegistry`] owns the listening endpoint: it accepts
//! connections, runs the handshake, builds a channel and a [`Session`] per
//! peer, and tracks the live set. Eviction is driven exclusively by the
//! sessions' own [`SessionEvent::Disconnected`] notifications — the
//! registry never polls session state. When an accept timeout elapses with
//! no live sessions, the loop stops (idle shutdown), so the control surface
//! does not stay open forever once every peer has gone.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use probewire_core::channel::{Channel, ChannelConfig};
use probewire_core::protocol::{server_handshake, CommandRegistry, Scope};
use probewire_core::speculation::{SpeculationConfig, SpeculativeQueueManager};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::session::{Session, SessionEvent, SessionId};

/// Default control endpoint.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:2020";

/// Builds one session's collaborators; called per accepted connection with
/// that session's own speculation manager.
pub type ContextFactory =
    Box<dyn Fn(SessionId, Arc<SpeculativeQueueManager>) -> SessionContext + Send + Sync>;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Accept timeout; with zero live sessions, one elapsed timeout stops
    /// the loop.
    pub accept_timeout: Duration,
    /// Maximum concurrently connected sessions.
    pub max_sessions: usize,
    /// How long each session waits for an Exit acknowledgement.
    pub exit_ack_timeout: Duration,
    /// Speculation limits applied per session.
    pub speculation: SpeculationConfig,
    /// Server identifier sent in handshakes.
    pub server_info: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(30),
            max_sessions: 100,
            exit_ack_timeout: Duration::from_millis(500),
            speculation: SpeculationConfig::default(),
            server_info: format!("probewire-agent/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ServerConfig {
    /// Set the accept timeout.
    #[must_use]
    pub const fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the live-session bound.
    #[must_use]
    pub const fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the Exit acknowledgement timeout.
    #[must_use]
    pub const fn with_exit_ack_timeout(mut self, timeout: Duration) -> Self {
        self.exit_ack_timeout = timeout;
        self
    }

    /// Set per-session speculation limits.
    #[must_use]
    pub fn with_speculation(mut self, speculation: SpeculationConfig) -> Self {
        self.speculation = speculation;
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accepts connections and tracks live sessions.
pub struct SessionRegistry {
    config: ServerConfig,
    registry: Arc<CommandRegistry>,
    context_factory: ContextFactory,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl SessionRegistry {
    /// Creates a registry building per-session contexts through `factory`.
    #[must_use]
    pub fn new(config: ServerConfig, factory: ContextFactory) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry: Arc::new(CommandRegistry::catalog(Scope::Target)),
            context_factory: factory,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Ids of every live session.
    #[must_use]
    pub fn live_sessions(&self) -> Vec<SessionId> {
        lock(&self.sessions).keys().copied().collect()
    }

    /// Looks up a live session.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        lock(&self.sessions).get(&id).cloned()
    }

    /// Runs the accept loop until `stop` signals, the loop goes idle, or
    /// every event source closes. Live sessions are shut down with code 0 on
    /// the way out.
    pub async fn run(&self, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        // The receiver exists until the first run; a second concurrent run
        // would be a caller bug and simply returns.
        let Some(mut events) = lock(&self.events_rx).take() else {
            warn!("session registry is already running");
            return;
        };
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "accepting control connections");
        }

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("stop requested");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                accepted = tokio::time::timeout(self.config.accept_timeout, listener.accept()) => {
                    match accepted {
                        Ok(Ok((stream, peer))) => self.accept_session(stream, peer).await,
                        Ok(Err(err)) => warn!(error = %err, "accept failed"),
                        Err(_) => {
                            if self.session_count() == 0 {
                                info!(
                                    timeout_secs = self.config.accept_timeout.as_secs(),
                                    "no sessions and nothing accepted; idle shutdown"
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.shutdown_all().await;
        // Evictions triggered by the final shutdowns land here.
        while let Ok(event) = events.try_recv() {
            self.handle_event(event);
        }
        *lock(&self.events_rx) = Some(events);
    }

    /// Shuts down every live session with exit code 0.
    pub async fn shutdown_all(&self) {
        let snapshot: Vec<Arc<Session>> = lock(&self.sessions).values().cloned().collect();
        for session in snapshot {
            session.shutdown(0).await;
        }
    }

    async fn accept_session(&self, mut stream: TcpStream, peer: SocketAddr) {
        if self.session_count() >= self.config.max_sessions {
            warn!(%peer, max = self.config.max_sessions, "session limit reached; refusing");
            return;
        }
        let hello = match server_handshake(&mut stream, &self.config.server_info).await {
            Ok(hello) => hello,
            Err(err) => {
                warn!(%peer, error = %err, "handshake failed");
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (channel, reader) =
            Channel::new(stream, self.registry.clone(), ChannelConfig::default());
        let speculation = Arc::new(SpeculativeQueueManager::new(
            self.registry.clone(),
            self.config.speculation.clone(),
        ));
        let context = (self.context_factory)(id, speculation);
        let session = Session::connect(
            id,
            channel,
            reader,
            context,
            self.events_tx.clone(),
            self.config.exit_ack_timeout,
        );
        lock(&self.sessions).insert(id, session);
        info!(id, %peer, client = %hello.client_info, "session connected");
    }

    fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Disconnected { id } => {
                if lock(&self.sessions).remove(&id).is_some() {
                    debug!(id, "session evicted");
                }
            }
        }
    }
}
