//! Per-connection session lifecycle.
//!
//! A [`Session`] is the target-side representation of one connected control
//! process: a compare-and-swap guarded state machine driving a read loop
//! over the session's channel. Every transition is raced through the atomic
//! state; only the caller that wins the CAS runs the associated side effects
//! (sending Exit, cancelling the read loop, closing the channel), so
//! concurrent shutdown and detach attempts collapse into exactly one
//! cleanup sequence.
//!
//! The registry learns about the terminal transition through a typed event
//! channel handed in at construction, which is its only eviction trigger.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use probewire_core::channel::{Channel, ChannelReader};
use probewire_core::protocol::{CommandPayload, ProtocolError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{ProbeOutput, SessionContext};
use crate::dispatch::{self, Disposition};

/// Identifies one session within its registry.
pub type SessionId = u64;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Terminal: the session is gone and its resources released.
    Disconnected = 0,
    /// The read loop is live and commands flow.
    Connected = 1,
    /// Cleanup is in flight.
    Disconnecting = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications a session emits to its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session reached its terminal state; evict it.
    Disconnected {
        /// The finished session.
        id: SessionId,
    },
}

/// Local cleanup run on detach, in place of notifying the peer.
pub type DetachHook = Box<dyn FnOnce() + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One connected peer.
pub struct Session {
    id: SessionId,
    state: AtomicU8,
    channel: Channel,
    context: SessionContext,
    events: mpsc::UnboundedSender<SessionEvent>,
    exit_ack_timeout: Duration,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Builds a connected session over an established, handshaken channel
    /// and starts its read loop.
    #[must_use]
    pub fn connect(
        id: SessionId,
        channel: Channel,
        reader: ChannelReader,
        context: SessionContext,
        events: mpsc::UnboundedSender<SessionEvent>,
        exit_ack_timeout: Duration,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            state: AtomicU8::new(SessionState::Connected as u8),
            channel,
            context,
            events,
            exit_ack_timeout,
            read_task: Mutex::new(None),
        });
        let task = tokio::spawn(read_loop(session.clone(), reader));
        *lock(&session.read_task) = Some(task);
        session
    }

    /// This session's id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The channel this session talks over.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The collaborators this session's handlers run against.
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Creates an emission handle for one probe worker thread.
    #[must_use]
    pub fn probe_output(&self) -> ProbeOutput {
        ProbeOutput::new(self.channel.clone(), self.context.speculation.clone())
    }

    /// Ends the session, telling the peer why.
    ///
    /// Sends Exit carrying `code`, waits a bounded time for the
    /// acknowledgement, then cleans up regardless. A concurrent transition
    /// makes this a no-op.
    pub async fn shutdown(&self, code: i32) {
        if !self.begin_disconnect() {
            return;
        }
        match self.channel.send(CommandPayload::Exit { code }).await {
            Ok(pending) => {
                if let Err(err) = pending.get(self.exit_ack_timeout).await {
                    debug!(id = self.id, error = %err, "peer did not acknowledge Exit");
                }
            }
            Err(err) => debug!(id = self.id, error = %err, "Exit not sent"),
        }
        self.finish(true).await;
    }

    /// Ends the session without notifying the peer, running `hook` for
    /// local cleanup. A concurrent transition makes this a no-op (and the
    /// hook does not run).
    pub async fn detach(&self, hook: Option<DetachHook>) {
        if !self.begin_disconnect() {
            return;
        }
        if let Some(hook) = hook {
            hook();
        }
        self.finish(true).await;
    }

    /// CAS `Connected -> Disconnecting`; only the winner cleans up.
    fn begin_disconnect(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                SessionState::Connected as u8,
                SessionState::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !won {
            debug!(id = self.id, state = %self.state(), "disconnect already in flight");
        }
        won
    }

    /// Cleanup after a won CAS: stop the read loop, close the channel,
    /// reach the terminal state, notify the registry.
    async fn finish(&self, cancel_read_loop: bool) {
        let task = lock(&self.read_task).take();
        if let Some(task) = task {
            if cancel_read_loop {
                task.abort();
            }
            // When called from the read loop itself the handle is simply
            // dropped; that task is already returning.
        }
        self.channel.shutdown().await;
        self.state
            .store(SessionState::Disconnected as u8, Ordering::SeqCst);
        info!(id = self.id, "session disconnected");
        let _ = self.events.send(SessionEvent::Disconnected { id: self.id });
    }

    /// Disconnect path taken by the read loop: it must not cancel itself.
    async fn end_from_read_loop(&self) {
        if self.begin_disconnect() {
            self.finish(false).await;
        }
    }
}

async fn read_loop(session: Arc<Session>, mut reader: ChannelReader) {
    loop {
        if session.state() != SessionState::Connected {
            return;
        }
        let command = match reader.read_command().await {
            Ok(command) => command,
            Err(ProtocolError::EndOfStream) => {
                debug!(id = session.id, "peer closed the stream");
                session.end_from_read_loop().await;
                return;
            }
            Err(err) => {
                warn!(id = session.id, error = %err, "session read failed");
                session.end_from_read_loop().await;
                return;
            }
        };
        match dispatch::execute(&session.context, &session.channel, &command).await {
            Ok(Disposition::Continue) => {}
            Ok(Disposition::Disconnect { code }) => {
                info!(id = session.id, code, "session ending at peer request");
                session.end_from_read_loop().await;
                return;
            }
            // One bad command must not kill the loop.
            Err(err) => warn!(id = session.id, error = %err, "command handler failed"),
        }
    }
}
