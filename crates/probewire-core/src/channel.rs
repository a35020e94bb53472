//! Duplex command channel with response correlation.
//!
//! A [`Channel`] owns the outbound half of one peer connection: a bounded
//! queue drained by a single background writer task (the sole writer to the
//! transport, so frames from concurrent producers never interleave) and a
//! correlation map from `rx` to [`PendingResponse`]. The matching
//! [`ChannelReader`] owns the inbound half: a framed read loop that resolves
//! response-shaped commands internally and hands every other command to the
//! caller.
//!
//! # Ordering
//!
//! Commands enqueued by one producer are written in enqueue order; across
//! producers only queue FIFO semantics apply.
//!
//! # Backpressure
//!
//! The outbound queue is bounded (default [`DEFAULT_OUTBOUND_CAPACITY`],
//! sized to absorb probe bursts) and blocks producers when full — the same
//! policy for async senders, worker-thread senders, and speculative commits.
//!
//! # Close semantics
//!
//! Closing is idempotent: the writer drains still-queued commands
//! best-effort, every pending response resolves to "no value" so waiters
//! never block forever, and subsequent sends complete immediately with no
//! value. Dropping every [`Channel`] clone and the reader without closing is
//! equivalent: the writer holds no strong reference to the shared state, so
//! its queue ends, the task exits, and the transport is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::protocol::command::{Command, CommandPayload};
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::registry::CommandRegistry;
use crate::protocol::CommandCodec;

/// Default bound of the outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1_048_576;

/// Transport object the channel is built over.
trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Capacity of the bounded outbound queue.
    pub outbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl ChannelConfig {
    /// Set the outbound queue capacity.
    #[must_use]
    pub const fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }
}

/// A single-assignment future for a correlated reply.
///
/// Resolved exactly once: with the reply command, or with "no value" when
/// the channel closes first. A second resolution attempt is a no-op.
#[derive(Debug)]
pub struct PendingResponse {
    rx: i32,
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Waiting(oneshot::Receiver<Option<Command>>),
    Resolved(Option<Command>),
}

impl PendingResponse {
    fn waiting(rx: i32, receiver: oneshot::Receiver<Option<Command>>) -> Self {
        Self {
            rx,
            state: PendingState::Waiting(receiver),
        }
    }

    fn no_value(rx: i32) -> Self {
        Self {
            rx,
            state: PendingState::Resolved(None),
        }
    }

    /// Sequence number of the command this response is keyed to.
    #[must_use]
    pub const fn rx(&self) -> i32 {
        self.rx
    }

    /// Waits for the reply.
    ///
    /// Returns `Ok(Some(command))` with the reply, `Ok(None)` when the
    /// channel closed (or the command never expected a reply), and
    /// [`ProtocolError::Timeout`] when `timeout` elapses first. A timeout is
    /// local to this caller; the channel stays open.
    pub async fn get(self, timeout: Duration) -> ProtocolResult<Option<Command>> {
        match self.state {
            PendingState::Resolved(value) => Ok(value),
            PendingState::Waiting(receiver) => {
                match tokio::time::timeout(timeout, receiver).await {
                    Err(_) => Err(ProtocolError::timeout(timeout.as_millis() as u64)),
                    // Sender dropped: the channel closed without resolving.
                    Ok(Err(_)) => Ok(None),
                    Ok(Ok(value)) => Ok(value),
                }
            }
        }
    }
}

struct ChannelShared {
    registry: Arc<CommandRegistry>,
    closed: AtomicBool,
    outbound: mpsc::Sender<Command>,
    pending: Mutex<HashMap<i32, oneshot::Sender<Option<Command>>>>,
    shutdown_signal: Mutex<Option<oneshot::Sender<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelShared {
    /// Idempotent close: stop the writer (it drains best-effort), then
    /// resolve every still-pending response to "no value".
    fn begin_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(signal) = lock(&self.shutdown_signal).take() {
            let _ = signal.send(());
        }
        self.resolve_all_no_value();
    }

    fn resolve_all_no_value(&self) {
        let waiters: Vec<_> = lock(&self.pending).drain().collect();
        for (_, sender) in waiters {
            let _ = sender.send(None);
        }
    }

    /// Resolves the pending response keyed by `tx`, if any. A second
    /// resolution for the same key finds no entry and is a no-op.
    fn resolve(&self, tx: i32, command: Command) {
        let sender = lock(&self.pending).remove(&tx);
        match sender {
            Some(sender) => {
                let _ = sender.send(Some(command));
            }
            None => debug!(tx, "no pending response for reply; dropping"),
        }
    }
}

/// The outbound half of a peer connection. Cheap to clone; all clones share
/// the same queue, correlation map, and closed flag.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Builds a channel over `transport`, spawning the background writer.
    ///
    /// Returns the channel plus its [`ChannelReader`]; the reader must be
    /// driven (typically by a session's read loop) for response correlation
    /// to work.
    pub fn new<S>(
        transport: S,
        registry: Arc<CommandRegistry>,
        config: ChannelConfig,
    ) -> (Self, ChannelReader)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedTransport = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(boxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let shared = Arc::new(ChannelShared {
            registry: registry.clone(),
            closed: AtomicBool::new(false),
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            shutdown_signal: Mutex::new(Some(shutdown_tx)),
            writer: Mutex::new(None),
        });

        // The writer holds only a weak reference: once every channel clone
        // and the reader are gone the shared state (and its queue sender)
        // drops, the queue ends, and the task exits instead of leaking.
        let sink = FramedWrite::new(write_half, CommandCodec::new(registry.clone()));
        let writer = tokio::spawn(write_loop(
            outbound_rx,
            shutdown_rx,
            sink,
            Arc::downgrade(&shared),
        ));
        *lock(&shared.writer) = Some(writer);

        let reader = ChannelReader {
            framed: FramedRead::new(read_half, CommandCodec::new(registry)),
            shared: shared.clone(),
        };

        (Self { shared }, reader)
    }

    /// The registry this channel builds commands with.
    #[must_use]
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.shared.registry
    }

    /// Whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Builds a command from `payload` and enqueues it.
    ///
    /// When the command's kind expects a reply, the returned
    /// [`PendingResponse`] resolves on arrival of the correlated response;
    /// otherwise (and on an already-closed channel) it is immediately
    /// resolved with no value.
    ///
    /// Blocks briefly when the outbound queue is at capacity.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnregisteredKind`] when the payload's kind is not in
    /// this scope's catalog — a local configuration error.
    pub async fn send(&self, payload: CommandPayload) -> ProtocolResult<PendingResponse> {
        if self.is_closed() {
            return Ok(PendingResponse::no_value(-1));
        }
        let command = self.create(payload)?;
        let pending = self.register_pending(&command);
        let rx = command.rx();
        if self.shared.outbound.send(command).await.is_err() {
            // Writer gone: behave as a closed channel.
            self.shared.begin_close();
            return Ok(PendingResponse::no_value(rx));
        }
        Ok(pending)
    }

    /// [`Channel::send`] for OS worker threads outside the async runtime,
    /// e.g. probe threads emitting trace events.
    ///
    /// # Panics
    ///
    /// Must not be called from an async context (it blocks the thread while
    /// the queue is full).
    pub fn send_from_worker(&self, payload: CommandPayload) -> ProtocolResult<PendingResponse> {
        if self.is_closed() {
            return Ok(PendingResponse::no_value(-1));
        }
        let command = self.create(payload)?;
        let pending = self.register_pending(&command);
        let rx = command.rx();
        if self.shared.outbound.blocking_send(command).is_err() {
            self.shared.begin_close();
            return Ok(PendingResponse::no_value(rx));
        }
        Ok(pending)
    }

    /// Enqueues an already-built command from a worker thread, without
    /// registering a response. Used by probe emission handles and by the
    /// speculation manager when committing a buffer onto the main queue.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ChannelClosed`] once the channel is closed.
    pub fn enqueue_from_worker(&self, command: Command) -> ProtocolResult<()> {
        if self.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }
        self.shared
            .outbound
            .blocking_send(command)
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Builds and enqueues a response to `original`.
    ///
    /// Responses never register a [`PendingResponse`]: replies do not expect
    /// replies.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ChannelClosed`] once the channel is closed;
    /// [`ProtocolError::UnregisteredKind`] for an unknown kind.
    pub async fn send_response(
        &self,
        original: &Command,
        payload: CommandPayload,
    ) -> ProtocolResult<()> {
        if self.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }
        let response = self
            .shared
            .registry
            .create_response(payload.clone(), original.rx())
            .ok_or(ProtocolError::UnregisteredKind {
                kind: payload.kind(),
            })?;
        self.shared
            .outbound
            .send(response)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Idempotent close: stops the writer after a best-effort drain of the
    /// queue, resolves every pending response to "no value", and releases
    /// the transport. Does not wait for the writer; see
    /// [`Channel::shutdown`].
    pub fn close(&self) {
        self.shared.begin_close();
    }

    /// [`Channel::close`], then wait for the writer to drain and the
    /// transport to be released.
    pub async fn shutdown(&self) {
        self.shared.begin_close();
        let writer = lock(&self.shared.writer).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    fn create(&self, payload: CommandPayload) -> ProtocolResult<Command> {
        let kind = payload.kind();
        self.shared
            .registry
            .create(payload)
            .ok_or(ProtocolError::UnregisteredKind { kind })
    }

    fn register_pending(&self, command: &Command) -> PendingResponse {
        if !command.needs_response() {
            return PendingResponse::no_value(command.rx());
        }
        let (sender, receiver) = oneshot::channel();
        lock(&self.shared.pending).insert(command.rx(), sender);
        // A close racing past the caller's entry check drains the map before
        // the insert above lands. Re-checking here means either the drain
        // saw the entry or this check sees the flag; the entry never
        // outlives the close.
        if self.is_closed() {
            lock(&self.shared.pending).remove(&command.rx());
            return PendingResponse::no_value(command.rx());
        }
        PendingResponse::waiting(command.rx(), receiver)
    }
}

/// The inbound half of a peer connection.
pub struct ChannelReader {
    framed: FramedRead<ReadHalf<BoxedTransport>, CommandCodec>,
    shared: Arc<ChannelShared>,
}

impl ChannelReader {
    /// Reads the next non-response command from the transport.
    ///
    /// Response-shaped commands are consumed internally: each resolves the
    /// matching [`PendingResponse`] and the read continues. On any failure
    /// the channel is closed before the error is returned:
    /// [`ProtocolError::EndOfStream`] for a cleanly closed peer, decode or
    /// I/O variants otherwise.
    pub async fn read_command(&mut self) -> ProtocolResult<Command> {
        loop {
            match self.framed.next().await {
                None => {
                    self.shared.begin_close();
                    return Err(ProtocolError::EndOfStream);
                }
                Some(Err(err)) => {
                    self.shared.begin_close();
                    return Err(err);
                }
                Some(Ok(command)) if command.is_response() => {
                    self.shared.resolve(command.tx(), command);
                }
                Some(Ok(command)) => return Ok(command),
            }
        }
    }
}

async fn write_loop(
    mut outbound: mpsc::Receiver<Command>,
    mut shutdown: oneshot::Receiver<()>,
    mut sink: FramedWrite<WriteHalf<BoxedTransport>, CommandCodec>,
    shared: Weak<ChannelShared>,
) {
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(command) => {
                    if let Err(err) = sink.send(command).await {
                        warn!(error = %err, "transport write failed; closing channel");
                        if let Some(shared) = shared.upgrade() {
                            shared.begin_close();
                        }
                        break;
                    }
                }
                // Every producer handle dropped.
                None => break,
            },
            _ = &mut shutdown => {
                // Best-effort drain of commands queued before the close.
                while let Ok(command) = outbound.try_recv() {
                    if sink.send(command).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let mut transport = sink.into_inner();
    let _ = transport.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::ResponseValue;
    use crate::protocol::registry::Scope;

    fn pair() -> ((Channel, ChannelReader), (Channel, ChannelReader)) {
        let (left, right) = tokio::io::duplex(1 << 16);
        let control = Channel::new(
            left,
            Arc::new(CommandRegistry::catalog(Scope::Control)),
            ChannelConfig::default(),
        );
        let target = Channel::new(
            right,
            Arc::new(CommandRegistry::catalog(Scope::Target)),
            ChannelConfig::default(),
        );
        (control, target)
    }

    async fn read_with_deadline(reader: &mut ChannelReader) -> Command {
        tokio::time::timeout(Duration::from_secs(1), reader.read_command())
            .await
            .expect("read deadline")
            .expect("read")
    }

    #[tokio::test]
    async fn single_producer_order_is_preserved() {
        let ((control, _control_reader), (_target, mut target_reader)) = pair();

        for name in ["first", "second", "third"] {
            control
                .send(CommandPayload::Event { name: name.into() })
                .await
                .unwrap();
        }

        for expected in ["first", "second", "third"] {
            let command = read_with_deadline(&mut target_reader).await;
            assert_eq!(
                command.payload(),
                &CommandPayload::Event {
                    name: expected.into()
                }
            );
        }
    }

    #[tokio::test]
    async fn response_resolves_pending_with_matching_tx() {
        let ((control, mut control_reader), (target, mut target_reader)) = pair();

        // Someone must drive the control-side reader for correlation.
        tokio::spawn(async move { while control_reader.read_command().await.is_ok() {} });

        let pending = control.send(CommandPayload::Status).await.unwrap();
        let request_rx = pending.rx();

        let request = read_with_deadline(&mut target_reader).await;
        assert_eq!(request.rx(), request_rx);
        assert!(request.needs_response());

        target
            .send_response(
                &request,
                CommandPayload::Response {
                    value: ResponseValue::Text("state=connected".into()),
                },
            )
            .await
            .unwrap();

        let reply = pending
            .get(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("resolved");
        assert_eq!(reply.tx(), request_rx);
        assert!(reply.is_response());
    }

    #[tokio::test]
    async fn duplicate_response_is_a_noop() {
        let ((control, mut control_reader), (target, mut target_reader)) = pair();
        tokio::spawn(async move { while control_reader.read_command().await.is_ok() {} });

        let pending = control.send(CommandPayload::Status).await.unwrap();
        let request = read_with_deadline(&mut target_reader).await;

        for _ in 0..2 {
            target
                .send_response(
                    &request,
                    CommandPayload::Response {
                        value: ResponseValue::Ack,
                    },
                )
                .await
                .unwrap();
        }

        // First reply resolves; the second finds no pending entry and is
        // silently dropped.
        let reply = pending.get(Duration::from_secs(1)).await.unwrap();
        assert!(reply.is_some());
    }

    #[tokio::test]
    async fn response_timeout_is_local_and_recoverable() {
        let ((control, _control_reader), _target) = pair();
        let pending = control.send(CommandPayload::Status).await.unwrap();
        let err = pending.get(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(!control.is_closed());
    }

    #[tokio::test]
    async fn close_resolves_pending_to_no_value() {
        let ((control, _control_reader), _target) = pair();
        let pending = control.send(CommandPayload::Status).await.unwrap();
        control.close();
        let value = pending.get(Duration::from_secs(1)).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn send_on_closed_channel_resolves_immediately() {
        let ((control, _control_reader), _target) = pair();
        control.shutdown().await;
        let pending = control.send(CommandPayload::Status).await.unwrap();
        assert!(pending.get(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_response_on_closed_channel_fails() {
        let ((control, _control_reader), (target, mut target_reader)) = pair();
        control.send(CommandPayload::Status).await.unwrap();
        let request = read_with_deadline(&mut target_reader).await;
        target.shutdown().await;
        let err = target
            .send_response(
                &request,
                CommandPayload::Response {
                    value: ResponseValue::Ack,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ChannelClosed));
    }

    #[tokio::test]
    async fn peer_shutdown_reads_as_end_of_stream() {
        let ((control, control_reader), (target, mut target_reader)) = pair();
        drop(control_reader);
        control.shutdown().await;
        drop(control);

        let err = tokio::time::timeout(Duration::from_secs(1), target_reader.read_command())
            .await
            .expect("read deadline")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::EndOfStream));
        assert!(target.is_closed());
    }

    #[tokio::test]
    async fn close_flushes_queued_commands_best_effort() {
        let ((control, _control_reader), (_target, mut target_reader)) = pair();
        control
            .send(CommandPayload::Message {
                text: "queued before close".into(),
            })
            .await
            .unwrap();
        control.shutdown().await;

        let command = read_with_deadline(&mut target_reader).await;
        assert_eq!(
            command.payload(),
            &CommandPayload::Message {
                text: "queued before close".into()
            }
        );
    }

    #[tokio::test]
    async fn worker_send_preserves_order_from_a_blocking_thread() {
        let ((control, _control_reader), (_target, mut target_reader)) = pair();

        let worker = control.clone();
        tokio::task::spawn_blocking(move || {
            for name in ["w-first", "w-second", "w-third"] {
                worker
                    .send_from_worker(CommandPayload::Event { name: name.into() })
                    .unwrap();
            }
        })
        .await
        .unwrap();

        for expected in ["w-first", "w-second", "w-third"] {
            let command = read_with_deadline(&mut target_reader).await;
            assert_eq!(
                command.payload(),
                &CommandPayload::Event {
                    name: expected.into()
                }
            );
        }
    }

    #[tokio::test]
    async fn worker_send_on_closed_channel_resolves_immediately() {
        let ((control, _control_reader), _target) = pair();
        control.shutdown().await;

        let worker = control.clone();
        let pending = tokio::task::spawn_blocking(move || {
            worker.send_from_worker(CommandPayload::Status).unwrap()
        })
        .await
        .unwrap();
        assert!(pending.get(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_racing_with_sends_never_strands_a_waiter() {
        // Repeat to vary the interleaving between the sender task and the
        // close; every pending must resolve regardless of who wins.
        for _ in 0..50 {
            let ((control, _control_reader), _target) = pair();

            let sender = {
                let control = control.clone();
                tokio::spawn(async move {
                    let mut pendings = Vec::new();
                    for _ in 0..8 {
                        pendings.push(control.send(CommandPayload::Status).await.unwrap());
                    }
                    pendings
                })
            };
            control.close();

            for pending in sender.await.unwrap() {
                // A strand shows up as a Timeout here.
                let value = pending.get(Duration::from_millis(500)).await.unwrap();
                assert!(value.is_none());
            }
        }
    }

    #[tokio::test]
    async fn dropping_all_handles_releases_the_transport() {
        let ((control, control_reader), (_target, mut target_reader)) = pair();

        // No close, no shutdown: dropping the handles alone must stop the
        // writer and release the transport, which the peer sees as EOF.
        drop(control_reader);
        drop(control);

        let err = tokio::time::timeout(Duration::from_secs(1), target_reader.read_command())
            .await
            .expect("read deadline")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::EndOfStream));
    }

    #[tokio::test]
    async fn unregistered_kind_is_a_local_error() {
        let (left, _right) = tokio::io::duplex(1 << 16);
        let (channel, _reader) = Channel::new(
            left,
            Arc::new(CommandRegistry::new(Scope::Control)),
            ChannelConfig::default(),
        );
        let err = channel.send(CommandPayload::Status).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnregisteredKind { .. }));
        assert!(err.is_recoverable());
    }
}
