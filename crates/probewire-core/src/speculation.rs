//! Speculative event buffering.
//!
//! A probe can route the events it emits into an isolated buffer and decide
//! later whether the whole buffer reaches the control process
//! ([`SpeculativeQueueManager::commit`]) or vanishes
//! ([`SpeculativeQueueManager::discard`]). Capture order inside a buffer is
//! preserved on commit; relative to concurrent non-speculative events the
//! committed batch lands at the tail of the main queue in commit order.
//!
//! Which buffer a worker captures into is carried in an explicit
//! [`SpeculationContext`] owned by that worker, passed by reference into
//! [`SpeculativeQueueManager::capture`]. There is no hidden thread-local
//! state. The manager itself keeps one entry lock per buffer; the outer map
//! lock is held only for id allocation and entry removal, never while a
//! buffer is appended to.
//!
//! # Overflow
//!
//! A buffer that grows past [`SpeculationConfig::buffer_capacity`] is
//! replaced by a single diagnostic [`Message`](CommandPayload::Message)
//! naming the speculation id; later captures into it are swallowed. This is
//! deliberately different from the main outbound queue, which blocks the
//! producer when full: a speculative buffer is provisional data, so degrading
//! it to a diagnostic is preferable to stalling a probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::protocol::command::{Command, CommandPayload};
use crate::protocol::error::ProtocolError;
use crate::protocol::registry::CommandRegistry;

/// Sentinel returned by [`SpeculativeQueueManager::speculation`] when the
/// concurrent-speculation bound is exhausted. Not an error: callers fall
/// back to sending events directly.
pub const SPECULATION_UNAVAILABLE: i32 = -1;

/// Default bound on concurrently live speculations.
pub const DEFAULT_MAX_SPECULATIONS: usize = 1000;

/// Default per-buffer capacity in commands.
pub const DEFAULT_BUFFER_CAPACITY: usize = 32_767;

/// Speculation limits.
#[derive(Debug, Clone)]
pub struct SpeculationConfig {
    /// Maximum number of live speculations at once.
    pub max_speculations: usize,
    /// Maximum commands per buffer before it degrades to a diagnostic.
    pub buffer_capacity: usize,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            max_speculations: DEFAULT_MAX_SPECULATIONS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl SpeculationConfig {
    /// Set the live-speculation bound.
    #[must_use]
    pub const fn with_max_speculations(mut self, max: usize) -> Self {
        self.max_speculations = max;
        self
    }

    /// Set the per-buffer command capacity.
    #[must_use]
    pub const fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

/// Speculation usage errors: programmer mistakes surfaced synchronously to
/// the calling worker. They never affect other speculations or the channel.
#[derive(Debug, Error)]
pub enum SpeculationError {
    /// The id was never allocated, or was already committed or discarded.
    #[error("unknown speculation id {id}")]
    UnknownId {
        /// The offending id.
        id: i32,
    },

    /// The channel rejected the committed commands.
    #[error("speculation commit failed: {0}")]
    Channel(#[from] ProtocolError),
}

/// Per-worker marker of the speculation currently being captured into.
///
/// Each worker (probe thread, dispatch task) owns one and passes it to
/// [`SpeculativeQueueManager::capture`]. At most one id is active at a time.
#[derive(Debug, Default)]
pub struct SpeculationContext {
    active: Option<i32>,
}

impl SpeculationContext {
    /// Creates a context with no active speculation.
    #[must_use]
    pub const fn new() -> Self {
        Self { active: None }
    }

    /// The id this worker is currently capturing into, if any.
    #[must_use]
    pub const fn active(&self) -> Option<i32> {
        self.active
    }

    /// Clears the active speculation without touching its buffer.
    pub fn clear(&mut self) {
        self.active = None;
    }
}

#[derive(Default)]
struct SpeculationBuffer {
    commands: Vec<Command>,
    overflowed: bool,
}

/// Buffering engine between "event is ready" and "event enters the main
/// queue". One per session.
pub struct SpeculativeQueueManager {
    registry: Arc<CommandRegistry>,
    config: SpeculationConfig,
    buffers: Mutex<HashMap<i32, Arc<Mutex<SpeculationBuffer>>>>,
    next_id: Mutex<i32>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SpeculativeQueueManager {
    /// Creates a manager building diagnostics through `registry`.
    #[must_use]
    pub fn new(registry: Arc<CommandRegistry>, config: SpeculationConfig) -> Self {
        Self {
            registry,
            config,
            buffers: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Allocates a fresh speculation id with an empty buffer.
    ///
    /// Returns [`SPECULATION_UNAVAILABLE`] when
    /// [`SpeculationConfig::max_speculations`] buffers are already live;
    /// callers must treat that as "speculation unavailable" and send events
    /// directly.
    pub fn speculation(&self) -> i32 {
        let mut buffers = lock(&self.buffers);
        if buffers.len() >= self.config.max_speculations {
            warn!(
                live = buffers.len(),
                "speculation bound exhausted; returning unavailable"
            );
            return SPECULATION_UNAVAILABLE;
        }
        let mut next_id = lock(&self.next_id);
        *next_id += 1;
        let id = *next_id;
        buffers.insert(id, Arc::new(Mutex::new(SpeculationBuffer::default())));
        id
    }

    /// Marks `context`'s worker as capturing into `id`, replacing any
    /// previously active id.
    ///
    /// # Errors
    ///
    /// [`SpeculationError::UnknownId`] when `id` is not live (including the
    /// [`SPECULATION_UNAVAILABLE`] sentinel).
    pub fn speculate(
        &self,
        context: &mut SpeculationContext,
        id: i32,
    ) -> Result<(), SpeculationError> {
        if !lock(&self.buffers).contains_key(&id) {
            return Err(SpeculationError::UnknownId { id });
        }
        context.active = Some(id);
        Ok(())
    }

    /// Offers `command` for capture.
    ///
    /// Returns `None` when the command was captured into the worker's active
    /// buffer; the caller must not send it. Returns the command back when the
    /// worker is not speculating, the command's kind cannot be speculated, or
    /// the active id is stale (already committed or discarded) — the caller
    /// sends it normally.
    #[must_use]
    pub fn capture(&self, context: &SpeculationContext, command: Command) -> Option<Command> {
        let Some(id) = context.active else {
            return Some(command);
        };
        if !command.can_be_speculated() {
            return Some(command);
        }
        let Some(buffer) = lock(&self.buffers).get(&id).cloned() else {
            debug!(id, "stale speculation context; sending directly");
            return Some(command);
        };

        let mut buffer = lock(&buffer);
        if buffer.overflowed {
            // Already degraded: swallow.
            return None;
        }
        if buffer.commands.len() >= self.config.buffer_capacity {
            self.overflow(id, &mut buffer);
            return None;
        }
        buffer.commands.push(command);
        None
    }

    /// Replaces the buffer contents with one diagnostic naming the id.
    fn overflow(&self, id: i32, buffer: &mut SpeculationBuffer) {
        warn!(
            id,
            capacity = self.config.buffer_capacity,
            "speculation buffer overflowed; replacing with diagnostic"
        );
        buffer.commands.clear();
        let diagnostic = self.registry.create(CommandPayload::Message {
            text: format!(
                "speculation {id} overflowed its buffer ({} commands); contents dropped",
                self.config.buffer_capacity
            ),
        });
        if let Some(diagnostic) = diagnostic {
            buffer.commands.push(diagnostic);
        }
        buffer.overflowed = true;
    }

    /// Commits the buffer for `id`: clears the worker's active marker, then
    /// moves every buffered command, in capture order, onto `channel`'s main
    /// queue.
    ///
    /// Blocks briefly when the main queue is at capacity; call from worker
    /// threads, not async tasks.
    ///
    /// # Errors
    ///
    /// [`SpeculationError::UnknownId`] for an id that is not live;
    /// [`SpeculationError::Channel`] when the channel closed mid-commit (the
    /// remaining commands are dropped).
    pub fn commit(
        &self,
        context: &mut SpeculationContext,
        id: i32,
        channel: &Channel,
    ) -> Result<(), SpeculationError> {
        context.clear();
        let buffer = lock(&self.buffers)
            .remove(&id)
            .ok_or(SpeculationError::UnknownId { id })?;
        let commands = std::mem::take(&mut lock(&buffer).commands);
        for command in commands {
            channel.enqueue_from_worker(command)?;
        }
        Ok(())
    }

    /// Discards the buffer for `id`: clears the worker's active marker and
    /// drops every buffered command.
    ///
    /// # Errors
    ///
    /// [`SpeculationError::UnknownId`] for an id that is not live.
    pub fn discard(
        &self,
        context: &mut SpeculationContext,
        id: i32,
    ) -> Result<(), SpeculationError> {
        context.clear();
        lock(&self.buffers)
            .remove(&id)
            .map(drop)
            .ok_or(SpeculationError::UnknownId { id })
    }

    /// Number of live speculations.
    #[must_use]
    pub fn live_speculations(&self) -> usize {
        lock(&self.buffers).len()
    }

    /// Number of commands buffered for `id`, or `None` if it is not live.
    #[must_use]
    pub fn buffered_len(&self, id: i32) -> Option<usize> {
        let buffer = lock(&self.buffers).get(&id).cloned()?;
        let len = lock(&buffer).commands.len();
        Some(len)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::{ChannelConfig, ChannelReader};
    use crate::protocol::registry::Scope;

    fn manager(config: SpeculationConfig) -> SpeculativeQueueManager {
        SpeculativeQueueManager::new(Arc::new(CommandRegistry::catalog(Scope::Target)), config)
    }

    fn event(manager: &SpeculativeQueueManager, name: &str) -> Command {
        manager
            .registry
            .create(CommandPayload::Event { name: name.into() })
            .unwrap()
    }

    #[test]
    fn exhausted_bound_returns_unavailable_sentinel() {
        let manager = manager(SpeculationConfig::default().with_max_speculations(2));
        let first = manager.speculation();
        let second = manager.speculation();
        assert!(first > 0 && second > 0 && first != second);
        assert_eq!(manager.speculation(), SPECULATION_UNAVAILABLE);

        // Retiring one frees a slot.
        let mut context = SpeculationContext::new();
        manager.discard(&mut context, first).unwrap();
        assert_ne!(manager.speculation(), SPECULATION_UNAVAILABLE);
    }

    #[test]
    fn capture_requires_active_context_and_speculatable_kind() {
        let manager = manager(SpeculationConfig::default());
        let id = manager.speculation();
        let mut context = SpeculationContext::new();

        // Inactive context: command comes back for direct send.
        let cmd = event(&manager, "before-speculate");
        assert!(manager.capture(&context, cmd).is_some());

        manager.speculate(&mut context, id).unwrap();
        let cmd = event(&manager, "captured");
        assert!(manager.capture(&context, cmd).is_none());
        assert_eq!(manager.buffered_len(id), Some(1));

        // Instrument is not a speculatable kind.
        let install = manager
            .registry
            .create(CommandPayload::Instrument {
                code: vec![0xCA],
                args: vec![],
            })
            .unwrap();
        assert!(manager.capture(&context, install).is_some());
        assert_eq!(manager.buffered_len(id), Some(1));
    }

    #[test]
    fn stale_context_falls_back_to_direct_send() {
        let manager = manager(SpeculationConfig::default());
        let id = manager.speculation();
        let mut context = SpeculationContext::new();
        manager.speculate(&mut context, id).unwrap();
        manager.discard(&mut SpeculationContext::new(), id).unwrap();

        // The worker's marker still names the dead id.
        assert_eq!(context.active(), Some(id));
        let cmd = event(&manager, "late");
        assert!(manager.capture(&context, cmd).is_some());
    }

    #[test]
    fn speculate_on_unknown_id_is_an_error() {
        let manager = manager(SpeculationConfig::default());
        let mut context = SpeculationContext::new();
        assert!(matches!(
            manager.speculate(&mut context, 42),
            Err(SpeculationError::UnknownId { id: 42 })
        ));
        assert!(matches!(
            manager.speculate(&mut context, SPECULATION_UNAVAILABLE),
            Err(SpeculationError::UnknownId { .. })
        ));
        assert!(context.active().is_none());
    }

    #[tokio::test]
    async fn overflow_degrades_to_a_single_diagnostic() {
        let ((target, _target_reader), (_control, mut control_reader)) = channel_pair();
        let manager = Arc::new(manager(SpeculationConfig::default().with_buffer_capacity(3)));

        let worker_manager = manager.clone();
        let worker_channel = target.clone();
        let id = tokio::task::spawn_blocking(move || {
            let mut context = SpeculationContext::new();
            let id = worker_manager.speculation();
            worker_manager.speculate(&mut context, id).unwrap();

            // Capture never fails for the worker, even past capacity.
            for i in 0..6 {
                let cmd = event(&worker_manager, &format!("e{i}"));
                assert!(worker_manager.capture(&context, cmd).is_none());
            }
            assert_eq!(worker_manager.buffered_len(id), Some(1));

            worker_manager.commit(&mut context, id, &worker_channel).unwrap();
            id
        })
        .await
        .unwrap();

        // The buffered events are gone; what commits is one diagnostic that
        // names the overflowed speculation.
        let command = tokio::time::timeout(Duration::from_secs(1), control_reader.read_command())
            .await
            .expect("read deadline")
            .expect("read");
        match command.payload() {
            CommandPayload::Message { text } => {
                assert!(text.contains(&format!("speculation {id}")), "text: {text}");
            }
            other => panic!("expected a diagnostic message, got {other:?}"),
        }
        let trailing =
            tokio::time::timeout(Duration::from_millis(100), control_reader.read_command()).await;
        assert!(trailing.is_err(), "nothing else may survive the overflow");
    }

    fn channel_pair() -> ((Channel, ChannelReader), (Channel, ChannelReader)) {
        let (left, right) = tokio::io::duplex(1 << 16);
        let target = Channel::new(
            left,
            Arc::new(CommandRegistry::catalog(Scope::Target)),
            ChannelConfig::default(),
        );
        let control = Channel::new(
            right,
            Arc::new(CommandRegistry::catalog(Scope::Control)),
            ChannelConfig::default(),
        );
        (target, control)
    }

    #[tokio::test]
    async fn commit_flattens_buffer_in_capture_order() {
        let ((target, _target_reader), (_control, mut control_reader)) = channel_pair();
        let manager = Arc::new(manager(SpeculationConfig::default()));

        let worker_manager = manager.clone();
        let worker_channel = target.clone();
        tokio::task::spawn_blocking(move || {
            let mut context = SpeculationContext::new();
            let id = worker_manager.speculation();
            worker_manager.speculate(&mut context, id).unwrap();
            for name in ["one", "two", "three"] {
                let cmd = event(&worker_manager, name);
                assert!(worker_manager.capture(&context, cmd).is_none());
            }
            worker_manager.commit(&mut context, id, &worker_channel).unwrap();
            assert!(context.active().is_none());
        })
        .await
        .unwrap();

        for expected in ["one", "two", "three"] {
            let command = tokio::time::timeout(Duration::from_secs(1), control_reader.read_command())
                .await
                .expect("read deadline")
                .expect("read");
            assert_eq!(
                command.payload(),
                &CommandPayload::Event {
                    name: expected.into()
                }
            );
        }
        assert_eq!(manager.live_speculations(), 0);
    }

    #[tokio::test]
    async fn discard_drops_the_buffer_and_retires_the_id() {
        let ((target, _target_reader), _control) = channel_pair();
        let manager = manager(SpeculationConfig::default());
        let mut context = SpeculationContext::new();

        let id = manager.speculation();
        manager.speculate(&mut context, id).unwrap();
        let cmd = event(&manager, "doomed");
        assert!(manager.capture(&context, cmd).is_none());

        manager.discard(&mut context, id).unwrap();
        assert!(context.active().is_none());
        assert_eq!(manager.buffered_len(id), None);

        // A second retirement of the same id is a usage error.
        let err = manager.commit(&mut context, id, &target).unwrap_err();
        assert!(matches!(err, SpeculationError::UnknownId { .. }));
    }
}
