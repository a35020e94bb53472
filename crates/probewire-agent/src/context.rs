//! Per-session collaborators and the probe-facing output handle.
//!
//! A [`SessionContext`] is the lookup table of collaborators one session's
//! command handlers run against: the instrumentation engine, the extension
//! repository, the local output sink, and the session's speculation manager.
//! Contexts are built per session by a factory the registry owns, so two
//! sessions never share mutable state.

use std::path::PathBuf;
use std::sync::Arc;

use probewire_core::channel::Channel;
use probewire_core::protocol::{CommandPayload, ProtocolResult};
use probewire_core::sink::OutputSink;
use probewire_core::speculation::{
    SpeculationContext, SpeculationError, SpeculativeQueueManager,
};
use thiserror::Error;
use tracing::info;

/// A named extension resolved for an install request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// The name the control process asked for.
    pub name: String,
    /// Where the extension's code lives on this host.
    pub path: PathBuf,
}

/// Lookup-by-name collaborator consulted when an install request names an
/// extension.
pub trait ExtensionRepository: Send + Sync {
    /// Resolves `name`, or `None` when this host does not carry it.
    fn resolve(&self, name: &str) -> Option<Extension>;
}

/// Repository that resolves nothing. The default.
pub struct NoExtensions;

impl ExtensionRepository for NoExtensions {
    fn resolve(&self, _name: &str) -> Option<Extension> {
        None
    }
}

/// Repository backed by a directory of `<name>.so` files.
pub struct DirExtensionRepository {
    root: PathBuf,
}

impl DirExtensionRepository {
    /// Creates a repository rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ExtensionRepository for DirExtensionRepository {
    fn resolve(&self, name: &str) -> Option<Extension> {
        // Reject names that could escape the repository root.
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }
        let path = self.root.join(format!("{name}.so"));
        path.is_file().then(|| Extension {
            name: name.to_string(),
            path,
        })
    }
}

/// Failures from the instrumentation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The submitted code was refused (empty, unverifiable, malformed).
    #[error("instrumentation rejected: {0}")]
    Rejected(String),

    /// Installation was attempted and failed inside the target.
    #[error("instrumentation failed: {0}")]
    Failed(String),
}

/// The collaborator that actually injects instrumentation into running
/// code. Its internals are outside this crate; handlers only hand it the
/// opaque code blob and learn whether it installed.
pub trait InstrumentationEngine: Send + Sync {
    /// Installs one instrumentation blob.
    ///
    /// # Errors
    ///
    /// [`EngineError::Rejected`] when the blob is refused up front,
    /// [`EngineError::Failed`] when installation broke partway.
    fn install(
        &self,
        code: &[u8],
        args: &[String],
        extension: Option<&Extension>,
    ) -> Result<(), EngineError>;

    /// How many blobs are currently installed.
    fn installed_count(&self) -> usize;
}

/// Placeholder engine used until a real injector is wired in: accepts any
/// non-empty blob and counts it.
#[derive(Default)]
pub struct NullEngine {
    installed: std::sync::atomic::AtomicUsize,
}

impl NullEngine {
    /// Creates an engine with nothing installed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstrumentationEngine for NullEngine {
    fn install(
        &self,
        code: &[u8],
        args: &[String],
        extension: Option<&Extension>,
    ) -> Result<(), EngineError> {
        if code.is_empty() {
            return Err(EngineError::Rejected("empty code blob".into()));
        }
        info!(
            bytes = code.len(),
            args = args.len(),
            extension = extension.map(|e| e.name.as_str()),
            "instrumentation accepted"
        );
        self.installed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn installed_count(&self) -> usize {
        self.installed.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Collaborators one session's handlers run against.
pub struct SessionContext {
    /// Injects instrumentation.
    pub engine: Arc<dyn InstrumentationEngine>,
    /// Resolves extensions named by install requests.
    pub extensions: Arc<dyn ExtensionRepository>,
    /// Where peer-sent messages and errors are written locally.
    pub sink: Arc<dyn OutputSink>,
    /// This session's speculation manager.
    pub speculation: Arc<SpeculativeQueueManager>,
}

impl SessionContext {
    /// Context with a [`NullEngine`], no extensions, and the given sink.
    #[must_use]
    pub fn minimal(sink: Arc<dyn OutputSink>, speculation: Arc<SpeculativeQueueManager>) -> Self {
        Self {
            engine: Arc::new(NullEngine::new()),
            extensions: Arc::new(NoExtensions),
            sink,
            speculation,
        }
    }
}

/// The handle probe worker threads emit through.
///
/// One per worker thread: it carries the worker's own
/// [`SpeculationContext`], so captures never consult hidden thread-local
/// state. Every method blocks briefly when the outbound queue is full and
/// must be called from OS worker threads, never from async tasks.
pub struct ProbeOutput {
    channel: Channel,
    speculation: Arc<SpeculativeQueueManager>,
    context: SpeculationContext,
}

impl ProbeOutput {
    /// Creates a handle for one worker thread.
    #[must_use]
    pub fn new(channel: Channel, speculation: Arc<SpeculativeQueueManager>) -> Self {
        Self {
            channel,
            speculation,
            context: SpeculationContext::new(),
        }
    }

    /// Emits one trace event, captured into the active speculation when one
    /// is set.
    ///
    /// # Errors
    ///
    /// Local configuration and closed-channel errors from the channel; a
    /// closed channel means the session is gone and the probe should stop
    /// emitting.
    pub fn emit(&self, name: impl Into<String>) -> ProtocolResult<()> {
        self.dispatch(CommandPayload::Event { name: name.into() })
    }

    /// Emits one human-readable message line.
    ///
    /// # Errors
    ///
    /// As for [`ProbeOutput::emit`].
    pub fn message(&self, text: impl Into<String>) -> ProtocolResult<()> {
        self.dispatch(CommandPayload::Message { text: text.into() })
    }

    fn dispatch(&self, payload: CommandPayload) -> ProtocolResult<()> {
        let kind = payload.kind();
        let command = self
            .channel
            .registry()
            .create(payload)
            .ok_or(probewire_core::protocol::ProtocolError::UnregisteredKind { kind })?;
        match self.speculation.capture(&self.context, command) {
            None => Ok(()),
            Some(command) => self.channel.enqueue_from_worker(command),
        }
    }

    /// Allocates a speculation id; see
    /// [`SpeculativeQueueManager::speculation`].
    #[must_use]
    pub fn speculation(&self) -> i32 {
        self.speculation.speculation()
    }

    /// Starts capturing this worker's events into `id`.
    ///
    /// # Errors
    ///
    /// [`SpeculationError::UnknownId`] for a dead or sentinel id.
    pub fn speculate(&mut self, id: i32) -> Result<(), SpeculationError> {
        self.speculation.speculate(&mut self.context, id)
    }

    /// Commits speculation `id` onto the session's outbound queue.
    ///
    /// # Errors
    ///
    /// See [`SpeculativeQueueManager::commit`].
    pub fn commit(&mut self, id: i32) -> Result<(), SpeculationError> {
        self.speculation.commit(&mut self.context, id, &self.channel)
    }

    /// Discards speculation `id`.
    ///
    /// # Errors
    ///
    /// See [`SpeculativeQueueManager::discard`].
    pub fn discard(&mut self, id: i32) -> Result<(), SpeculationError> {
        self.speculation.discard(&mut self.context, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_engine_rejects_empty_code() {
        let engine = NullEngine::new();
        assert!(matches!(
            engine.install(&[], &[], None),
            Err(EngineError::Rejected(_))
        ));
        assert_eq!(engine.installed_count(), 0);

        engine.install(&[0x01, 0x02], &[], None).unwrap();
        assert_eq!(engine.installed_count(), 1);
    }

    #[test]
    fn dir_repository_resolves_only_present_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("heapwatch.so"), b"\x7fELF").unwrap();

        let repo = DirExtensionRepository::new(dir.path());
        let ext = repo.resolve("heapwatch").unwrap();
        assert_eq!(ext.name, "heapwatch");
        assert_eq!(ext.path, dir.path().join("heapwatch.so"));

        assert!(repo.resolve("missing").is_none());
        assert!(repo.resolve("../etc/passwd").is_none());
        assert!(repo.resolve("").is_none());
    }

    #[test]
    fn no_extensions_resolves_nothing() {
        assert!(NoExtensions.resolve("anything").is_none());
    }
}
