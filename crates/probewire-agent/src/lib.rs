//! Target-side tracing agent.
//!
//! Listens for control-process connections and runs one [`Session`] per
//! peer: inbound commands are dispatched against per-session collaborators
//! ([`context`]), probe worker threads emit trace output through
//! [`ProbeOutput`] handles, and the [`SessionRegistry`] tracks the live set
//! with idle shutdown.

#![warn(missing_docs)]

pub mod context;
pub mod dispatch;
pub mod server;
pub mod session;

pub use context::{
    DirExtensionRepository, EngineError, Extension, ExtensionRepository, InstrumentationEngine,
    NoExtensions, NullEngine, ProbeOutput, SessionContext,
};
pub use dispatch::{DispatchError, Disposition};
pub use server::{ContextFactory, ServerConfig, SessionRegistry, DEFAULT_BIND_ADDR};
pub use session::{DetachHook, Session, SessionEvent, SessionId, SessionState};
