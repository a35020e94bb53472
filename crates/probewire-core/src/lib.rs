//! Asynchronous command/response protocol for dynamic-tracing sessions.
//!
//! A control process attaches to a running target, pushes instrumentation
//! into it, and receives a stream of trace output while the target keeps
//! executing. Both ends speak the same protocol: framed, correlation-tagged
//! [`Command`](protocol::Command)s over any ordered byte transport.
//!
//! This crate carries the pieces shared by both ends:
//!
//! - [`protocol`]: the command model, registry, wire codec, and handshake
//! - [`channel`]: the duplex queue/writer pair with response correlation
//! - [`speculation`]: speculative buffering of emitted events
//! - [`client`]: the control-process session driver
//! - [`sink`]: output destinations for received trace output
//!
//! The target-side session machinery (state machine, dispatch, session
//! registry) lives in `probewire-agent`.

#![warn(missing_docs)]

pub mod channel;
pub mod client;
pub mod protocol;
pub mod sink;
pub mod speculation;

pub use channel::{Channel, ChannelConfig, ChannelReader, PendingResponse};
pub use client::{Client, ClientConfig};
pub use sink::{MemorySink, OutputSink, WriterSink};
pub use speculation::{
    SPECULATION_UNAVAILABLE, SpeculationConfig, SpeculationContext, SpeculationError,
    SpeculativeQueueManager,
};
