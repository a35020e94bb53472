//! Command protocol: message model, factory registry, wire codec, handshake.
//!
//! The protocol stack, leaf to root:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                Commands                  │  typed, correlation-tagged
//! ├─────────────────────────────────────────┤
//! │                Handshake                 │  Hello/HelloAck (JSON)
//! ├─────────────────────────────────────────┤
//! │                 Framing                  │  3×i32 header + payload
//! ├─────────────────────────────────────────┤
//! │                Transport                 │  any AsyncRead + AsyncWrite
//! └─────────────────────────────────────────┘
//! ```
//!
//! - [`command`]: the [`Command`] unit, payload variants, wire helpers
//! - [`registry`]: [`CommandRegistry`] — type-id table, sequence numbers,
//!   request/response construction
//! - [`codec`]: [`CommandCodec`] for `tokio_util` framed transports
//! - [`handshake`]: version negotiation before framing starts
//! - [`error`]: [`ProtocolError`] taxonomy and size caps

pub mod codec;
pub mod command;
pub mod error;
pub mod handshake;
pub mod registry;

pub use codec::CommandCodec;
pub use command::{
    Command, CommandKind, CommandPayload, DecodeError, PayloadDecodeFn, RESPONSE_NONE,
    ResponseValue, SEQUENCE_BOUND,
};
pub use error::{
    MAX_HANDSHAKE_FRAME_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult,
};
pub use handshake::{Hello, HelloAck, HelloNack, client_handshake, server_handshake};
pub use registry::{Audience, CommandDescriptor, CommandRegistry, Scope, type_ids};
