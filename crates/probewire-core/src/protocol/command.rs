//! Command model: the typed, correlation-tagged message unit.
//!
//! Every message exchanged over a [`Channel`] is a [`Command`]: a stable
//! numeric `type_id` identifying its wire shape, two correlation numbers
//! (`rx`, the sequence number assigned at creation; `tx`, the `rx` of the
//! command this one replies to), and a kind-specific payload.
//!
//! # Wire Layout
//!
//! Big-endian, transport-agnostic:
//!
//! ```text
//! i32 type_id
//! i32 rx
//! i32 tx
//! <kind-specific payload, self-delimiting>
//! ```
//!
//! Payloads delimit themselves: variable-length fields carry a `u32` length
//! prefix, validated against [`MAX_PAYLOAD_SIZE`] before any allocation.
//!
//! Command construction goes through [`CommandRegistry`] so that sequence
//! numbers and capability flags are assigned consistently; commands are
//! immutable after construction.
//!
//! [`Channel`]: crate::channel::Channel
//! [`CommandRegistry`]: super::registry::CommandRegistry
//! [`MAX_PAYLOAD_SIZE`]: super::error::MAX_PAYLOAD_SIZE

use std::fmt;
use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::error::{MAX_PAYLOAD_SIZE, ProtocolError};

/// Sentinel `tx` value for commands that are not a reply.
pub const RESPONSE_NONE: i32 = -1;

/// Sequence numbers wrap back to zero at this bound.
pub const SEQUENCE_BOUND: i32 = 100_000;

/// Upper bound on the number of instrumentation arguments in one command.
const MAX_ARGS: usize = 1024;

/// Identifies a command kind independently of any particular instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Install an instrumentation blob into the target.
    Instrument,
    /// A named trace event, either a probe firing or an external trigger.
    Event,
    /// Human-readable output produced by probe code.
    Message,
    /// An error report from one side to the other.
    Error,
    /// Request the peer session to terminate with an exit code.
    Exit,
    /// Query the session's liveness and installation state.
    Status,
    /// A correlated reply to an earlier command.
    Response,
    /// An externally registered kind, identified by name.
    Custom(&'static str),
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instrument => write!(f, "instrument"),
            Self::Event => write!(f, "event"),
            Self::Message => write!(f, "message"),
            Self::Error => write!(f, "error"),
            Self::Exit => write!(f, "exit"),
            Self::Status => write!(f, "status"),
            Self::Response => write!(f, "response"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// The value carried by a [`CommandPayload::Response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseValue {
    /// Bare acknowledgement.
    Ack,
    /// Boolean outcome, e.g. whether an installation succeeded.
    Flag(bool),
    /// Numeric outcome.
    Code(i32),
    /// Free-form text, e.g. a status report.
    Text(String),
}

/// Kind-specific command payload.
///
/// A tagged variant over the known command kinds; the open set of kinds is
/// preserved through [`CommandPayload::Opaque`], which externally registered
/// descriptors decode into.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    /// Opaque, verified code blob plus its arguments.
    Instrument {
        /// Compiled instrumentation, treated as opaque bytes.
        code: Vec<u8>,
        /// Arguments handed to the instrumentation engine.
        args: Vec<String>,
    },
    /// A named trace event.
    Event {
        /// Event name.
        name: String,
    },
    /// Human-readable text for the peer's output sink.
    Message {
        /// Message text.
        text: String,
    },
    /// An error report.
    Error {
        /// Description of the failure.
        cause: String,
    },
    /// Terminate the session.
    Exit {
        /// Exit code to report.
        code: i32,
    },
    /// Query session state.
    Status,
    /// Correlated reply.
    Response {
        /// The reply value.
        value: ResponseValue,
    },
    /// Payload of an externally registered kind.
    Opaque {
        /// Name of the registered kind.
        kind: &'static str,
        /// Raw payload bytes.
        data: Bytes,
    },
}

impl CommandPayload {
    /// Returns the kind this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Instrument { .. } => CommandKind::Instrument,
            Self::Event { .. } => CommandKind::Event,
            Self::Message { .. } => CommandKind::Message,
            Self::Error { .. } => CommandKind::Error,
            Self::Exit { .. } => CommandKind::Exit,
            Self::Status => CommandKind::Status,
            Self::Response { .. } => CommandKind::Response,
            Self::Opaque { kind, .. } => CommandKind::Custom(*kind),
        }
    }

    /// Encodes the payload in its self-delimiting wire form.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Instrument { code, args } => {
                put_blob(dst, code);
                dst.put_u32(args.len() as u32);
                for arg in args {
                    put_str(dst, arg);
                }
            }
            Self::Event { name } => put_str(dst, name),
            Self::Message { text } => put_str(dst, text),
            Self::Error { cause } => put_str(dst, cause),
            Self::Exit { code } => dst.put_i32(*code),
            Self::Status => {}
            Self::Response { value } => match value {
                ResponseValue::Ack => dst.put_u8(0),
                ResponseValue::Flag(flag) => {
                    dst.put_u8(1);
                    dst.put_u8(u8::from(*flag));
                }
                ResponseValue::Code(code) => {
                    dst.put_u8(2);
                    dst.put_i32(*code);
                }
                ResponseValue::Text(text) => {
                    dst.put_u8(3);
                    put_str(dst, text);
                }
            },
            Self::Opaque { data, .. } => put_blob(dst, data),
        }
    }
}

/// Failure modes while decoding a command from the wire.
///
/// `Incomplete` is not an error for a streaming decoder: it means the frame
/// has not fully arrived yet and the codec should wait for more bytes. The
/// other variants are fatal to the channel.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The buffer ended before the frame did.
    #[error("incomplete frame")]
    Incomplete,
    /// The wire carried a type id with no registered kind.
    #[error("unknown command type id {0}")]
    UnknownTypeId(i32),
    /// A declared length exceeds the payload cap.
    #[error("declared length {size} exceeds maximum {max}")]
    TooLarge {
        /// Declared size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// Structurally invalid payload data.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<DecodeError> for ProtocolError {
    fn from(err: DecodeError) -> Self {
        match err {
            // Incomplete never escapes the codec; if it does, the stream
            // ended mid-frame.
            DecodeError::Incomplete => Self::decode("truncated frame"),
            DecodeError::UnknownTypeId(type_id) => Self::UnknownTypeId { type_id },
            DecodeError::TooLarge { size, max } => Self::frame_too_large(size, max),
            DecodeError::Malformed(reason) => Self::decode(reason),
        }
    }
}

/// Decode function for one command kind, usable as a table entry.
pub type PayloadDecodeFn =
    for<'a> fn(&mut Cursor<&'a [u8]>) -> Result<CommandPayload, DecodeError>;

/// A typed, versioned message unit. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Command {
    type_id: i32,
    rx: i32,
    tx: i32,
    needs_response: bool,
    can_be_speculated: bool,
    payload: CommandPayload,
}

impl Command {
    /// Assembled only by the registry so flags and sequence numbers stay
    /// consistent with the catalog.
    pub(crate) const fn assemble(
        type_id: i32,
        rx: i32,
        tx: i32,
        needs_response: bool,
        can_be_speculated: bool,
        payload: CommandPayload,
    ) -> Self {
        Self {
            type_id,
            rx,
            tx,
            needs_response,
            can_be_speculated,
            payload,
        }
    }

    /// Stable numeric identifier of this command's kind.
    #[must_use]
    pub const fn type_id(&self) -> i32 {
        self.type_id
    }

    /// Sequence number assigned when this command was created.
    #[must_use]
    pub const fn rx(&self) -> i32 {
        self.rx
    }

    /// Sequence number of the command this one replies to, or
    /// [`RESPONSE_NONE`].
    #[must_use]
    pub const fn tx(&self) -> i32 {
        self.tx
    }

    /// The kind of this command.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    /// Whether the sender expects a correlated response.
    #[must_use]
    pub const fn needs_response(&self) -> bool {
        self.needs_response
    }

    /// Whether this command may be captured into a speculative buffer.
    #[must_use]
    pub const fn can_be_speculated(&self) -> bool {
        self.can_be_speculated
    }

    /// Whether this command is a reply consumed by response correlation.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self.payload, CommandPayload::Response { .. })
    }

    /// Borrow the payload.
    #[must_use]
    pub const fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    /// Consume the command, yielding its payload.
    #[must_use]
    pub fn into_payload(self) -> CommandPayload {
        self.payload
    }

    /// Encode header and payload onto `dst`.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32(self.type_id);
        dst.put_i32(self.rx);
        dst.put_i32(self.tx);
        self.payload.encode(dst);
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

fn put_blob(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_u32(bytes.len() as u32);
    dst.put_slice(bytes);
}

fn put_str(dst: &mut BytesMut, s: &str) {
    put_blob(dst, s.as_bytes());
}

pub(crate) fn get_u8(cur: &mut Cursor<&[u8]>) -> Result<u8, DecodeError> {
    if cur.remaining() < 1 {
        return Err(DecodeError::Incomplete);
    }
    Ok(cur.get_u8())
}

pub(crate) fn get_i32(cur: &mut Cursor<&[u8]>) -> Result<i32, DecodeError> {
    if cur.remaining() < 4 {
        return Err(DecodeError::Incomplete);
    }
    Ok(cur.get_i32())
}

pub(crate) fn get_u32(cur: &mut Cursor<&[u8]>) -> Result<u32, DecodeError> {
    if cur.remaining() < 4 {
        return Err(DecodeError::Incomplete);
    }
    Ok(cur.get_u32())
}

/// Reads a length-prefixed byte blob, validating the declared length against
/// [`MAX_PAYLOAD_SIZE`] before allocating.
pub(crate) fn get_blob(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>, DecodeError> {
    let len = get_u32(cur)? as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(DecodeError::TooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    if cur.remaining() < len {
        return Err(DecodeError::Incomplete);
    }
    let mut buf = vec![0u8; len];
    cur.copy_to_slice(&mut buf);
    Ok(buf)
}

pub(crate) fn get_str(cur: &mut Cursor<&[u8]>) -> Result<String, DecodeError> {
    let bytes = get_blob(cur)?;
    String::from_utf8(bytes).map_err(|e| DecodeError::Malformed(format!("invalid utf-8: {e}")))
}

// ---------------------------------------------------------------------------
// Built-in payload decoders, keyed from the registry's descriptor table
// ---------------------------------------------------------------------------

pub(crate) fn decode_instrument(cur: &mut Cursor<&[u8]>) -> Result<CommandPayload, DecodeError> {
    let code = get_blob(cur)?;
    let arg_count = get_u32(cur)? as usize;
    if arg_count > MAX_ARGS {
        return Err(DecodeError::Malformed(format!(
            "argument count {arg_count} exceeds maximum {MAX_ARGS}"
        )));
    }
    let mut args = Vec::with_capacity(arg_count);
    for _ in 0..arg_count {
        args.push(get_str(cur)?);
    }
    Ok(CommandPayload::Instrument { code, args })
}

pub(crate) fn decode_event(cur: &mut Cursor<&[u8]>) -> Result<CommandPayload, DecodeError> {
    Ok(CommandPayload::Event {
        name: get_str(cur)?,
    })
}

pub(crate) fn decode_message(cur: &mut Cursor<&[u8]>) -> Result<CommandPayload, DecodeError> {
    Ok(CommandPayload::Message {
        text: get_str(cur)?,
    })
}

pub(crate) fn decode_error(cur: &mut Cursor<&[u8]>) -> Result<CommandPayload, DecodeError> {
    Ok(CommandPayload::Error {
        cause: get_str(cur)?,
    })
}

pub(crate) fn decode_exit(cur: &mut Cursor<&[u8]>) -> Result<CommandPayload, DecodeError> {
    Ok(CommandPayload::Exit {
        code: get_i32(cur)?,
    })
}

pub(crate) fn decode_status(_cur: &mut Cursor<&[u8]>) -> Result<CommandPayload, DecodeError> {
    Ok(CommandPayload::Status)
}

pub(crate) fn decode_response(cur: &mut Cursor<&[u8]>) -> Result<CommandPayload, DecodeError> {
    let value = match get_u8(cur)? {
        0 => ResponseValue::Ack,
        1 => ResponseValue::Flag(get_u8(cur)? != 0),
        2 => ResponseValue::Code(get_i32(cur)?),
        3 => ResponseValue::Text(get_str(cur)?),
        tag => {
            return Err(DecodeError::Malformed(format!(
                "unknown response value tag {tag}"
            )));
        }
    };
    Ok(CommandPayload::Response { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: CommandPayload, decode: PayloadDecodeFn) -> CommandPayload {
        let mut buf = BytesMut::new();
        payload.encode(&mut buf);
        let frozen = buf.freeze();
        let mut cur = Cursor::new(frozen.as_ref());
        let decoded = decode(&mut cur).expect("decode");
        assert_eq!(cur.remaining(), 0, "payload must be self-delimiting");
        decoded
    }

    #[test]
    fn instrument_roundtrip() {
        let payload = CommandPayload::Instrument {
            code: vec![0x01, 0x02, 0xff],
            args: vec!["extension=jdbc".into(), "verbose".into()],
        };
        assert_eq!(roundtrip(payload.clone(), decode_instrument), payload);
    }

    #[test]
    fn event_roundtrip() {
        let payload = CommandPayload::Event {
            name: "gc-start".into(),
        };
        assert_eq!(roundtrip(payload.clone(), decode_event), payload);
    }

    #[test]
    fn message_roundtrip() {
        let payload = CommandPayload::Message {
            text: "heap dump written to /tmp/dump.hprof".into(),
        };
        assert_eq!(roundtrip(payload.clone(), decode_message), payload);
    }

    #[test]
    fn error_roundtrip() {
        let payload = CommandPayload::Error {
            cause: "probe thread panicked".into(),
        };
        assert_eq!(roundtrip(payload.clone(), decode_error), payload);
    }

    #[test]
    fn status_roundtrip_carries_no_bytes() {
        let mut buf = BytesMut::new();
        CommandPayload::Status.encode(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(roundtrip(CommandPayload::Status, decode_status), CommandPayload::Status);
    }

    #[test]
    fn exit_roundtrip_negative_code() {
        let payload = CommandPayload::Exit { code: -7 };
        assert_eq!(roundtrip(payload.clone(), decode_exit), payload);
    }

    #[test]
    fn response_value_roundtrips() {
        for value in [
            ResponseValue::Ack,
            ResponseValue::Flag(true),
            ResponseValue::Flag(false),
            ResponseValue::Code(42),
            ResponseValue::Text("state=connected".into()),
        ] {
            let payload = CommandPayload::Response {
                value: value.clone(),
            };
            assert_eq!(roundtrip(payload, decode_response), CommandPayload::Response { value });
        }
    }

    #[test]
    fn truncated_string_is_incomplete_not_malformed() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "a-long-event-name");
        let frozen = buf.freeze();
        let truncated = &frozen.as_ref()[..frozen.len() - 3];
        let mut cur = Cursor::new(truncated);
        assert!(matches!(decode_event(&mut cur), Err(DecodeError::Incomplete)));
    }

    #[test]
    fn oversized_declared_length_is_rejected_before_allocation() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        let frozen = buf.freeze();
        let mut cur = Cursor::new(frozen.as_ref());
        assert!(matches!(
            decode_message(&mut cur),
            Err(DecodeError::TooLarge { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_slice(&[0xff, 0xfe]);
        let frozen = buf.freeze();
        let mut cur = Cursor::new(frozen.as_ref());
        assert!(matches!(
            decode_message(&mut cur),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_response_tag_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        let frozen = buf.freeze();
        let mut cur = Cursor::new(frozen.as_ref());
        assert!(matches!(
            decode_response(&mut cur),
            Err(DecodeError::Malformed(_))
        ));
    }
}
