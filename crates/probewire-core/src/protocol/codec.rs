//! Frame codec: commands on and off the wire.
//!
//! [`CommandCodec`] implements [`tokio_util::codec`]'s `Encoder`/`Decoder`
//! for the command frame layout (three big-endian `i32` header fields plus a
//! self-delimiting payload). Decoding is incremental: a partially arrived
//! frame yields `Ok(None)` and no bytes are consumed until a whole command
//! decodes, so the source buffer never ends up mid-frame.

use std::io::Cursor;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::command::{Command, DecodeError, get_i32};
use super::error::ProtocolError;
use super::registry::CommandRegistry;

/// Header size: `type_id`, `rx`, `tx`.
const HEADER_SIZE: usize = 12;

/// Encoder/decoder for command frames, backed by a [`CommandRegistry`].
pub struct CommandCodec {
    registry: Arc<CommandRegistry>,
}

impl CommandCodec {
    /// Creates a codec decoding against the given registry.
    #[must_use]
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut cur = Cursor::new(&src[..]);
        // Header reads cannot fail: length was checked above.
        let type_id = get_i32(&mut cur).map_err(ProtocolError::from)?;
        let rx = get_i32(&mut cur).map_err(ProtocolError::from)?;
        let tx = get_i32(&mut cur).map_err(ProtocolError::from)?;

        match self.registry.restore(type_id, rx, tx, &mut cur) {
            Ok(command) => {
                let consumed = cur.position() as usize;
                src.advance(consumed);
                Ok(Some(command))
            }
            Err(DecodeError::Incomplete) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        command.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::{CommandPayload, RESPONSE_NONE};
    use crate::protocol::registry::Scope;

    fn codec() -> CommandCodec {
        CommandCodec::new(Arc::new(CommandRegistry::catalog(Scope::Control)))
    }

    #[test]
    fn partial_frame_decodes_to_none_then_completes() {
        let mut codec = codec();
        let registry = CommandRegistry::catalog(Scope::Control);
        let command = registry
            .create(CommandPayload::Message {
                text: "hello from probe".into(),
            })
            .unwrap();

        let mut full = BytesMut::new();
        codec.encode(command.clone(), &mut full).unwrap();

        let mut src = BytesMut::new();
        let split = full.len() - 5;
        src.extend_from_slice(&full[..split]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        // Nothing consumed while the frame is incomplete.
        assert_eq!(src.len(), split);

        src.extend_from_slice(&full[split..]);
        let decoded = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(decoded.rx(), command.rx());
        assert_eq!(decoded.tx(), RESPONSE_NONE);
        assert_eq!(decoded.payload(), command.payload());
        assert!(src.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut codec = codec();
        let registry = CommandRegistry::catalog(Scope::Control);
        let first = registry
            .create(CommandPayload::Event { name: "alpha".into() })
            .unwrap();
        let second = registry
            .create(CommandPayload::Event { name: "beta".into() })
            .unwrap();

        let mut src = BytesMut::new();
        codec.encode(first.clone(), &mut src).unwrap();
        codec.encode(second.clone(), &mut src).unwrap();

        let a = codec.decode(&mut src).unwrap().unwrap();
        let b = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(a.rx(), first.rx());
        assert_eq!(b.rx(), second.rx());
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn unknown_type_id_is_fatal() {
        let mut codec = codec();
        let mut src = BytesMut::new();
        use bytes::BufMut;
        src.put_i32(9999);
        src.put_i32(1);
        src.put_i32(RESPONSE_NONE);
        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTypeId { type_id: 9999 }));
    }

    #[test]
    fn short_header_waits_for_more_bytes() {
        let mut codec = codec();
        let mut src = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 3);
    }
}
