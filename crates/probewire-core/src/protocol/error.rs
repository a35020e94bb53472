//! Protocol error types for the command channel layer.
//!
//! This module provides structured error types for protocol-level failures,
//! enabling callers to distinguish between different failure modes.
//!
//! # Error Classification
//!
//! - **Decode errors** (unknown type id, malformed payload, oversized frame):
//!   fatal to the channel; the read loop treats them as a disconnect.
//! - **Transport errors** (I/O failure): fatal to the channel, same handling.
//! - **End-of-stream**: distinguished from a generic transport error so the
//!   session can detach cleanly rather than flag an error.
//! - **Timeouts**: local to the caller of [`PendingResponse::get`]; the
//!   channel stays open.
//!
//! [`PendingResponse::get`]: crate::channel::PendingResponse::get

use std::io;

use thiserror::Error;

use super::command::CommandKind;

/// Maximum command payload size in bytes (16 MiB).
///
/// Declared lengths inside a payload are validated against this cap BEFORE
/// allocation to prevent memory exhaustion from a hostile or corrupted peer.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum handshake frame size in bytes (64 KiB).
///
/// Handshake messages have a stricter limit than command frames because they
/// are parsed before the peer has proven it speaks the protocol at all.
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// Protocol version supported by this implementation.
///
/// Version negotiation occurs during the handshake. Peers with an
/// incompatible version are rejected with [`ProtocolError::VersionMismatch`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors produced by the command protocol layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A declared length inside a frame exceeds the maximum allowed size.
    ///
    /// Detected before allocation.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Declared size from the wire.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame data is malformed and cannot be decoded.
    #[error("invalid frame: {reason}")]
    Decode {
        /// Description of the decode failure.
        reason: String,
    },

    /// The wire carried a type id no command kind was registered for.
    ///
    /// Fatal: the two ends were built from different command catalogs and
    /// framing can no longer be trusted.
    #[error("unknown command type id {type_id}")]
    UnknownTypeId {
        /// The unrecognized type id.
        type_id: i32,
    },

    /// Protocol version mismatch during handshake.
    #[error("version mismatch: peer version {peer_version}, local version {local_version}")]
    VersionMismatch {
        /// Version requested by the peer.
        peer_version: u32,
        /// Version supported locally.
        local_version: u32,
    },

    /// Handshake sequence did not complete.
    #[error("handshake failed: {reason}")]
    Handshake {
        /// Description of the handshake failure.
        reason: String,
    },

    /// The peer closed the stream.
    ///
    /// Distinct from [`ProtocolError::Io`]: end-of-stream triggers a clean
    /// detach rather than an error-flagged shutdown.
    #[error("end of stream")]
    EndOfStream,

    /// The channel was closed locally before or during the operation.
    #[error("channel closed")]
    ChannelClosed,

    /// Timeout waiting for a correlated response.
    #[error("operation timed out after {duration_ms} ms")]
    Timeout {
        /// Duration in milliseconds before the timeout fired.
        duration_ms: u64,
    },

    /// A command kind was used that the local registry never registered.
    ///
    /// This is a local configuration error, not a protocol error: the caller
    /// built a command the catalog for this scope does not contain.
    #[error("command kind {kind} is not registered in this scope")]
    UnregisteredKind {
        /// The unregistered kind.
        kind: CommandKind,
    },

    /// Underlying transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Create a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Create a decode error.
    #[must_use]
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Create a version mismatch error against the local protocol version.
    #[must_use]
    pub const fn version_mismatch(peer_version: u32) -> Self {
        Self::VersionMismatch {
            peer_version,
            local_version: PROTOCOL_VERSION,
        }
    }

    /// Create a handshake failure error.
    #[must_use]
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Returns `true` if this error is local and recoverable.
    ///
    /// Recoverable errors never escalate beyond the requester: the channel
    /// stays open and the caller decides whether to retry or abandon.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ChannelClosed | Self::UnregisteredKind { .. }
        )
    }

    /// Returns `true` if this error indicates a protocol violation.
    ///
    /// Protocol violations corrupt the shared framing state; the channel
    /// must be closed and the session moved toward disconnect.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::Decode { .. }
                | Self::UnknownTypeId { .. }
                | Self::VersionMismatch { .. }
                | Self::Handshake { .. }
        )
    }

    /// Returns `true` if the read loop should treat this error as a
    /// disconnect of the peer.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Io(_)) || self.is_protocol_violation()
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_too_large_is_a_violation() {
        let err = ProtocolError::frame_too_large(20_000_000, MAX_PAYLOAD_SIZE);
        assert!(err.is_protocol_violation());
        assert!(err.is_disconnect());
        assert!(!err.is_recoverable());

        let msg = err.to_string();
        assert!(msg.contains("20000000"));
        assert!(msg.contains(&MAX_PAYLOAD_SIZE.to_string()));
    }

    #[test]
    fn version_mismatch_reports_both_versions() {
        let err = ProtocolError::version_mismatch(99);
        assert!(err.is_protocol_violation());

        let msg = err.to_string();
        assert!(msg.contains("99"));
        assert!(msg.contains(&PROTOCOL_VERSION.to_string()));
    }

    #[test]
    fn timeout_is_recoverable_and_not_a_disconnect() {
        let err = ProtocolError::timeout(500);
        assert!(err.is_recoverable());
        assert!(!err.is_protocol_violation());
        assert!(!err.is_disconnect());
    }

    #[test]
    fn end_of_stream_is_a_disconnect_but_not_a_violation() {
        let err = ProtocolError::EndOfStream;
        assert!(err.is_disconnect());
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn io_error_wrapping() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err = ProtocolError::from(io_err);
        assert!(err.is_disconnect());
        assert!(!err.is_recoverable());
    }

    // Handshake frames must always fit inside a command payload.
    const _: () = assert!(MAX_HANDSHAKE_FRAME_SIZE < MAX_PAYLOAD_SIZE);
}
