//! Version handshake run before the command codec takes the stream.
//!
//! ```text
//! Control                                   Target
//!   |                                          |
//!   |  -- Hello { version, client_info } -->   |
//!   |                                          |
//!   |  <-- HelloAck { version, server_info } --|
//!   |      OR                                  |
//!   |  <-- HelloNack { reason } ---------------|
//!   |                                          |
//! ```
//!
//! Handshake messages travel as length-prefixed JSON frames (`u32` big-endian
//! length, capped at [`MAX_HANDSHAKE_FRAME_SIZE`]) directly on the raw
//! stream; only after a successful exchange is the stream handed to the
//! command codec. A nack or version mismatch terminates the connection.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult};

/// Hello message sent by the control process to initiate the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    /// Protocol version requested by the control process.
    pub protocol_version: u32,

    /// Client identifier for logging, e.g. `probewire-cli/0.1.0`.
    pub client_info: String,
}

impl Hello {
    /// Creates a Hello for the current protocol version.
    #[must_use]
    pub fn new(client_info: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_info: client_info.into(),
        }
    }

    /// Creates a Hello with a specific protocol version (for testing).
    #[must_use]
    pub fn with_version(protocol_version: u32, client_info: impl Into<String>) -> Self {
        Self {
            protocol_version,
            client_info: client_info.into(),
        }
    }
}

/// Successful handshake acknowledgement from the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloAck {
    /// Protocol version agreed upon.
    pub protocol_version: u32,

    /// Server identifier for logging, e.g. `probewire-agent/0.1.0`.
    pub server_info: String,
}

/// Handshake rejection from the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloNack {
    /// Why the connection was rejected.
    pub reason: String,
}

/// Envelope for handshake frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    /// Connection request.
    Hello(Hello),
    /// Connection accepted.
    HelloAck(HelloAck),
    /// Connection rejected.
    HelloNack(HelloNack),
}

async fn write_frame<S>(stream: &mut S, message: &HandshakeMessage) -> ProtocolResult<()>
where
    S: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)
        .map_err(|e| ProtocolError::handshake(format!("serialize: {e}")))?;
    if payload.len() > MAX_HANDSHAKE_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(
            payload.len(),
            MAX_HANDSHAKE_FRAME_SIZE,
        ));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S>(stream: &mut S) -> ProtocolResult<HandshakeMessage>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(eof_to_end)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_HANDSHAKE_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(len, MAX_HANDSHAKE_FRAME_SIZE));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(eof_to_end)?;
    serde_json::from_slice(&payload)
        .map_err(|e| ProtocolError::handshake(format!("malformed handshake frame: {e}")))
}

fn eof_to_end(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::EndOfStream
    } else {
        ProtocolError::Io(err)
    }
}

/// Control-process side: send Hello, await the verdict.
///
/// # Errors
///
/// Returns [`ProtocolError::Handshake`] on a nack or an out-of-sequence
/// frame, [`ProtocolError::VersionMismatch`] when the target rejected the
/// version, and I/O variants for transport failures.
pub async fn client_handshake<S>(stream: &mut S, client_info: &str) -> ProtocolResult<HelloAck>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &HandshakeMessage::Hello(Hello::new(client_info))).await?;
    match read_frame(stream).await? {
        HandshakeMessage::HelloAck(ack) => Ok(ack),
        HandshakeMessage::HelloNack(nack) => Err(ProtocolError::handshake(nack.reason)),
        HandshakeMessage::Hello(_) => {
            Err(ProtocolError::handshake("unexpected Hello from target"))
        }
    }
}

/// Target side: await Hello, validate the version, answer ack or nack.
///
/// # Errors
///
/// Returns [`ProtocolError::VersionMismatch`] after sending a nack for an
/// unsupported version, [`ProtocolError::Handshake`] for an out-of-sequence
/// frame, and I/O variants for transport failures.
pub async fn server_handshake<S>(stream: &mut S, server_info: &str) -> ProtocolResult<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = match read_frame(stream).await? {
        HandshakeMessage::Hello(hello) => hello,
        other => {
            let nack = HelloNack {
                reason: "expected Hello".into(),
            };
            let _ = write_frame(stream, &HandshakeMessage::HelloNack(nack)).await;
            return Err(ProtocolError::handshake(format!(
                "expected Hello, got {other:?}"
            )));
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        let nack = HelloNack {
            reason: format!(
                "unsupported protocol version {} (supported: {PROTOCOL_VERSION})",
                hello.protocol_version
            ),
        };
        let _ = write_frame(stream, &HandshakeMessage::HelloNack(nack)).await;
        return Err(ProtocolError::version_mismatch(hello.protocol_version));
    }

    let ack = HelloAck {
        protocol_version: PROTOCOL_VERSION,
        server_info: server_info.to_string(),
    };
    write_frame(stream, &HandshakeMessage::HelloAck(ack)).await?;
    Ok(hello)
}
