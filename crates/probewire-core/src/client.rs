//! Control-process client.
//!
//! A [`Client`] drives one attached target: it performs the handshake,
//! owns the channel, pushes instrumentation, and streams the target's trace
//! output into an [`OutputSink`] in arrival order. A background read loop
//! resolves correlated responses and prints everything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelConfig, ChannelReader, PendingResponse};
use crate::protocol::command::{Command, CommandPayload, ResponseValue};
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::registry::{CommandRegistry, Scope};
use crate::protocol::client_handshake;
use crate::sink::OutputSink;

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for a correlated response before giving up.
    pub response_timeout: Duration,
    /// How long to wait for the target to acknowledge an Exit.
    pub exit_ack_timeout: Duration,
    /// Client identifier sent in the handshake.
    pub client_info: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            exit_ack_timeout: Duration::from_millis(500),
            client_info: format!("probewire-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Set the response timeout.
    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the Exit acknowledgement timeout.
    #[must_use]
    pub const fn with_exit_ack_timeout(mut self, timeout: Duration) -> Self {
        self.exit_ack_timeout = timeout;
        self
    }

    /// Set the handshake client identifier.
    #[must_use]
    pub fn with_client_info(mut self, info: impl Into<String>) -> Self {
        self.client_info = info.into();
        self
    }
}

/// A connected control-process session with one target.
pub struct Client {
    channel: Channel,
    config: ClientConfig,
    closing: Arc<AtomicBool>,
    read_loop: JoinHandle<()>,
}

impl Client {
    /// Connects to a target agent over TCP and runs the handshake.
    ///
    /// # Errors
    ///
    /// I/O errors from the connect, plus every [`client_handshake`] failure
    /// (nack, version mismatch, malformed frame).
    pub async fn connect(
        addr: &str,
        sink: Arc<dyn OutputSink>,
        config: ClientConfig,
    ) -> ProtocolResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream, sink, config).await
    }

    /// Runs the handshake and builds a client over an already-connected
    /// stream. This is how tests attach over in-memory transports.
    ///
    /// # Errors
    ///
    /// Every [`client_handshake`] failure.
    pub async fn from_stream<S>(
        mut stream: S,
        sink: Arc<dyn OutputSink>,
        config: ClientConfig,
    ) -> ProtocolResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ack = client_handshake(&mut stream, &config.client_info).await?;
        debug!(server = %ack.server_info, "handshake complete");

        let registry = Arc::new(CommandRegistry::catalog(Scope::Control));
        let (channel, reader) = Channel::new(stream, registry, ChannelConfig::default());

        let closing = Arc::new(AtomicBool::new(false));
        let read_loop = tokio::spawn(read_loop(
            reader,
            channel.clone(),
            sink,
            closing.clone(),
        ));

        Ok(Self {
            channel,
            config,
            closing,
            read_loop,
        })
    }

    /// The channel behind this client.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Pushes instrumentation into the target.
    ///
    /// Returns whether the target installed it.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Timeout`] when no response arrives in time and
    /// [`ProtocolError::ChannelClosed`] when the session ended first.
    pub async fn install(&self, code: Vec<u8>, args: Vec<String>) -> ProtocolResult<bool> {
        let pending = self
            .channel
            .send(CommandPayload::Instrument { code, args })
            .await?;
        let reply = self.expect_reply(pending).await?;
        Ok(match reply {
            ResponseValue::Flag(installed) => installed,
            ResponseValue::Code(code) => code == 0,
            ResponseValue::Ack => true,
            ResponseValue::Text(_) => true,
        })
    }

    /// Queries the target's status line.
    ///
    /// # Errors
    ///
    /// As for [`Client::install`], plus a decode error when the target
    /// answers with something other than text.
    pub async fn status(&self) -> ProtocolResult<String> {
        let pending = self.channel.send(CommandPayload::Status).await?;
        match self.expect_reply(pending).await? {
            ResponseValue::Text(status) => Ok(status),
            other => Err(ProtocolError::decode(format!(
                "status reply was not text: {other:?}"
            ))),
        }
    }

    /// Asks the target to shut the session down with `code`, waits briefly
    /// for the acknowledgement, then closes the channel.
    ///
    /// A missing acknowledgement is not an error: the target may already be
    /// gone.
    pub async fn shutdown(self, code: i32) {
        self.closing.store(true, Ordering::SeqCst);
        match self.channel.send(CommandPayload::Exit { code }).await {
            Ok(pending) => {
                if let Err(err) = pending.get(self.config.exit_ack_timeout).await {
                    debug!(error = %err, "target did not acknowledge Exit");
                }
            }
            Err(err) => debug!(error = %err, "Exit not sent"),
        }
        self.finish().await;
    }

    /// Detaches without asking the target to do anything: closes the channel
    /// and leaves installed instrumentation running.
    pub async fn detach(self) {
        self.closing.store(true, Ordering::SeqCst);
        self.finish().await;
    }

    async fn finish(mut self) {
        self.channel.shutdown().await;
        // The read loop normally ends on its own once the transport closes;
        // abort it if the peer never closes its half.
        if tokio::time::timeout(Duration::from_secs(1), &mut self.read_loop)
            .await
            .is_err()
        {
            self.read_loop.abort();
        }
    }

    async fn expect_reply(&self, pending: PendingResponse) -> ProtocolResult<ResponseValue> {
        match pending.get(self.config.response_timeout).await? {
            None => Err(ProtocolError::ChannelClosed),
            Some(reply) => match reply.payload() {
                CommandPayload::Response { value } => Ok(value.clone()),
                other => Err(ProtocolError::decode(format!(
                    "reply carried a non-response payload: {}",
                    other.kind()
                ))),
            },
        }
    }
}

async fn read_loop(
    mut reader: ChannelReader,
    channel: Channel,
    sink: Arc<dyn OutputSink>,
    closing: Arc<AtomicBool>,
) {
    loop {
        let command = match reader.read_command().await {
            Ok(command) => command,
            Err(ProtocolError::EndOfStream) if closing.load(Ordering::SeqCst) => break,
            Err(err) => {
                warn!(error = %err, "session ended unexpectedly");
                break;
            }
        };
        if deliver(&command, &channel, &sink, &closing).await {
            break;
        }
    }
}

/// Handles one inbound command; returns `true` when the session is over.
async fn deliver(
    command: &Command,
    channel: &Channel,
    sink: &Arc<dyn OutputSink>,
    closing: &Arc<AtomicBool>,
) -> bool {
    let line = match command.payload() {
        CommandPayload::Event { name } => name.clone(),
        CommandPayload::Message { text } => text.clone(),
        CommandPayload::Error { cause } => format!("probe error: {cause}"),
        CommandPayload::Exit { code } => {
            info!(code, "target is ending the session");
            closing.store(true, Ordering::SeqCst);
            let ack = channel
                .send_response(
                    command,
                    CommandPayload::Response {
                        value: ResponseValue::Ack,
                    },
                )
                .await;
            if let Err(err) = ack {
                debug!(error = %err, "Exit acknowledgement not sent");
            }
            channel.close();
            return true;
        }
        other => {
            debug!(kind = %other.kind(), "ignoring unexpected command");
            return false;
        }
    };
    if let Err(err) = sink.write_line(&line) {
        warn!(error = %err, "output sink failed; stopping delivery");
        return true;
    }
    false
}
