//! Inbound command execution.
//!
//! One handler per command kind, run by the session read loop against the
//! session's [`SessionContext`]. A handler failure is isolated: the loop
//! logs it and keeps reading, so one bad command never kills the session.
//! Only an Exit asks the loop to stop, via [`Disposition::Disconnect`].

use probewire_core::channel::Channel;
use probewire_core::protocol::{Command, CommandPayload, ProtocolError, ResponseValue};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::{Extension, SessionContext};

/// What the read loop should do after a command was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep reading.
    Continue,
    /// The peer asked the session to end; run the disconnect sequence.
    Disconnect {
        /// Exit code carried by the peer's request.
        code: i32,
    },
}

/// A single command's handler failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The reply could not be enqueued.
    #[error("reply failed: {0}")]
    Reply(#[from] ProtocolError),

    /// The local output sink refused the write.
    #[error("output sink failed: {0}")]
    Sink(#[from] std::io::Error),
}

/// Convention for naming an extension inside an install request's args.
const EXTENSION_ARG: &str = "extension=";

/// Executes one inbound command against the session's collaborators.
///
/// # Errors
///
/// [`DispatchError`] for failures local to this command; the caller logs
/// and continues.
pub async fn execute(
    context: &SessionContext,
    channel: &Channel,
    command: &Command,
) -> Result<Disposition, DispatchError> {
    match command.payload() {
        CommandPayload::Instrument { code, args } => {
            install(context, channel, command, code, args).await?;
            Ok(Disposition::Continue)
        }
        CommandPayload::Status => {
            let status = format!(
                "state=connected installed={} live_speculations={}",
                context.engine.installed_count(),
                context.speculation.live_speculations(),
            );
            channel
                .send_response(
                    command,
                    CommandPayload::Response {
                        value: ResponseValue::Text(status),
                    },
                )
                .await?;
            Ok(Disposition::Continue)
        }
        CommandPayload::Exit { code } => {
            info!(code, "peer requested session end");
            channel
                .send_response(
                    command,
                    CommandPayload::Response {
                        value: ResponseValue::Ack,
                    },
                )
                .await?;
            Ok(Disposition::Disconnect { code: *code })
        }
        CommandPayload::Message { text } => {
            context.sink.write_line(text)?;
            Ok(Disposition::Continue)
        }
        CommandPayload::Event { name } => {
            context.sink.write_line(name)?;
            Ok(Disposition::Continue)
        }
        CommandPayload::Error { cause } => {
            warn!(cause = %cause, "peer reported an error");
            context.sink.write_line(&format!("peer error: {cause}"))?;
            Ok(Disposition::Continue)
        }
        // Responses are consumed by the channel reader before dispatch.
        CommandPayload::Response { .. } => {
            debug!(rx = command.rx(), "response reached dispatch; ignoring");
            Ok(Disposition::Continue)
        }
        CommandPayload::Opaque { kind, .. } => {
            debug!(kind = %kind, "no handler for opaque command");
            Ok(Disposition::Continue)
        }
    }
}

async fn install(
    context: &SessionContext,
    channel: &Channel,
    command: &Command,
    code: &[u8],
    args: &[String],
) -> Result<(), DispatchError> {
    let extension = match resolve_extension(context, args) {
        Ok(extension) => extension,
        Err(name) => {
            warn!(name, "install names an unknown extension");
            reply_installed(channel, command, false).await?;
            report_error(channel, format!("unknown extension: {name}")).await;
            return Ok(());
        }
    };

    match context.engine.install(code, args, extension.as_ref()) {
        Ok(()) => reply_installed(channel, command, true).await?,
        Err(err) => {
            warn!(error = %err, "instrumentation install failed");
            reply_installed(channel, command, false).await?;
            report_error(channel, err.to_string()).await;
        }
    }
    Ok(())
}

/// Resolves an `extension=<name>` arg, or returns the unknown name.
fn resolve_extension<'a>(
    context: &SessionContext,
    args: &'a [String],
) -> Result<Option<Extension>, &'a str> {
    let Some(name) = args
        .iter()
        .find_map(|arg| arg.strip_prefix(EXTENSION_ARG))
    else {
        return Ok(None);
    };
    match context.extensions.resolve(name) {
        Some(extension) => Ok(Some(extension)),
        None => Err(name),
    }
}

async fn reply_installed(
    channel: &Channel,
    command: &Command,
    installed: bool,
) -> Result<(), ProtocolError> {
    channel
        .send_response(
            command,
            CommandPayload::Response {
                value: ResponseValue::Flag(installed),
            },
        )
        .await
}

/// Best-effort error report to the peer; a failure here only gets logged.
async fn report_error(channel: &Channel, cause: String) {
    if let Err(err) = channel.send(CommandPayload::Error { cause }).await {
        debug!(error = %err, "error report not sent");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use probewire_core::channel::ChannelConfig;
    use probewire_core::protocol::{CommandRegistry, Scope};
    use probewire_core::sink::MemorySink;
    use probewire_core::speculation::{SpeculationConfig, SpeculativeQueueManager};

    use super::*;
    use crate::context::{DirExtensionRepository, NoExtensions, NullEngine};

    struct Fixture {
        context: SessionContext,
        channel: Channel,
        sink: Arc<MemorySink>,
        _keepalive: (probewire_core::channel::ChannelReader, Channel),
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(CommandRegistry::catalog(Scope::Target));
        let (left, right) = tokio::io::duplex(1 << 16);
        let (channel, reader) = Channel::new(left, registry.clone(), ChannelConfig::default());
        let (peer, _peer_reader) = Channel::new(
            right,
            Arc::new(CommandRegistry::catalog(Scope::Control)),
            ChannelConfig::default(),
        );

        let sink = Arc::new(MemorySink::new());
        let speculation = Arc::new(SpeculativeQueueManager::new(
            registry,
            SpeculationConfig::default(),
        ));
        let context = SessionContext {
            engine: Arc::new(NullEngine::new()),
            extensions: Arc::new(NoExtensions),
            sink: sink.clone(),
            speculation,
        };
        Fixture {
            context,
            channel,
            sink,
            _keepalive: (reader, peer),
        }
    }

    fn inbound(channel: &Channel, payload: CommandPayload) -> Command {
        channel.registry().create(payload).unwrap()
    }

    #[tokio::test]
    async fn install_accepts_code_and_counts_it() {
        let fx = fixture();
        let command = inbound(
            &fx.channel,
            CommandPayload::Instrument {
                code: vec![0x01, 0x02],
                args: vec![],
            },
        );
        let disposition = execute(&fx.context, &fx.channel, &command).await.unwrap();
        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(fx.context.engine.installed_count(), 1);
    }

    #[tokio::test]
    async fn install_with_unknown_extension_is_refused() {
        let fx = fixture();
        let command = inbound(
            &fx.channel,
            CommandPayload::Instrument {
                code: vec![0x01],
                args: vec!["extension=missing".into()],
            },
        );
        execute(&fx.context, &fx.channel, &command).await.unwrap();
        assert_eq!(fx.context.engine.installed_count(), 0);
    }

    #[tokio::test]
    async fn install_resolves_a_present_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("heapwatch.so"), b"\x7fELF").unwrap();

        let mut fx = fixture();
        fx.context.extensions = Arc::new(DirExtensionRepository::new(dir.path()));

        let command = inbound(
            &fx.channel,
            CommandPayload::Instrument {
                code: vec![0x01],
                args: vec!["extension=heapwatch".into()],
            },
        );
        execute(&fx.context, &fx.channel, &command).await.unwrap();
        assert_eq!(fx.context.engine.installed_count(), 1);
    }

    #[tokio::test]
    async fn exit_acknowledges_and_asks_for_disconnect() {
        let fx = fixture();
        let command = inbound(&fx.channel, CommandPayload::Exit { code: 7 });
        let disposition = execute(&fx.context, &fx.channel, &command).await.unwrap();
        assert_eq!(disposition, Disposition::Disconnect { code: 7 });
    }

    #[tokio::test]
    async fn messages_and_errors_reach_the_sink() {
        let fx = fixture();
        let message = inbound(
            &fx.channel,
            CommandPayload::Message {
                text: "hello".into(),
            },
        );
        let error = inbound(
            &fx.channel,
            CommandPayload::Error {
                cause: "probe exploded".into(),
            },
        );
        execute(&fx.context, &fx.channel, &message).await.unwrap();
        execute(&fx.context, &fx.channel, &error).await.unwrap();
        assert_eq!(
            fx.sink.lines(),
            vec!["hello", "peer error: probe exploded"]
        );
    }

    #[tokio::test]
    async fn status_reports_installed_count() {
        let fx = fixture();
        fx.context
            .engine
            .install(&[0x01], &[], None)
            .unwrap();
        let command = inbound(&fx.channel, CommandPayload::Status);
        let disposition = execute(&fx.context, &fx.channel, &command).await.unwrap();
        assert_eq!(disposition, Disposition::Continue);
    }
}
