//! Agent binary: bind the control endpoint and serve sessions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use probewire_core::sink::WriterSink;
use probewire_agent::context::{
    DirExtensionRepository, ExtensionRepository, NoExtensions, NullEngine, SessionContext,
};
use probewire_agent::server::{ServerConfig, SessionRegistry, DEFAULT_BIND_ADDR};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "probewire-agent", version, about = "Target-side tracing agent")]
struct Args {
    /// Address to listen on for control connections.
    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    bind: String,

    /// Accept timeout in seconds; the agent exits after one idle timeout
    /// with no live sessions.
    #[arg(long, default_value_t = 30)]
    accept_timeout_secs: u64,

    /// Maximum concurrently connected sessions.
    #[arg(long, default_value_t = 100)]
    max_sessions: usize,

    /// Directory of extension `.so` files resolvable by install requests.
    #[arg(long)]
    extensions_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = ServerConfig::default()
        .with_accept_timeout(Duration::from_secs(args.accept_timeout_secs))
        .with_max_sessions(args.max_sessions);

    let extensions_dir = args.extensions_dir.clone();
    let registry = Arc::new(SessionRegistry::new(
        config,
        Box::new(move |_id, speculation| {
            let extensions: Arc<dyn ExtensionRepository> = match &extensions_dir {
                Some(dir) => Arc::new(DirExtensionRepository::new(dir.clone())),
                None => Arc::new(NoExtensions),
            };
            SessionContext {
                engine: Arc::new(NullEngine::new()),
                extensions,
                sink: Arc::new(WriterSink::stdout()),
                speculation,
            }
        }),
    ));

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            let _ = stop_tx.send(true);
        }
    });

    registry.run(listener, stop_rx).await;
    info!("agent stopped");
    Ok(())
}
