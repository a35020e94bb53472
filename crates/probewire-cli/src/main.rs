//! Control-process CLI: attach, instrument, stream.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::Parser;
use probewire_core::client::{Client, ClientConfig};
use probewire_core::sink::WriterSink;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "probewire",
    version,
    about = "Attach to a target agent and stream trace output"
)]
struct Args {
    /// Agent address to attach to.
    #[arg(long, default_value = "127.0.0.1:2020")]
    addr: String,

    /// Compiled instrumentation blob to install after attaching.
    #[arg(long)]
    install: Option<PathBuf>,

    /// Extra install arguments, e.g. `extension=heapwatch`.
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Print the target's status line after attaching.
    #[arg(long)]
    status: bool,

    /// Ask the target to end the session on exit instead of detaching.
    #[arg(long)]
    end_session: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();
    let client = Client::connect(
        &args.addr,
        Arc::new(WriterSink::stdout()),
        ClientConfig::default(),
    )
    .await
    .with_context(|| format!("attaching to {}", args.addr))?;
    info!(addr = %args.addr, "attached");

    if let Some(path) = &args.install {
        let code = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let installed = client
            .install(code, args.args.clone())
            .await
            .context("install request failed")?;
        if !installed {
            bail!("target refused the instrumentation");
        }
        info!("instrumentation installed");
    }

    if args.status {
        let status = client.status().await.context("status request failed")?;
        println!("{status}");
    }

    // Stream trace output until interrupted.
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    if args.end_session {
        client.shutdown(0).await;
    } else {
        client.detach().await;
    }
    Ok(())
}
