//! `renderer` binary: plays local files through the gapless streaming core.
//!
//! Tracks are decoded with Symphonia, queued back to back on the playback
//! engine, converted to the sink's wire format and pulled by the transport
//! worker at the packet cadence. Raw output can be written to a file.

use anyhow::{Context, Result};
use clap::Parser;
use renderer::cli::{Args, Command};
use renderer::config::PlayConfig;
use renderer::runtime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,renderer=info,stream_core=info")
        }))
        .init();

    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    match &args.cmd {
        Command::Play { uris, start } => {
            let config = PlayConfig {
                renderer: args.renderer_config(),
                uris: uris.clone(),
                start: start.clone(),
            };
            let status = runtime::run_play(config, Some(interrupt_rx))?;
            if args.status_json {
                let json = serde_json::to_string_pretty(&status).context("encode status")?;
                println!("{json}");
            }
        }
    }
    Ok(())
}
