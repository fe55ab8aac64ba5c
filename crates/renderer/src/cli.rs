use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{RendererConfig, SinkProfile};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "renderer", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Friendly name announced to control points
    #[arg(long, default_value = "Gapless Network Renderer")]
    pub name: String,

    /// Write transport output to this file instead of discarding it
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// PCM word size the sink accepts (16, 24 or 32)
    #[arg(long, default_value_t = 32, value_parser = parse_sink_bits)]
    pub sink_bits: u32,

    /// Sink expects DSD bytes LSB-first (DSF order)
    #[arg(long)]
    pub dsd_lsb_first: bool,

    /// Sink expects DSD words little-endian (byte-swapped groups)
    #[arg(long)]
    pub dsd_little_endian: bool,

    /// Link MTU used for the packet cycle time
    #[arg(long, default_value_t = 1500)]
    pub mtu: u32,

    /// Play each track separately instead of chaining them gaplessly
    #[arg(long)]
    pub no_gapless: bool,

    /// Print the final renderer status as JSON
    #[arg(long)]
    pub status_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play one or more local files in order
    Play {
        /// Audio files or file:// URIs
        #[arg(required = true)]
        uris: Vec<String>,

        /// Start position of the first track (HH:MM:SS, MM:SS or seconds)
        #[arg(long)]
        start: Option<String>,
    },
}

impl Args {
    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            name: self.name.clone(),
            sink: SinkProfile {
                pcm_bits: self.sink_bits,
                dsd_msb_first: !self.dsd_lsb_first,
                dsd_little_endian: self.dsd_little_endian,
            },
            mtu: self.mtu,
            output: self.output.clone(),
            gapless: !self.no_gapless,
            ..RendererConfig::default()
        }
    }
}

fn parse_sink_bits(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(bits @ (16 | 24 | 32)) => Ok(bits),
        _ => Err(format!("unsupported sink word size {value:?} (expected 16, 24 or 32)")),
    }
}
