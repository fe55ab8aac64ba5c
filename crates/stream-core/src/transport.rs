//! Capability interface of the network transport.
//!
//! The transport owns its worker thread and pulls buffers through
//! [`crate::sync::AudioConsumer::pull`]; this trait only covers what the
//! adapter needs from the control side.

use std::time::Duration;

use crate::config::DEFAULT_MTU;
use crate::error::OpenResult;
use crate::format::AudioFormat;

/// Wire encoding the sink accepts for a given source format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkEncoding {
    /// Integer PCM with `bits` per sample on the wire (16, 24 packed or 32).
    Pcm { bits: u32 },
    /// Native DSD in 32-bit words.
    Dsd { msb_first: bool, little_endian: bool },
}

impl SinkEncoding {
    /// Bytes one sample of one channel occupies in the ring.
    pub fn ring_bytes_per_sample(self) -> usize {
        match self {
            SinkEncoding::Pcm { bits } => (bits as usize / 8).max(1),
            SinkEncoding::Dsd { .. } => 4,
        }
    }
}

pub trait Transport: Send + Sync {
    /// Encoding the sink would use for `format`, or `None` if it cannot carry it.
    fn negotiate(&self, format: &AudioFormat) -> Option<SinkEncoding>;

    /// (Re)open the stream for `format` at the given packet cycle.
    fn connect(&self, format: &AudioFormat, cycle_time: Duration) -> OpenResult<()>;

    fn disconnect(&self);

    fn is_online(&self) -> bool;

    fn mtu(&self) -> u32 {
        DEFAULT_MTU
    }
}
