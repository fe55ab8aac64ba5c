//! Stream format descriptors and the buffer/timing arithmetic derived from them.

use std::time::Duration;

use crate::config::{
    COMPRESSED_JITTER_MS, DSD_PREFILL_MS, MAX_BUFFER_BYTES, MAX_CYCLE_US, MIN_BUFFER_BYTES, MIN_CYCLE_US,
    MIN_PREFILL_BYTES, MTU_OVERHEAD, PCM_LOWRATE_PREFILL_MS, PCM_PREFILL_MS,
    UNCOMPRESSED_JITTER_MS,
};

/// Bit order of a DSD source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DsdSubFormat {
    /// DSF files store each byte LSB-first.
    #[default]
    Dsf,
    /// DFF (DSDIFF) files store each byte MSB-first.
    Dff,
}

impl DsdSubFormat {
    pub fn is_msb_first(self) -> bool {
        matches!(self, DsdSubFormat::Dff)
    }
}

/// Alignment hint for 24-bit samples carried in 32-bit containers.
///
/// Reported by the decoder; sample-based detection takes priority over it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum S24Hint {
    #[default]
    Unknown,
    LsbAligned,
    MsbAligned,
}

/// Format as negotiated with the transport.
///
/// Equality only looks at rate, depth, channel count and the DSD flag: two
/// formats that compare equal can share a ring configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct AudioFormat {
    /// Sample rate in Hz; for DSD the 1-bit rate (2.8224 MHz for DSD64).
    pub sample_rate: u32,
    /// Bits per sample; 1 for DSD.
    pub bit_depth: u32,
    pub channels: u32,
    pub is_dsd: bool,
    pub is_compressed: bool,
    pub dsd_format: DsdSubFormat,
}

impl PartialEq for AudioFormat {
    fn eq(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate
            && self.bit_depth == other.bit_depth
            && self.channels == other.channels
            && self.is_dsd == other.is_dsd
    }
}

impl Eq for AudioFormat {}

impl AudioFormat {
    pub fn pcm(sample_rate: u32, bit_depth: u32, channels: u32) -> Self {
        Self {
            sample_rate,
            bit_depth,
            channels,
            ..Self::default()
        }
    }

    pub fn dsd(bit_rate: u32, channels: u32, dsd_format: DsdSubFormat) -> Self {
        Self {
            sample_rate: bit_rate,
            bit_depth: 1,
            channels,
            is_dsd: true,
            is_compressed: false,
            dsd_format,
        }
    }

    /// Bytes one input frame occupies in the buffers handed to `send_audio`.
    ///
    /// 24-bit PCM arrives in 32-bit containers. DSD has no byte-aligned frame
    /// and reports one byte per channel.
    pub fn input_frame_bytes(&self) -> usize {
        let channels = self.channels.max(1) as usize;
        if self.is_dsd {
            return channels;
        }
        match self.bit_depth {
            24 | 32 => 4 * channels,
            bits => (bits as usize / 8).max(1) * channels,
        }
    }

    /// `true` for 44.1/48 kHz class PCM, which gets a longer prefill.
    pub fn is_low_rate(&self) -> bool {
        !self.is_dsd && self.sample_rate <= 48_000
    }

    /// Latency the sink holds back before playing the first buffer.
    pub fn jitter_target(&self) -> Duration {
        if self.is_compressed {
            Duration::from_millis(COMPRESSED_JITTER_MS)
        } else {
            Duration::from_millis(UNCOMPRESSED_JITTER_MS)
        }
    }

    /// Nominal source bitrate, logged when a stream is configured.
    pub fn bits_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.bit_depth as u64 * self.channels as u64
    }
}

/// Properties of one decoded track, immutable once the decoder has opened it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackInfo {
    pub uri: String,
    pub metadata: String,
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
    pub codec: String,
    /// Total length in samples per channel; 0 when unknown.
    pub duration_samples: u64,
    pub is_dsd: bool,
    /// DSD multiple (64, 128, ...); 0 for PCM.
    pub dsd_rate: u32,
    pub is_compressed: bool,
    pub dsd_source: Option<DsdSubFormat>,
    pub s24_alignment: S24Hint,
}

impl TrackInfo {
    /// Transport format for this track.
    ///
    /// When the container did not reveal the DSD bit order, codec names
    /// containing `lsb` are taken as DSF and everything else as DFF.
    pub fn format(&self) -> AudioFormat {
        if self.is_dsd {
            let sub = self.dsd_source.unwrap_or_else(|| {
                if self.codec.to_ascii_lowercase().contains("lsb") {
                    DsdSubFormat::Dsf
                } else {
                    DsdSubFormat::Dff
                }
            });
            return AudioFormat::dsd(self.sample_rate, self.channels, sub);
        }
        AudioFormat {
            is_compressed: self.is_compressed,
            ..AudioFormat::pcm(self.sample_rate, self.bit_depth, self.channels)
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        (self.duration_samples > 0 && self.sample_rate > 0)
            .then(|| self.duration_samples as f64 / self.sample_rate as f64)
    }
}

/// Ring capacity for `seconds` of audio, clamped to the global bounds.
pub fn buffer_size_bytes(bytes_per_second: usize, seconds: f32) -> usize {
    let size = (bytes_per_second as f64 * seconds as f64) as usize;
    size.clamp(MIN_BUFFER_BYTES, MAX_BUFFER_BYTES)
}

/// Bytes that must be buffered before the first real audio is released.
pub fn prefill_bytes(bytes_per_second: usize, is_dsd: bool, low_rate: bool) -> usize {
    let ms = if is_dsd {
        DSD_PREFILL_MS
    } else if low_rate {
        PCM_LOWRATE_PREFILL_MS
    } else {
        PCM_PREFILL_MS
    };
    (bytes_per_second * ms / 1000).max(MIN_PREFILL_BYTES)
}

/// Packet cycle time: one MTU payload worth of audio, in microseconds.
#[derive(Clone, Copy, Debug)]
pub struct CycleCalculator {
    payload_bytes: u32,
}

impl CycleCalculator {
    pub fn new(mtu: u32) -> Self {
        Self {
            payload_bytes: mtu.saturating_sub(MTU_OVERHEAD).max(1),
        }
    }

    pub fn cycle_time_us(&self, sample_rate: u32, channels: u32, bits_per_sample: u32) -> u32 {
        let bytes_per_second =
            sample_rate as f64 * channels as f64 * bits_per_sample as f64 / 8.0;
        if bytes_per_second <= 0.0 {
            return MAX_CYCLE_US;
        }
        let us = (self.payload_bytes as f64 / bytes_per_second * 1_000_000.0).round();
        (us.min(u32::MAX as f64) as u32).clamp(MIN_CYCLE_US, MAX_CYCLE_US)
    }
}
