//! Fixed tuning constants for the streaming path, plus the adapter config.
//!
//! The constants are compiled in: they describe latency/underrun trade-offs
//! of the transport and are not meant to be changed per deployment.

use std::time::Duration;

/// Target ring depth for DSD streams.
pub const DSD_BUFFER_SECONDS: f32 = 0.8;
/// Target ring depth for PCM streams.
pub const PCM_BUFFER_SECONDS: f32 = 1.0;

/// Prefill before the first real audio buffer, DSD.
pub const DSD_PREFILL_MS: usize = 200;
/// Prefill before the first real audio buffer, PCM above 48 kHz.
pub const PCM_PREFILL_MS: usize = 50;
/// Prefill for PCM at or below 48 kHz.
pub const PCM_LOWRATE_PREFILL_MS: usize = 100;
/// Lower bound for any prefill target.
pub const MIN_PREFILL_BYTES: usize = 1024;

/// Ring capacity bounds in bytes.
pub const MIN_BUFFER_BYTES: usize = 3_072_000;
pub const MAX_BUFFER_BYTES: usize = 16_777_216;

/// Idle patterns written while no audio is available.
pub const PCM_SILENCE_BYTE: u8 = 0x00;
pub const DSD_SILENCE_BYTE: u8 = 0x69;

/// Delay before re-arming playback shortly after a stop.
pub const DAC_STABILIZATION_MS: u64 = 100;
/// How long `open` waits for the transport to come online.
pub const ONLINE_WAIT_MS: u64 = 2000;
/// Silence buffers emitted by the pull side right after a (re)start.
pub const POST_ONLINE_SILENCE_BUFFERS: u32 = 50;
/// Silence buffers emitted by a non-immediate stop before going idle.
pub const POST_STOP_SILENCE_BUFFERS: u32 = 20;

/// Default link MTU and the per-packet protocol overhead.
pub const DEFAULT_MTU: u32 = 1500;
pub const MTU_OVERHEAD: u32 = 24;
/// Bounds for the transport cycle time.
pub const MIN_CYCLE_US: u32 = 100;
pub const MAX_CYCLE_US: u32 = 50_000;

/// Scratch area used by the converting push paths.
pub const STAGING_SIZE: usize = 65_536;
/// Samples inspected by one S24 alignment detection pass.
pub const ALIGNMENT_PROBE_SAMPLES: usize = 32;
/// Silent samples after which a deferred alignment falls back to the hint.
pub const DEFERRED_TIMEOUT_SAMPLES: usize = 48_000;

/// Cadence chunk sizes (samples per `process()` call).
pub const PCM_CHUNK_LOW: usize = 2048;
pub const PCM_CHUNK_MID: usize = 4096;
pub const PCM_CHUNK_HIGH: usize = 8192;
/// 4096 planar bytes per channel; a chunk wider than [`STAGING_SIZE`] is
/// converted in several staging passes.
pub const DSD_CHUNK: usize = 32_768;

/// Jitter buffer targets by encoding class.
pub const COMPRESSED_JITTER_MS: u64 = 200;
pub const UNCOMPRESSED_JITTER_MS: u64 = 100;

/// Caller-side PCM retry policy.
pub const MICROSLEEP: Duration = Duration::from_micros(500);
pub const MAX_WAIT: Duration = Duration::from_millis(20);
pub const MAX_RETRIES: u32 = (MAX_WAIT.as_micros() / MICROSLEEP.as_micros()) as u32;
pub const CRITICAL_BUFFER_LEVEL: f32 = 0.10;

/// DSD sends are atomic; retried with a coarser sleep.
pub const DSD_MAX_RETRIES: u32 = 100;
pub const DSD_RETRY_SLEEP: Duration = Duration::from_millis(5);

/// Idle step of the cadence loop while not playing.
pub const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Bounded waits at the quiescence points.
pub const RECONFIGURE_TIMEOUT: Duration = Duration::from_millis(200);
pub const CALLBACK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection adapter settings.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// MTU override for the cycle-time calculation; `None` asks the transport.
    pub mtu: Option<u32>,
    /// How long `open` waits for the transport to come online.
    pub online_wait: Duration,
    /// How long a reconfiguration waits for in-flight users to drain.
    pub reconfigure_timeout: Duration,
    /// Silence buffers emitted after a (re)start before real audio.
    pub post_online_silence_buffers: u32,
    /// Silence buffers emitted by a non-immediate stop.
    pub post_stop_silence_buffers: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mtu: None,
            online_wait: Duration::from_millis(ONLINE_WAIT_MS),
            reconfigure_timeout: RECONFIGURE_TIMEOUT,
            post_online_silence_buffers: POST_ONLINE_SILENCE_BUFFERS,
            post_stop_silence_buffers: POST_STOP_SILENCE_BUFFERS,
        }
    }
}
