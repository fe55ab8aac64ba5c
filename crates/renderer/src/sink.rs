//! Delivery sink between the playback engine and the sync adapter.
//!
//! Runs on the cadence thread. Opens (or reconfigures) the adapter when the
//! track format changes, forwards the S24 alignment hint of every new track,
//! and applies the caller-side flow control:
//! - PCM: retry only the unsent remainder with short sleeps, a bounded number
//!   of times in a row; if the ring was already critically low when the chunk
//!   arrived, drop it on the first refusal instead of stalling.
//! - DSD: chunks are atomic and retried whole with a coarser sleep.

use std::sync::Arc;
use std::time::Duration;

use stream_core::config::{
    CRITICAL_BUFFER_LEVEL, DSD_MAX_RETRIES, DSD_RETRY_SLEEP, MAX_RETRIES, MICROSLEEP,
};
use stream_core::engine::{AudioPayload, AudioSink, DeliveryResult};
use stream_core::format::{AudioFormat, TrackInfo};
use stream_core::gate::CallbackGate;
use stream_core::{AudioProducer, OpenResult, SyncAdapter};

/// How long and how often a refused send is retried.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub sleep: Duration,
}

impl RetryPolicy {
    pub const PCM: Self = Self {
        max_retries: MAX_RETRIES,
        sleep: MICROSLEEP,
    };
    pub const DSD: Self = Self {
        max_retries: DSD_MAX_RETRIES,
        sleep: DSD_RETRY_SLEEP,
    };
}

/// Push `data` in pieces through `send`, retrying refusals per `policy`.
///
/// `critical` abandons the chunk at the first refusal; the chunk then counts
/// as delivered so the engine moves on.
pub fn send_incremental(
    data: &[u8],
    critical: bool,
    policy: RetryPolicy,
    mut send: impl FnMut(&[u8]) -> usize,
) -> DeliveryResult {
    let mut offset = 0;
    let mut retries = 0;
    while offset < data.len() && retries < policy.max_retries {
        let n = send(&data[offset..]);
        if n > 0 {
            offset += n;
            retries = 0;
            continue;
        }
        if critical {
            tracing::debug!(
                dropped = data.len() - offset,
                "buffer critical; dropping rest of chunk"
            );
            return DeliveryResult::sent(data.len());
        }
        std::thread::sleep(policy.sleep);
        retries += 1;
    }
    if offset == data.len() {
        DeliveryResult::sent(offset)
    } else {
        DeliveryResult::backpressure(offset)
    }
}

/// Offer an atomic chunk until it is taken or the retries run out.
pub fn send_atomic(
    data: &[u8],
    policy: RetryPolicy,
    mut send: impl FnMut(&[u8]) -> usize,
) -> bool {
    for attempt in 0..policy.max_retries.max(1) {
        if send(data) > 0 {
            return true;
        }
        if attempt + 1 < policy.max_retries {
            std::thread::sleep(policy.sleep);
        }
    }
    false
}

pub struct AdapterSink {
    adapter: Arc<SyncAdapter>,
    producer: AudioProducer,
    gate: Arc<CallbackGate>,
    active_format: Option<AudioFormat>,
    hinted_uri: Option<String>,
    dropped_dsd_chunks: u64,
    pcm_policy: RetryPolicy,
    dsd_policy: RetryPolicy,
}

impl AdapterSink {
    pub fn new(adapter: Arc<SyncAdapter>, producer: AudioProducer, gate: Arc<CallbackGate>) -> Self {
        Self {
            adapter,
            producer,
            gate,
            active_format: None,
            hinted_uri: None,
            dropped_dsd_chunks: 0,
            pcm_policy: RetryPolicy::PCM,
            dsd_policy: RetryPolicy::DSD,
        }
    }

    pub fn with_policies(mut self, pcm: RetryPolicy, dsd: RetryPolicy) -> Self {
        self.pcm_policy = pcm;
        self.dsd_policy = dsd;
        self
    }

    /// Open the adapter on first use, after a stop, or on a format change.
    fn ensure_open(&mut self, format: &AudioFormat, track: &TrackInfo) -> OpenResult<()> {
        let mut needs_open = !self.adapter.is_playing();
        if !needs_open && self.active_format.as_ref() != Some(format) {
            tracing::info!(
                old = ?self.active_format,
                new_rate_hz = format.sample_rate,
                new_bits = format.bit_depth,
                new_dsd = format.is_dsd,
                "format change detected"
            );
            self.adapter.stop_playback(true);
            needs_open = true;
        }

        if needs_open {
            self.adapter.open(format)?;
            self.active_format = Some(*format);
            self.forward_hint(track);
        } else if self.hinted_uri.as_deref() != Some(track.uri.as_str()) {
            // Gapless transition within the same format.
            self.forward_hint(track);
        }
        Ok(())
    }

    fn forward_hint(&mut self, track: &TrackInfo) {
        self.producer.set_alignment_hint(track.s24_alignment);
        self.hinted_uri = Some(track.uri.clone());
        tracing::debug!(uri = %track.uri, hint = ?track.s24_alignment, "s24 hint forwarded");
    }

    fn deliver_dsd(&mut self, data: &[u8]) -> DeliveryResult {
        let producer = &mut self.producer;
        if !send_atomic(data, self.dsd_policy, |chunk| producer.send_audio(chunk)) {
            self.dropped_dsd_chunks += 1;
            tracing::warn!(
                bytes = data.len(),
                dropped = self.dropped_dsd_chunks,
                "dsd chunk not accepted in time; dropped"
            );
        }
        DeliveryResult::sent(data.len())
    }

    fn deliver_pcm(&mut self, data: &[u8]) -> DeliveryResult {
        let critical = self.adapter.buffer_level() < CRITICAL_BUFFER_LEVEL;
        let producer = &mut self.producer;
        send_incremental(data, critical, self.pcm_policy, |chunk| {
            producer.send_audio(chunk)
        })
    }
}

impl AudioSink for AdapterSink {
    fn deliver(&mut self, payload: &AudioPayload<'_>, track: &TrackInfo) -> DeliveryResult {
        let gate = self.gate.clone();
        let Some(_running) = gate.enter() else {
            return DeliveryResult::stop();
        };

        let format = track.format();
        if let Err(err) = self.ensure_open(&format, track) {
            tracing::error!(error = %err, "failed to open transport stream");
            return DeliveryResult::stop();
        }

        let data = &payload.data[..payload.bytes];
        if format.is_dsd {
            self.deliver_dsd(data)
        } else {
            self.deliver_pcm(data)
        }
    }
}
