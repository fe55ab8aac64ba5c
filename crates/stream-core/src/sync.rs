//! Flow control and format negotiation between the engine and the transport.
//!
//! A [`SyncAdapter`] owns one [`RingChannel`] per connection and splits the
//! data path into two single-owner handles:
//! - [`AudioProducer`]: non-blocking `send_audio`, called by the delivery sink
//!   on the cadence thread.
//! - [`AudioConsumer`]: `pull`, called by the transport worker once per cycle.
//!
//! Handles cache the stream parameters they need and re-read them only when
//! the matching generation counter moves, so the per-call paths touch
//! atomics only. A format change goes through a [`ReconfigureGuard`]: new
//! sends are refused, in-flight sends/pulls and any outstanding zero-copy
//! lease are waited for (bounded), then the ring is rebuilt.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{
    DEFAULT_MTU, DSD_BUFFER_SECONDS, DSD_SILENCE_BYTE, MAX_BUFFER_BYTES, PCM_BUFFER_SECONDS,
    PCM_SILENCE_BYTE, SyncConfig,
};
use crate::convert::{AlignmentState, FormatConverter};
use crate::error::{OpenError, OpenResult};
use crate::format::{AudioFormat, CycleCalculator, S24Hint, buffer_size_bytes, prefill_bytes};
use crate::lock;
use crate::ring::{ReadRegion, RingChannel};
use crate::transport::{SinkEncoding, Transport};

/// How samples are transformed on their way into the ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Conversion {
    #[default]
    Direct,
    Pack24,
    Upsample16To32,
    DsdPlanar { bit_reverse: bool, byte_swap: bool },
}

/// Pick the conversion that maps `format` onto what the sink accepts.
pub fn select_conversion(format: &AudioFormat, encoding: SinkEncoding) -> Option<Conversion> {
    match (format.is_dsd, encoding) {
        (
            true,
            SinkEncoding::Dsd {
                msb_first,
                little_endian,
            },
        ) => Some(Conversion::DsdPlanar {
            bit_reverse: format.dsd_format.is_msb_first() != msb_first,
            byte_swap: little_endian,
        }),
        (false, SinkEncoding::Pcm { bits }) => match (format.bit_depth, bits) {
            (16, 16) | (24, 32) | (32, 32) => Some(Conversion::Direct),
            (16, 32) => Some(Conversion::Upsample16To32),
            (24, 24) => Some(Conversion::Pack24),
            _ => None,
        },
        _ => None,
    }
}

/// Parameters derived from the negotiated format; read by the handles on
/// generation change.
#[derive(Clone, Copy, Debug)]
struct StreamParams {
    format: AudioFormat,
    conversion: Conversion,
    input_frame_bytes: usize,
    channels: usize,
    ring_frame_bytes: usize,
    frames_per_second: u64,
    cycle_us: u32,
    silence: u8,
}

impl StreamParams {
    fn derive(
        format: &AudioFormat,
        encoding: SinkEncoding,
        conversion: Conversion,
        cycle_us: u32,
    ) -> Self {
        let channels = format.channels.max(1) as usize;
        // DSD moves in 32-bit words per channel.
        let (ring_frame_bytes, frames_per_second) = if format.is_dsd {
            (4 * channels, format.sample_rate as u64 / 32)
        } else {
            (
                encoding.ring_bytes_per_sample() * channels,
                format.sample_rate as u64,
            )
        };
        Self {
            format: *format,
            conversion,
            input_frame_bytes: format.input_frame_bytes(),
            channels,
            ring_frame_bytes,
            frames_per_second,
            cycle_us,
            silence: if format.is_dsd {
                DSD_SILENCE_BYTE
            } else {
                PCM_SILENCE_BYTE
            },
        }
    }

    fn bytes_per_second(&self) -> usize {
        self.frames_per_second as usize * self.ring_frame_bytes
    }
}

impl Default for StreamParams {
    fn default() -> Self {
        let format = AudioFormat::pcm(44_100, 16, 2);
        let cycle = CycleCalculator::new(DEFAULT_MTU).cycle_time_us(44_100, 2, 16);
        Self::derive(
            &format,
            SinkEncoding::Pcm { bits: 16 },
            Conversion::Direct,
            cycle,
        )
    }
}

#[derive(Debug, Default)]
struct ControlState {
    format: Option<AudioFormat>,
    encoding: Option<SinkEncoding>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    ring: RingChannel,
    params: Mutex<StreamParams>,
    control: Mutex<ControlState>,

    open: AtomicBool,
    playing: AtomicBool,
    paused: AtomicBool,
    stop_requested: AtomicBool,

    reconfiguring: AtomicBool,
    ring_users: AtomicUsize,
    worker_active: AtomicBool,
    lease_in_use: AtomicBool,
    lease_epoch: AtomicU32,
    zero_copy_blocked: AtomicBool,

    producer_gen: AtomicU32,
    consumer_gen: AtomicU32,

    prefill_target: AtomicUsize,
    prefill_complete: AtomicBool,
    startup_silence: AtomicU32,
    stop_silence: AtomicU32,
    underruns: AtomicU64,

    producer_taken: AtomicBool,
    consumer_taken: AtomicBool,
}

/// Decrement `counter` if positive; `true` when a unit was taken.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// Blocks new sends for its lifetime and waits (bounded) for the data path
/// to go quiet. On timeout the adapter is forced into copying mode.
struct ReconfigureGuard<'a> {
    shared: &'a Shared,
}

impl<'a> ReconfigureGuard<'a> {
    fn begin(shared: &'a Shared) -> Self {
        shared.reconfiguring.store(true, Ordering::SeqCst);
        // Leases taken before this point must not advance the rebuilt ring.
        shared.lease_epoch.fetch_add(1, Ordering::SeqCst);

        let deadline = Instant::now() + shared.config.reconfigure_timeout;
        loop {
            let idle = shared.ring_users.load(Ordering::SeqCst) == 0
                && !shared.worker_active.load(Ordering::SeqCst)
                && !shared.lease_in_use.load(Ordering::SeqCst);
            if idle {
                break;
            }
            if Instant::now() >= deadline {
                tracing::error!(
                    timeout_ms = shared.config.reconfigure_timeout.as_millis() as u64,
                    "data path did not release the ring; forcing copy mode"
                );
                shared.zero_copy_blocked.store(true, Ordering::SeqCst);
                shared.lease_in_use.store(false, Ordering::SeqCst);
                break;
            }
            std::thread::yield_now();
        }
        Self { shared }
    }
}

impl Drop for ReconfigureGuard<'_> {
    fn drop(&mut self) {
        self.shared.reconfiguring.store(false, Ordering::SeqCst);
    }
}

/// In-flight marker for the quiescence protocol: raised before the
/// `reconfiguring` check, lowered on drop.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ActiveFlag<'a>(&'a AtomicBool);

impl<'a> ActiveFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ActiveFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Control side of one transport connection.
pub struct SyncAdapter {
    shared: Arc<Shared>,
}

impl SyncAdapter {
    /// Create an adapter; ring storage is allocated once for the largest
    /// configuration.
    pub fn new(transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        let shared = Shared {
            transport,
            config,
            ring: RingChannel::new(MAX_BUFFER_BYTES, PCM_SILENCE_BYTE),
            params: Mutex::new(StreamParams::default()),
            control: Mutex::new(ControlState::default()),
            open: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            reconfiguring: AtomicBool::new(false),
            ring_users: AtomicUsize::new(0),
            worker_active: AtomicBool::new(false),
            lease_in_use: AtomicBool::new(false),
            lease_epoch: AtomicU32::new(0),
            zero_copy_blocked: AtomicBool::new(false),
            producer_gen: AtomicU32::new(0),
            consumer_gen: AtomicU32::new(0),
            prefill_target: AtomicUsize::new(0),
            prefill_complete: AtomicBool::new(false),
            startup_silence: AtomicU32::new(0),
            stop_silence: AtomicU32::new(0),
            underruns: AtomicU64::new(0),
            producer_taken: AtomicBool::new(false),
            consumer_taken: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// The producer handle; `None` while another one is alive.
    pub fn take_producer(&self) -> Option<AudioProducer> {
        if self.shared.producer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(AudioProducer {
            shared: self.shared.clone(),
            converter: FormatConverter::new(),
            cache: ProducerCache::default(),
        })
    }

    /// The consumer handle; `None` while another one is alive.
    pub fn take_consumer(&self) -> Option<AudioConsumer> {
        if self.shared.consumer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut consumer = AudioConsumer {
            shared: self.shared.clone(),
            cache: ConsumerCache::default(),
            scratch: Vec::new(),
            silence: Vec::new(),
        };
        consumer.refresh();
        Some(consumer)
    }

    fn wait_online(&self) -> bool {
        let deadline = Instant::now() + self.shared.config.online_wait;
        loop {
            if self.shared.transport.is_online() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Negotiate `format` with the transport and arm playback.
    ///
    /// A format in the same family as the active one only re-arms (flushing
    /// stale audio if playback had stopped); anything else rebuilds the ring.
    pub fn open(&self, format: &AudioFormat) -> OpenResult<()> {
        let shared = &*self.shared;
        let mut control = lock(&shared.control);

        if !self.wait_online() {
            tracing::warn!("transport not online, refusing open");
            return Err(OpenError::TransportOffline);
        }
        let encoding = shared
            .transport
            .negotiate(format)
            .ok_or_else(|| OpenError::UnsupportedFormat(describe(format)))?;
        let conversion = select_conversion(format, encoding)
            .ok_or_else(|| OpenError::UnsupportedFormat(describe(format)))?;

        let same_family = shared.open.load(Ordering::Acquire)
            && control.format.as_ref() == Some(format)
            && control.encoding == Some(encoding);
        if same_family {
            if !shared.playing.load(Ordering::Acquire) {
                tracing::debug!("same format, quick resume");
                self.flush_locked(&control);
            }
        } else {
            self.reconfigure(&mut control, format, encoding, conversion)?;
        }
        self.arm_playback();
        Ok(())
    }

    fn reconfigure(
        &self,
        control: &mut ControlState,
        format: &AudioFormat,
        encoding: SinkEncoding,
        conversion: Conversion,
    ) -> OpenResult<()> {
        let shared = &*self.shared;
        let mtu = shared.config.mtu.unwrap_or_else(|| shared.transport.mtu());
        let wire_bits = match encoding {
            SinkEncoding::Pcm { bits } => bits,
            SinkEncoding::Dsd { .. } => 1,
        };
        let cycle_us =
            CycleCalculator::new(mtu).cycle_time_us(format.sample_rate, format.channels, wire_bits);
        let params = StreamParams::derive(format, encoding, conversion, cycle_us);

        shared
            .transport
            .connect(format, Duration::from_micros(cycle_us as u64))?;

        let bytes_per_second = params.bytes_per_second();
        let seconds = if format.is_dsd {
            DSD_BUFFER_SECONDS
        } else {
            PCM_BUFFER_SECONDS
        };
        let capacity = buffer_size_bytes(bytes_per_second, seconds);
        {
            let _guard = ReconfigureGuard::begin(shared);
            // SAFETY: the guard has drained sends, pulls and leases (or timed
            // out and forced copy mode).
            unsafe { shared.ring.reset_shared(capacity, params.silence) };
            *lock(&shared.params) = params;
            shared.prefill_target.store(
                prefill_bytes(bytes_per_second, format.is_dsd, format.is_low_rate()),
                Ordering::Release,
            );
            shared.prefill_complete.store(false, Ordering::Release);
            shared.producer_gen.fetch_add(1, Ordering::AcqRel);
            shared.consumer_gen.fetch_add(1, Ordering::AcqRel);
        }
        control.format = Some(*format);
        control.encoding = Some(encoding);
        shared.open.store(true, Ordering::Release);

        tracing::info!(
            rate_hz = format.sample_rate,
            bits = format.bit_depth,
            channels = format.channels,
            dsd = format.is_dsd,
            bitrate_bps = format.bits_per_second(),
            conversion = ?conversion,
            ring_bytes = shared.ring.capacity(),
            cycle_us,
            "stream configured"
        );
        Ok(())
    }

    /// Drop buffered audio without changing the configuration.
    fn flush_locked(&self, _control: &ControlState) {
        let shared = &*self.shared;
        let _guard = ReconfigureGuard::begin(shared);
        // SAFETY: quiescent under the guard.
        unsafe {
            shared
                .ring
                .reset_shared(shared.ring.capacity(), shared.ring.silence_byte())
        };
        shared.prefill_complete.store(false, Ordering::Release);
    }

    fn arm_playback(&self) {
        let shared = &*self.shared;
        shared
            .startup_silence
            .store(shared.config.post_online_silence_buffers, Ordering::Release);
        shared.stop_requested.store(false, Ordering::Release);
        shared.paused.store(false, Ordering::Release);
        shared.playing.store(true, Ordering::Release);
    }

    /// Resume pulling real audio on an open connection.
    pub fn start_playback(&self) {
        if self.shared.open.load(Ordering::Acquire) {
            self.arm_playback();
        }
    }

    /// Stop playback. `immediate` drops buffered audio; otherwise the
    /// buffered tail is played out, followed by a few silence buffers.
    pub fn stop_playback(&self, immediate: bool) {
        let shared = &*self.shared;
        if immediate {
            let control = lock(&shared.control);
            shared.playing.store(false, Ordering::Release);
            shared.paused.store(false, Ordering::Release);
            shared.stop_requested.store(false, Ordering::Release);
            if shared.open.load(Ordering::Acquire) {
                self.flush_locked(&control);
            }
        } else if shared.playing.load(Ordering::Acquire) {
            shared
                .stop_silence
                .store(shared.config.post_stop_silence_buffers, Ordering::Release);
            shared.stop_requested.store(true, Ordering::Release);
        }
    }

    pub fn pause_playback(&self) {
        if self.shared.playing.load(Ordering::Acquire) {
            self.shared.paused.store(true, Ordering::Release);
        }
    }

    pub fn resume_playback(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Tear the connection down; the next `open` reconfigures from scratch.
    pub fn close(&self) {
        let shared = &*self.shared;
        self.stop_playback(true);
        let mut control = lock(&shared.control);
        if shared.open.swap(false, Ordering::AcqRel) {
            shared.transport.disconnect();
            tracing::info!("stream closed");
        }
        control.format = None;
        control.encoding = None;
        shared.zero_copy_blocked.store(false, Ordering::Release);
    }

    /// Ring fill level in `[0, 1]`.
    pub fn buffer_level(&self) -> f32 {
        let ring = &self.shared.ring;
        ring.available() as f32 / (ring.capacity() - 1) as f32
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.ring.available()
    }

    pub fn ring_capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    pub fn underrun_count(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.shared.transport.is_online()
    }

    /// Format of the active configuration.
    pub fn format(&self) -> Option<AudioFormat> {
        lock(&self.shared.control).format
    }

    pub fn cycle_time(&self) -> Duration {
        Duration::from_micros(lock(&self.shared.params).cycle_us as u64)
    }

    pub fn prefill_target(&self) -> usize {
        self.shared.prefill_target.load(Ordering::Acquire)
    }

    /// Bumped on every producer-visible format change.
    pub fn format_generation(&self) -> u32 {
        self.shared.producer_gen.load(Ordering::Acquire)
    }

    /// `true` after a reconfiguration had to force-release a zero-copy lease.
    pub fn is_zero_copy_blocked(&self) -> bool {
        self.shared.zero_copy_blocked.load(Ordering::Acquire)
    }
}

fn describe(format: &AudioFormat) -> String {
    if format.is_dsd {
        format!("DSD {} Hz x{}", format.sample_rate, format.channels)
    } else {
        format!(
            "PCM {} Hz/{} bit x{}",
            format.sample_rate, format.bit_depth, format.channels
        )
    }
}

#[derive(Debug, Default)]
struct ProducerCache {
    generation: Option<u32>,
    conversion: Conversion,
    input_frame_bytes: usize,
    channels: usize,
}

/// Send side of the adapter. Exactly one exists at a time.
pub struct AudioProducer {
    shared: Arc<Shared>,
    converter: FormatConverter,
    cache: ProducerCache,
}

fn refresh_producer(shared: &Shared, cache: &mut ProducerCache, converter: &mut FormatConverter) {
    let generation = shared.producer_gen.load(Ordering::Acquire);
    if cache.generation == Some(generation) {
        return;
    }
    let params = *lock(&shared.params);
    *cache = ProducerCache {
        generation: Some(generation),
        conversion: params.conversion,
        input_frame_bytes: params.input_frame_bytes.max(1),
        channels: params.channels,
    };
    converter.reset();
}

impl AudioProducer {
    /// One non-blocking attempt to queue `data`; returns input bytes accepted.
    ///
    /// Zero means "not now" (ring full, not open, or reconfiguring). PCM is
    /// accepted in whole frames; DSD chunks are taken whole or not at all.
    pub fn send_audio(&mut self, data: &[u8]) -> usize {
        let shared = &*self.shared;
        let _in_flight = InFlight::enter(&shared.ring_users);
        if shared.reconfiguring.load(Ordering::SeqCst)
            || !shared.open.load(Ordering::Acquire)
            || data.is_empty()
        {
            return 0;
        }
        refresh_producer(shared, &mut self.cache, &mut self.converter);

        let ring = &shared.ring;
        let frame = self.cache.input_frame_bytes;
        match self.cache.conversion {
            Conversion::Direct => {
                let n = data.len().min(ring.free_space()) / frame * frame;
                ring.push(&data[..n])
            }
            Conversion::Pack24 => {
                let whole = data.len() / frame * frame;
                self.converter.push_24bit_packed(ring, &data[..whole])
            }
            Conversion::Upsample16To32 => {
                let whole = data.len() / frame * frame;
                self.converter.push_16_to_32(ring, &data[..whole])
            }
            Conversion::DsdPlanar {
                bit_reverse,
                byte_swap,
            } => self.converter.push_dsd_planar(
                ring,
                data,
                self.cache.channels,
                bit_reverse,
                byte_swap,
            ),
        }
    }

    /// Forward the decoder's S24 alignment hint for the current track.
    pub fn set_alignment_hint(&mut self, hint: S24Hint) {
        refresh_producer(&self.shared, &mut self.cache, &mut self.converter);
        self.converter.set_alignment_hint(hint);
    }

    pub fn alignment(&self) -> &AlignmentState {
        self.converter.alignment()
    }
}

impl Drop for AudioProducer {
    fn drop(&mut self) {
        self.shared.producer_taken.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct ConsumerCache {
    generation: Option<u32>,
    ring_frame_bytes: usize,
    base_frames: u64,
    remainder_micro: u64,
    accumulator_micro: u64,
    silence: u8,
    is_dsd: bool,
}

impl ConsumerCache {
    /// Bytes for the next cycle; fractional frames accumulate across cycles.
    fn next_buffer_bytes(&mut self) -> usize {
        self.accumulator_micro += self.remainder_micro;
        let mut frames = self.base_frames;
        if self.accumulator_micro >= 1_000_000 {
            self.accumulator_micro -= 1_000_000;
            frames += 1;
        }
        frames as usize * self.ring_frame_bytes
    }
}

/// Pull side of the adapter, driven by the transport worker.
pub struct AudioConsumer {
    shared: Arc<Shared>,
    cache: ConsumerCache,
    scratch: Vec<u8>,
    silence: Vec<u8>,
}

/// One cycle's worth of bytes for the transport.
pub enum PullBuffer<'a> {
    /// Idle pattern: not playing, prefilling, paused or underrun.
    Silence(&'a [u8]),
    /// Ring data copied out because it wrapped (or copy mode is forced).
    Copied(&'a [u8]),
    /// Ring data borrowed in place; consumed when dropped.
    ZeroCopy(ZeroCopyLease<'a>),
}

impl PullBuffer<'_> {
    pub fn is_silence(&self) -> bool {
        matches!(self, PullBuffer::Silence(_))
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self, PullBuffer::ZeroCopy(_))
    }
}

impl Deref for PullBuffer<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            PullBuffer::Silence(b) | PullBuffer::Copied(b) => b,
            PullBuffer::ZeroCopy(lease) => lease,
        }
    }
}

/// Borrowed ring span handed to the transport.
///
/// While it lives, reconfiguration waits for it. Dropping it advances the
/// read cursor unless a reconfiguration has started in the meantime.
pub struct ZeroCopyLease<'a> {
    region: Option<ReadRegion<'a>>,
    len: usize,
    shared: &'a Shared,
    epoch: u32,
}

impl Deref for ZeroCopyLease<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match &self.region {
            Some(region) => &region[..self.len],
            None => &[],
        }
    }
}

impl Drop for ZeroCopyLease<'_> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            if self.shared.lease_epoch.load(Ordering::SeqCst) == self.epoch {
                region.advance(self.len);
            }
        }
        self.shared.lease_in_use.store(false, Ordering::SeqCst);
    }
}

impl AudioConsumer {
    fn refresh(&mut self) {
        let shared = &*self.shared;
        let generation = shared.consumer_gen.load(Ordering::Acquire);
        if self.cache.generation == Some(generation) {
            return;
        }
        let params = *lock(&shared.params);
        let micro_frames = params.frames_per_second * params.cycle_us as u64;
        self.cache = ConsumerCache {
            generation: Some(generation),
            ring_frame_bytes: params.ring_frame_bytes,
            base_frames: micro_frames / 1_000_000,
            remainder_micro: micro_frames % 1_000_000,
            accumulator_micro: 0,
            silence: params.silence,
            is_dsd: params.format.is_dsd,
        };
        // Grows only when a format needs larger cycles than any before it.
        let max_bytes = (self.cache.base_frames as usize + 1) * params.ring_frame_bytes;
        self.scratch.resize(max_bytes, 0);
        self.silence.clear();
        self.silence.resize(max_bytes, params.silence);
        tracing::debug!(
            bytes_per_cycle = self.cache.base_frames as usize * params.ring_frame_bytes,
            dsd = self.cache.is_dsd,
            "consumer parameters refreshed"
        );
    }

    /// Produce the next cycle's buffer. Never blocks.
    pub fn pull(&mut self) -> PullBuffer<'_> {
        self.refresh();
        let bytes = self.cache.next_buffer_bytes();
        let shared = &*self.shared;
        let _active = ActiveFlag::raise(&shared.worker_active);
        // Read before the reconfiguring check so a lease never carries the
        // epoch of a reconfiguration that started after it.
        let epoch = shared.lease_epoch.load(Ordering::SeqCst);

        if shared.reconfiguring.load(Ordering::SeqCst)
            || !shared.open.load(Ordering::Acquire)
            || !shared.playing.load(Ordering::Acquire)
            || shared.paused.load(Ordering::Acquire)
            || take_one(&shared.startup_silence)
        {
            return PullBuffer::Silence(&self.silence[..bytes]);
        }

        let ring = &shared.ring;
        let available = ring.available();
        if shared.stop_requested.load(Ordering::Acquire) {
            if available < bytes {
                if available > 0 {
                    let n = ring.pop(&mut self.scratch[..available]);
                    self.scratch[n..bytes].fill(self.cache.silence);
                    return PullBuffer::Copied(&self.scratch[..bytes]);
                }
                if !take_one(&shared.stop_silence) {
                    shared.stop_requested.store(false, Ordering::Release);
                    shared.playing.store(false, Ordering::Release);
                    tracing::debug!("stop drain complete");
                }
                return PullBuffer::Silence(&self.silence[..bytes]);
            }
        } else if !shared.prefill_complete.load(Ordering::Acquire) {
            if available < shared.prefill_target.load(Ordering::Acquire) {
                return PullBuffer::Silence(&self.silence[..bytes]);
            }
            shared.prefill_complete.store(true, Ordering::Release);
            tracing::debug!(buffered = available, "prefill complete");
        }

        if available < bytes {
            shared.underruns.fetch_add(1, Ordering::Relaxed);
            return PullBuffer::Silence(&self.silence[..bytes]);
        }

        if !shared.zero_copy_blocked.load(Ordering::Acquire) {
            if let Some(region) = ring.direct_read_region(bytes) {
                shared.lease_in_use.store(true, Ordering::SeqCst);
                return PullBuffer::ZeroCopy(ZeroCopyLease {
                    region: Some(region),
                    len: bytes,
                    shared,
                    epoch,
                });
            }
        }
        let n = ring.pop(&mut self.scratch[..bytes]);
        PullBuffer::Copied(&self.scratch[..n])
    }
}

impl Drop for AudioConsumer {
    fn drop(&mut self) {
        self.shared.consumer_taken.store(false, Ordering::Release);
    }
}
