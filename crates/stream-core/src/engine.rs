//! Gapless dual-decoder playback engine.
//!
//! The cadence thread calls [`PlaybackEngine::process`] once per period. It
//! reads the next chunk from the current decoder and hands it to the
//! [`AudioSink`]. At end of stream it swaps in the decoder that the preload
//! thread opened for the next URI, so samples continue without a gap.
//! Control entry points (URIs, play/pause/stop, seek) may be called from any
//! thread; seeks are only recorded there and executed by `process`.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use stream_types::PlaybackState;

use crate::error::{OpenError, OpenResult};
use crate::format::TrackInfo;
use crate::lock;

/// Reusable sample buffer; logical length is tracked apart from capacity so
/// repeated reads of the same size never reallocate.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    data: Vec<u8>,
    len: usize,
}

impl AudioBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    /// Grow the backing storage without changing the logical length.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.data.len() < capacity {
            self.data.resize(capacity, 0);
        }
    }

    pub fn resize(&mut self, len: usize) {
        self.ensure_capacity(len);
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

/// A source of raw interleaved samples for one track.
pub trait Decoder: Send {
    fn open(&mut self, uri: &str) -> OpenResult<()>;

    fn close(&mut self);

    fn track_info(&self) -> &TrackInfo;

    /// Decode up to `samples` frames into `buf` (resizing it to the bytes
    /// written). Returns frames read, 0 at end of stream.
    ///
    /// PCM is little-endian, 24-bit in 32-bit containers. DSD is planar:
    /// one block of `samples / 8` bytes per channel.
    fn read_samples(
        &mut self,
        buf: &mut AudioBuffer,
        samples: usize,
        target_rate: u32,
        target_bits: u32,
    ) -> usize;

    fn is_eof(&self) -> bool;

    fn seek(&mut self, seconds: f64) -> bool;
}

/// Creates fresh, unopened decoders.
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Box<dyn Decoder>;
}

impl<F> DecoderFactory for F
where
    F: Fn() -> Box<dyn Decoder> + Send + Sync,
{
    fn create(&self) -> Box<dyn Decoder> {
        self()
    }
}

/// One chunk offered to the sink.
#[derive(Clone, Copy, Debug)]
pub struct AudioPayload<'a> {
    pub data: &'a [u8],
    pub bytes: usize,
    pub samples: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Everything was accepted (or deliberately dropped).
    Sent,
    /// Only `bytes_consumed` were accepted; the rest is offered again next cycle.
    Backpressure,
    /// Halt playback.
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    pub bytes_consumed: usize,
}

impl DeliveryResult {
    pub fn sent(bytes: usize) -> Self {
        Self {
            status: DeliveryStatus::Sent,
            bytes_consumed: bytes,
        }
    }

    pub fn backpressure(bytes_consumed: usize) -> Self {
        Self {
            status: DeliveryStatus::Backpressure,
            bytes_consumed,
        }
    }

    pub fn stop() -> Self {
        Self {
            status: DeliveryStatus::Stop,
            bytes_consumed: 0,
        }
    }
}

/// Downstream of the engine; called on the cadence thread only.
pub trait AudioSink: Send {
    fn deliver(&mut self, payload: &AudioPayload<'_>, track: &TrackInfo) -> DeliveryResult;
}

impl<F> AudioSink for F
where
    F: FnMut(&AudioPayload<'_>, &TrackInfo) -> DeliveryResult + Send,
{
    fn deliver(&mut self, payload: &AudioPayload<'_>, track: &TrackInfo) -> DeliveryResult {
        self(payload, track)
    }
}

/// Notifications for the owner of the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// A preloaded track took over at the end of the previous one.
    TrackChanged {
        track_number: u32,
        info: TrackInfo,
        uri: String,
        metadata: String,
    },
    /// The current track ended with nothing queued after it.
    TrackEnded,
    /// The sink refused delivery and playback was stopped.
    Halted,
}

/// Parse a seek target: `H:MM:SS`, `M:SS` or plain seconds, the seconds
/// field optionally fractional.
pub fn parse_time_string(input: &str) -> Option<f64> {
    let mut fields = input.trim().rsplit(':');
    let seconds: f64 = fields.next()?.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let mut total = seconds;
    for unit in [60.0, 3600.0] {
        match fields.next() {
            Some(field) => total += field.trim().parse::<u32>().ok()? as f64 * unit,
            None => return Some(total),
        }
    }
    if fields.next().is_some() {
        return None;
    }
    Some(total)
}

/// Frames carried by `bytes` of decoder output.
fn samples_in(info: &TrackInfo, bytes: usize) -> usize {
    if info.is_dsd {
        bytes * 8 / info.channels.max(1) as usize
    } else {
        bytes / info.format().input_frame_bytes()
    }
}

/// State touched by `process`; the lock is held for one cycle at most.
struct PlaybackCore {
    current: Option<Box<dyn Decoder>>,
    info: Option<TrackInfo>,
    buffer: AudioBuffer,
    sink: Box<dyn AudioSink>,
    /// Unaccepted tail of the last chunk: `buffer[offset..offset + len]`.
    pending_offset: usize,
    pending_len: usize,
    ended: bool,
}

impl PlaybackCore {
    fn clear_pending(&mut self) {
        self.pending_offset = 0;
        self.pending_len = 0;
    }
}

/// What readers (position thread, status) see of the current track.
#[derive(Default)]
struct TrackMeta {
    uri: Option<String>,
    metadata: String,
    info: Option<TrackInfo>,
}

/// Queued next track, shared with the preload thread.
#[derive(Default)]
struct NextSlot {
    uri: Option<String>,
    metadata: String,
    decoder: Option<Box<dyn Decoder>>,
    /// A preload for `uri` is queued or running; cleared only by the preload
    /// that still matches `uri`, so a stale one cannot clear a newer one.
    preloading: bool,
}

pub struct PlaybackEngine {
    factory: Arc<dyn DecoderFactory>,
    events: Sender<EngineEvent>,

    state: AtomicU8,
    track_number: AtomicU32,
    samples_played: AtomicU64,
    current_rate: AtomicU32,
    current_dsd: AtomicBool,

    seek_requested: AtomicBool,
    seek_target: AtomicU64,

    core: Mutex<PlaybackCore>,
    meta: Mutex<TrackMeta>,
    next: Arc<Mutex<NextSlot>>,

    preload: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    pub fn new(
        factory: Arc<dyn DecoderFactory>,
        sink: Box<dyn AudioSink>,
        events: Sender<EngineEvent>,
    ) -> Self {
        Self {
            factory,
            events,
            state: AtomicU8::new(PlaybackState::Stopped.as_u8()),
            track_number: AtomicU32::new(0),
            samples_played: AtomicU64::new(0),
            current_rate: AtomicU32::new(0),
            current_dsd: AtomicBool::new(false),
            seek_requested: AtomicBool::new(false),
            seek_target: AtomicU64::new(0),
            core: Mutex::new(PlaybackCore {
                current: None,
                info: None,
                buffer: AudioBuffer::default(),
                sink,
                pending_offset: 0,
                pending_len: 0,
                ended: false,
            }),
            meta: Mutex::new(TrackMeta::default()),
            next: Arc::new(Mutex::new(NextSlot::default())),
            preload: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// 1-based number of the track in the current gapless run; 0 before any.
    pub fn track_number(&self) -> u32 {
        self.track_number.load(Ordering::Acquire)
    }

    pub fn position_secs(&self) -> f64 {
        let rate = self.current_rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0.0;
        }
        self.samples_played.load(Ordering::Acquire) as f64 / rate as f64
    }

    pub fn duration_secs(&self) -> Option<f64> {
        lock(&self.meta).info.as_ref().and_then(TrackInfo::duration_secs)
    }

    pub fn current_track(&self) -> Option<TrackInfo> {
        lock(&self.meta).info.clone()
    }

    pub fn current_uri(&self) -> Option<String> {
        lock(&self.meta).uri.clone()
    }

    pub fn current_metadata(&self) -> String {
        lock(&self.meta).metadata.clone()
    }

    /// Sample rate and DSD flag of the active track, without locking.
    pub fn current_rate(&self) -> Option<(u32, bool)> {
        let rate = self.current_rate.load(Ordering::Acquire);
        (rate > 0).then(|| (rate, self.current_dsd.load(Ordering::Acquire)))
    }

    /// `true` once the next track has been opened and can be swapped in.
    pub fn has_next_ready(&self) -> bool {
        lock(&self.next).decoder.is_some()
    }

    fn open_decoder(&self, uri: &str) -> OpenResult<Box<dyn Decoder>> {
        let mut decoder = self.factory.create();
        decoder.open(uri)?;
        Ok(decoder)
    }

    fn publish_track(&self, uri: &str, metadata: &str, info: &TrackInfo) {
        self.current_rate.store(info.sample_rate, Ordering::Release);
        self.current_dsd.store(info.is_dsd, Ordering::Release);
        let mut meta = lock(&self.meta);
        meta.uri = Some(uri.to_string());
        meta.metadata = metadata.to_string();
        meta.info = Some(info.clone());
    }

    /// Make `uri` the current track.
    ///
    /// The same URI is only reopened when `force_reopen` is set. On failure
    /// the previous track, state and queue are left as they were.
    pub fn set_current_uri(&self, uri: &str, metadata: &str, force_reopen: bool) -> OpenResult<()> {
        let have_open = lock(&self.core).current.is_some();
        if !force_reopen && have_open && self.current_uri().as_deref() == Some(uri) {
            lock(&self.meta).metadata = metadata.to_string();
            return Ok(());
        }

        // I/O happens before any lock the cadence thread needs.
        let decoder = self.open_decoder(uri).inspect_err(|err| {
            tracing::warn!(uri, error = %err, "failed to open track");
        })?;
        let info = decoder.track_info().clone();

        let uri_changed = self.current_uri().as_deref() != Some(uri);
        {
            let mut core = lock(&self.core);
            if let Some(mut old) = core.current.replace(decoder) {
                old.close();
            }
            core.info = Some(info.clone());
            core.clear_pending();
            core.ended = false;
            self.seek_requested.store(false, Ordering::Release);
            self.samples_played.store(0, Ordering::Release);
            self.track_number.store(1, Ordering::Release);
            self.publish_track(uri, metadata, &info);
        }
        tracing::info!(
            uri,
            codec = %info.codec,
            rate_hz = info.sample_rate,
            bits = info.bit_depth,
            channels = info.channels,
            dsd = info.is_dsd,
            "current track set"
        );

        if uri_changed {
            let mut next = lock(&self.next);
            if let Some(mut stale) = next.decoder.take() {
                stale.close();
            }
            next.uri = None;
            next.preloading = false;
        } else {
            let needs_preload = {
                let next = lock(&self.next);
                next.uri.is_some() && next.decoder.is_none()
            };
            if needs_preload {
                self.start_preload();
            }
        }
        Ok(())
    }

    /// Queue `uri` to follow the current track without a gap.
    pub fn set_next_uri(&self, uri: &str, metadata: &str) {
        let has_current = lock(&self.core).current.is_some();
        {
            let mut next = lock(&self.next);
            next.uri = Some(uri.to_string());
            next.metadata = metadata.to_string();
            // Marked before the lock drops so an end of track in between waits.
            next.preloading = has_current;
            if let Some(mut stale) = next.decoder.take() {
                stale.close();
            }
        }
        tracing::debug!(uri, "next track queued");
        if has_current {
            self.start_preload();
        }
    }

    fn start_preload(&self) {
        let mut handle = lock(&self.preload);
        if let Some(previous) = handle.take() {
            let _ = previous.join();
        }
        let uri = {
            let mut next = lock(&self.next);
            next.preloading = next.uri.is_some();
            match next.uri.clone() {
                Some(uri) => uri,
                None => return,
            }
        };

        let factory = self.factory.clone();
        let slot = self.next.clone();
        let spawned = std::thread::Builder::new()
            .name("preload".into())
            .spawn(move || {
                let mut decoder = factory.create();
                let opened = decoder.open(&uri);
                let mut next = lock(&slot);
                let current = next.uri.as_deref() == Some(uri.as_str());
                match opened {
                    Ok(()) if current => {
                        tracing::debug!(uri, "next track preloaded");
                        next.decoder = Some(decoder);
                    }
                    Ok(()) => decoder.close(),
                    Err(err) => tracing::warn!(uri, error = %err, "preload failed"),
                }
                if current {
                    next.preloading = false;
                }
            });
        match spawned {
            Ok(join) => *handle = Some(join),
            Err(err) => {
                lock(&self.next).preloading = false;
                tracing::warn!(error = %err, "failed to spawn preload thread");
            }
        }
    }

    /// Start or resume. Reopens the current URI if its decoder was dropped.
    pub fn play(&self) -> OpenResult<()> {
        match self.state() {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Paused => {
                self.set_state(PlaybackState::Playing);
                return Ok(());
            }
            PlaybackState::Stopped => {}
        }
        let needs_open = {
            let core = lock(&self.core);
            core.current.is_none() || core.ended
        };
        if needs_open {
            let uri = self.current_uri().ok_or(OpenError::NoTrack)?;
            let metadata = self.current_metadata();
            self.set_current_uri(&uri, &metadata, true)?;
        }
        self.set_state(PlaybackState::Playing);
        Ok(())
    }

    pub fn pause(&self) {
        if self.state() == PlaybackState::Playing {
            self.set_state(PlaybackState::Paused);
        }
    }

    /// Stop and drop both decoders. Waits for an in-flight cycle to finish.
    pub fn stop(&self) {
        self.set_state(PlaybackState::Stopped);
        {
            let mut core = lock(&self.core);
            if let Some(mut decoder) = core.current.take() {
                decoder.close();
            }
            core.clear_pending();
            core.ended = false;
        }
        if let Some(mut next) = lock(&self.next).decoder.take() {
            next.close();
        }
        self.seek_requested.store(false, Ordering::Release);
        self.samples_played.store(0, Ordering::Release);
    }

    /// Request a seek; performed by the next `process` call.
    pub fn seek(&self, seconds: f64) -> bool {
        if !seconds.is_finite() || seconds < 0.0 || self.current_rate().is_none() {
            return false;
        }
        self.seek_target.store(seconds.to_bits(), Ordering::Release);
        self.seek_requested.store(true, Ordering::Release);
        true
    }

    pub fn seek_to(&self, time: &str) -> bool {
        match parse_time_string(time) {
            Some(seconds) => self.seek(seconds),
            None => {
                tracing::warn!(time, "unparseable seek target");
                false
            }
        }
    }

    /// Run one cycle. Returns `true` while the engine is playing.
    pub fn process(&self, samples_needed: usize) -> bool {
        if self.state() != PlaybackState::Playing {
            return false;
        }
        let mut guard = lock(&self.core);
        let core = &mut *guard;

        if self.seek_requested.swap(false, Ordering::AcqRel) {
            self.apply_seek(core);
        }

        if core.pending_len > 0 {
            let (offset, len) = (core.pending_offset, core.pending_len);
            match self.deliver(core, offset, len) {
                Some(true) => {}
                Some(false) => return true,
                None => return false,
            }
        }

        if core.ended {
            return false;
        }

        let Some((rate, bits)) = core.info.as_ref().map(|i| (i.sample_rate, i.bit_depth)) else {
            return false;
        };
        let read = match core.current.as_mut() {
            Some(decoder) => decoder.read_samples(&mut core.buffer, samples_needed, rate, bits),
            None => 0,
        };
        let read = if read == 0 {
            match self.advance_track(core, samples_needed) {
                Advance::Swapped(read) => read,
                Advance::Waiting => return true,
                Advance::Ended => return false,
            }
        } else {
            read
        };
        if read == 0 {
            return true;
        }

        let len = core.buffer.len();
        self.deliver(core, 0, len).is_some()
    }

    fn apply_seek(&self, core: &mut PlaybackCore) {
        let seconds = f64::from_bits(self.seek_target.load(Ordering::Acquire));
        let rate = core.info.as_ref().map_or(0, |info| info.sample_rate);
        let Some(decoder) = core.current.as_mut() else {
            return;
        };
        if decoder.seek(seconds) {
            core.clear_pending();
            self.samples_played
                .store((seconds * rate as f64) as u64, Ordering::Release);
            tracing::info!(seconds, "seek applied");
        } else {
            tracing::warn!(seconds, "decoder rejected seek");
        }
    }

    /// Offer `buffer[offset..offset + len]` to the sink.
    ///
    /// `Some(true)`: fully accepted; `Some(false)`: a remainder is kept;
    /// `None`: the sink asked to stop.
    fn deliver(&self, core: &mut PlaybackCore, offset: usize, len: usize) -> Option<bool> {
        let Some(info) = core.info.as_ref() else {
            return Some(true);
        };
        let payload = AudioPayload {
            data: &core.buffer.as_slice()[offset..offset + len],
            bytes: len,
            samples: samples_in(info, len),
        };
        let result = core.sink.deliver(&payload, info);
        let consumed = match result.status {
            DeliveryStatus::Sent => len,
            DeliveryStatus::Backpressure => result.bytes_consumed.min(len),
            DeliveryStatus::Stop => {
                tracing::info!("sink requested stop");
                core.clear_pending();
                self.set_state(PlaybackState::Stopped);
                let _ = self.events.send(EngineEvent::Halted);
                return None;
            }
        };
        let samples = samples_in(info, consumed);
        self.samples_played
            .fetch_add(samples as u64, Ordering::AcqRel);

        if consumed == len {
            core.clear_pending();
            Some(true)
        } else {
            core.pending_offset = offset + consumed;
            core.pending_len = len - consumed;
            Some(false)
        }
    }

    fn advance_track(&self, core: &mut PlaybackCore, samples_needed: usize) -> Advance {
        let (swapped, pending) = {
            let mut next = lock(&self.next);
            let swapped = next.decoder.take().map(|decoder| {
                let uri = next.uri.take().unwrap_or_default();
                (decoder, uri, std::mem::take(&mut next.metadata))
            });
            (swapped, next.uri.is_some() && next.preloading)
        };

        let Some((decoder, uri, metadata)) = swapped else {
            if pending {
                return Advance::Waiting;
            }
            if !core.ended {
                core.ended = true;
                tracing::info!("track finished");
                let _ = self.events.send(EngineEvent::TrackEnded);
            }
            self.set_state(PlaybackState::Stopped);
            return Advance::Ended;
        };

        let info = decoder.track_info().clone();
        if let Some(mut old) = core.current.replace(decoder) {
            old.close();
        }
        core.info = Some(info.clone());
        self.samples_played.store(0, Ordering::Release);
        let track_number = self.track_number.fetch_add(1, Ordering::AcqRel) + 1;
        self.publish_track(&uri, &metadata, &info);
        tracing::info!(track_number, uri, "gapless transition");
        let _ = self.events.send(EngineEvent::TrackChanged {
            track_number,
            info: info.clone(),
            uri,
            metadata,
        });

        let read = match core.current.as_mut() {
            Some(decoder) => decoder.read_samples(
                &mut core.buffer,
                samples_needed,
                info.sample_rate,
                info.bit_depth,
            ),
            None => 0,
        };
        Advance::Swapped(read)
    }
}

enum Advance {
    Swapped(usize),
    Waiting,
    Ended,
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.preload).take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender};
    use std::time::{Duration, Instant};

    const RATE: u32 = 8000;

    /// 16-bit mono track whose samples count up from `start`.
    /// URIs look like `count:<start>:<len>`.
    struct CounterDecoder {
        info: TrackInfo,
        start: u64,
        len: u64,
        pos: u64,
    }

    impl CounterDecoder {
        fn boxed() -> Box<dyn Decoder> {
            Box::new(Self {
                info: TrackInfo::default(),
                start: 0,
                len: 0,
                pos: 0,
            })
        }
    }

    impl Decoder for CounterDecoder {
        fn open(&mut self, uri: &str) -> OpenResult<()> {
            let failed = || OpenError::Decoder {
                uri: uri.to_string(),
                reason: "bad uri".into(),
            };
            let mut parts = uri.strip_prefix("count:").ok_or_else(failed)?.split(':');
            self.start = parts.next().and_then(|s| s.parse().ok()).ok_or_else(failed)?;
            self.len = parts.next().and_then(|s| s.parse().ok()).ok_or_else(failed)?;
            self.pos = 0;
            self.info = TrackInfo {
                uri: uri.to_string(),
                sample_rate: RATE,
                bit_depth: 16,
                channels: 1,
                codec: "counter".into(),
                duration_samples: self.len,
                ..TrackInfo::default()
            };
            Ok(())
        }

        fn close(&mut self) {}

        fn track_info(&self) -> &TrackInfo {
            &self.info
        }

        fn read_samples(&mut self, buf: &mut AudioBuffer, samples: usize, _: u32, _: u32) -> usize {
            let n = (self.len - self.pos).min(samples as u64) as usize;
            buf.resize(n * 2);
            for (i, out) in buf.as_mut_slice().chunks_exact_mut(2).enumerate() {
                let value = (self.start + self.pos + i as u64) as u16;
                out.copy_from_slice(&value.to_le_bytes());
            }
            self.pos += n as u64;
            n
        }

        fn is_eof(&self) -> bool {
            self.pos >= self.len
        }

        fn seek(&mut self, seconds: f64) -> bool {
            let target = (seconds * RATE as f64) as u64;
            if target > self.len {
                return false;
            }
            self.pos = target;
            true
        }
    }

    /// `gated:<uri>` blocks in `open` until the test sends on the gate.
    struct GatedDecoder {
        gate: Receiver<()>,
        inner: CounterDecoder,
    }

    impl Decoder for GatedDecoder {
        fn open(&mut self, uri: &str) -> OpenResult<()> {
            match uri.strip_prefix("gated:") {
                Some(rest) => {
                    let _ = self.gate.recv();
                    self.inner.open(rest)
                }
                None => self.inner.open(uri),
            }
        }

        fn close(&mut self) {}

        fn track_info(&self) -> &TrackInfo {
            self.inner.track_info()
        }

        fn read_samples(
            &mut self,
            buf: &mut AudioBuffer,
            samples: usize,
            rate: u32,
            bits: u32,
        ) -> usize {
            self.inner.read_samples(buf, samples, rate, bits)
        }

        fn is_eof(&self) -> bool {
            self.inner.is_eof()
        }

        fn seek(&mut self, seconds: f64) -> bool {
            self.inner.seek(seconds)
        }
    }

    fn gated_engine(
        sink: Box<dyn AudioSink>,
    ) -> (Arc<PlaybackEngine>, Receiver<EngineEvent>, Sender<()>) {
        let (release, gate) = crossbeam_channel::unbounded();
        let (tx, rx) = crossbeam_channel::unbounded();
        let factory: Arc<dyn DecoderFactory> = Arc::new(move || {
            Box::new(GatedDecoder {
                gate: gate.clone(),
                inner: CounterDecoder {
                    info: TrackInfo::default(),
                    start: 0,
                    len: 0,
                    pos: 0,
                },
            }) as Box<dyn Decoder>
        });
        (Arc::new(PlaybackEngine::new(factory, sink, tx)), rx, release)
    }

    type Collected = Arc<Mutex<Vec<u16>>>;

    /// Sink that accepts at most `limit` bytes per call.
    fn collecting_sink(limit: usize) -> (Box<dyn AudioSink>, Collected) {
        let out: Collected = Arc::default();
        let sink_out = out.clone();
        let sink = move |payload: &AudioPayload<'_>, _: &TrackInfo| {
            let take = payload.bytes.min(limit) / 2 * 2;
            let mut out = sink_out.lock().unwrap();
            for pair in payload.data[..take].chunks_exact(2) {
                out.push(u16::from_le_bytes([pair[0], pair[1]]));
            }
            if take == payload.bytes {
                DeliveryResult::sent(take)
            } else {
                DeliveryResult::backpressure(take)
            }
        };
        let sink: Box<dyn AudioSink> = Box::new(sink);
        (sink, out)
    }

    fn engine_with(sink: Box<dyn AudioSink>) -> (PlaybackEngine, Receiver<EngineEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let factory: Arc<dyn DecoderFactory> = Arc::new(CounterDecoder::boxed);
        (PlaybackEngine::new(factory, sink, tx), rx)
    }

    fn wait_for_next(engine: &PlaybackEngine) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !engine.has_next_ready() {
            assert!(Instant::now() < deadline, "preload did not finish");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn run_to_end(engine: &PlaybackEngine, chunk: usize) {
        for _ in 0..10_000 {
            if !engine.process(chunk) {
                return;
            }
        }
        panic!("engine never stopped");
    }

    #[test]
    fn parses_time_strings() {
        assert_eq!(parse_time_string("1:02:03"), Some(3723.0));
        assert_eq!(parse_time_string("02:03"), Some(123.0));
        assert_eq!(parse_time_string("45"), Some(45.0));
        assert_eq!(parse_time_string("0:00:01.5"), Some(1.5));
        assert_eq!(parse_time_string(" 7.25 "), Some(7.25));
        assert_eq!(parse_time_string("abc"), None);
        assert_eq!(parse_time_string("1:2:3:4"), None);
        assert_eq!(parse_time_string("-3"), None);
        assert_eq!(parse_time_string(""), None);
    }

    #[test]
    fn samples_in_counts_frames_per_encoding() {
        let track = |bit_depth, channels, is_dsd| TrackInfo {
            bit_depth,
            channels,
            is_dsd,
            ..TrackInfo::default()
        };
        assert_eq!(samples_in(&track(16, 1, false), 200), 100);
        assert_eq!(samples_in(&track(24, 2, false), 800), 100);
        assert_eq!(samples_in(&track(1, 2, true), 100), 400);
    }

    #[test]
    fn audio_buffer_keeps_capacity_when_shrinking() {
        let mut buf = AudioBuffer::with_capacity(16);
        buf.resize(8);
        assert_eq!((buf.len(), buf.capacity()), (8, 16));
        buf.resize(32);
        buf.resize(4);
        assert_eq!((buf.len(), buf.capacity()), (4, 32));
    }

    #[test]
    fn gapless_transition_is_sample_continuous() {
        let (sink, out) = collecting_sink(usize::MAX);
        let (engine, events) = engine_with(sink);
        engine.set_current_uri("count:0:5000", "first", false).unwrap();
        engine.set_next_uri("count:5000:3000", "second");
        wait_for_next(&engine);
        engine.play().unwrap();

        run_to_end(&engine, 1024);

        let samples = out.lock().unwrap();
        let expected: Vec<u16> = (0..8000).collect();
        assert_eq!(*samples, expected);

        let events: Vec<_> = events.try_iter().collect();
        assert_eq!(events.len(), 2);
        match &events[0] {
            EngineEvent::TrackChanged {
                track_number,
                uri,
                metadata,
                ..
            } => {
                assert_eq!(*track_number, 2);
                assert_eq!(uri, "count:5000:3000");
                assert_eq!(metadata, "second");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(events[1], EngineEvent::TrackEnded);
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.current_uri().as_deref(), Some("count:5000:3000"));
    }

    #[test]
    fn backpressure_remainder_is_redelivered() {
        let (sink, out) = collecting_sink(300);
        let (engine, _events) = engine_with(sink);
        engine.set_current_uri("count:100:2000", "", false).unwrap();
        engine.play().unwrap();

        run_to_end(&engine, 512);

        let expected: Vec<u16> = (100..2100).collect();
        assert_eq!(*out.lock().unwrap(), expected);
    }

    #[test]
    fn track_end_is_reported_once() {
        let (sink, _out) = collecting_sink(usize::MAX);
        let (engine, events) = engine_with(sink);
        engine.set_current_uri("count:0:100", "", false).unwrap();
        engine.play().unwrap();
        run_to_end(&engine, 64);

        engine.set_state(PlaybackState::Playing);
        assert!(!engine.process(64));
        let ends = events
            .try_iter()
            .filter(|e| *e == EngineEvent::TrackEnded)
            .count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn failed_open_keeps_current_track() {
        let (sink, _out) = collecting_sink(usize::MAX);
        let (engine, _events) = engine_with(sink);
        engine.set_current_uri("count:0:100", "meta", false).unwrap();

        let err = engine.set_current_uri("nope", "", false).unwrap_err();
        assert!(matches!(err, OpenError::Decoder { .. }));
        assert_eq!(engine.current_uri().as_deref(), Some("count:0:100"));
        assert_eq!(engine.current_metadata(), "meta");
        assert!(engine.play().is_ok());
    }

    #[test]
    fn play_without_track_fails() {
        let (sink, _out) = collecting_sink(usize::MAX);
        let (engine, _events) = engine_with(sink);
        assert_eq!(engine.play(), Err(OpenError::NoTrack));
        assert_eq!(engine.state(), PlaybackState::Stopped);
    }

    #[test]
    fn seek_is_applied_by_process() {
        let (sink, out) = collecting_sink(usize::MAX);
        let (engine, _events) = engine_with(sink);
        engine.set_current_uri("count:0:16000", "", false).unwrap();
        engine.play().unwrap();
        assert!(engine.process(10));

        assert!(engine.seek_to("0:01"));
        assert_eq!(out.lock().unwrap().len(), 10);
        assert!(engine.process(10));

        let samples = out.lock().unwrap();
        assert_eq!(samples[10], RATE as u16);
        assert!((engine.position_secs() - (RATE as f64 + 10.0) / RATE as f64).abs() < 1e-9);
    }

    #[test]
    fn paused_engine_produces_nothing() {
        let (sink, out) = collecting_sink(usize::MAX);
        let (engine, _events) = engine_with(sink);
        engine.set_current_uri("count:0:1000", "", false).unwrap();
        engine.play().unwrap();
        engine.pause();
        assert!(!engine.process(100));
        assert!(out.lock().unwrap().is_empty());
        engine.play().unwrap();
        assert!(engine.process(100));
        assert_eq!(out.lock().unwrap().len(), 100);
    }

    #[test]
    fn sink_stop_halts_playback() {
        let sink = |_: &AudioPayload<'_>, _: &TrackInfo| DeliveryResult::stop();
        let (engine, events) = engine_with(Box::new(sink));
        engine.set_current_uri("count:0:1000", "", false).unwrap();
        engine.play().unwrap();
        assert!(!engine.process(100));
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(events.try_recv(), Ok(EngineEvent::Halted));
    }

    #[test]
    fn latest_next_uri_wins() {
        let (sink, out) = collecting_sink(usize::MAX);
        let (engine, events) = engine_with(sink);
        engine.set_current_uri("count:0:50", "", false).unwrap();
        engine.set_next_uri("count:1000:50", "a");
        engine.set_next_uri("count:2000:50", "b");
        wait_for_next(&engine);
        engine.play().unwrap();
        run_to_end(&engine, 32);

        let samples = out.lock().unwrap();
        assert_eq!(samples[50], 2000);
        let changes = events
            .try_iter()
            .filter(|e| matches!(e, EngineEvent::TrackChanged { .. }))
            .count();
        assert_eq!(changes, 1);
    }

    #[test]
    fn end_of_track_waits_for_running_preload() {
        let (sink, out) = collecting_sink(usize::MAX);
        let (engine, events, release) = gated_engine(sink);
        engine.set_current_uri("count:0:50", "", false).unwrap();
        engine.play().unwrap();
        engine.set_next_uri("gated:count:1000:50", "");

        for _ in 0..5 {
            assert!(engine.process(32));
        }
        assert_eq!(events.try_recv(), Err(crossbeam_channel::TryRecvError::Empty));

        release.send(()).unwrap();
        wait_for_next(&engine);
        run_to_end(&engine, 32);
        assert_eq!(out.lock().unwrap()[50], 1000);
    }

    #[test]
    fn superseded_preload_does_not_end_the_run() {
        let (sink, out) = collecting_sink(usize::MAX);
        let (engine, events, release) = gated_engine(sink);
        engine.set_current_uri("count:0:50", "", false).unwrap();
        engine.play().unwrap();
        engine.set_next_uri("gated:count:1000:50", "stale");

        // Blocks joining the gated preload until it is released.
        let replacing = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.set_next_uri("count:2000:50", "fresh"))
        };
        std::thread::sleep(Duration::from_millis(50));

        for _ in 0..5 {
            assert!(engine.process(32));
        }
        release.send(()).unwrap();
        replacing.join().unwrap();
        wait_for_next(&engine);
        run_to_end(&engine, 32);

        assert_eq!(out.lock().unwrap()[50], 2000);
        let events: Vec<_> = events.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            EngineEvent::TrackChanged { metadata, .. } if metadata == "fresh"
        ));
        assert_eq!(events[1], EngineEvent::TrackEnded);
    }

    #[test]
    fn stop_then_play_reopens_from_start() {
        let (sink, out) = collecting_sink(usize::MAX);
        let (engine, _events) = engine_with(sink);
        engine.set_current_uri("count:0:1000", "", false).unwrap();
        engine.play().unwrap();
        engine.process(100);
        engine.stop();
        assert_eq!(engine.position_secs(), 0.0);

        engine.play().unwrap();
        engine.process(10);
        let samples = out.lock().unwrap();
        assert_eq!(samples[100], 0);
    }
}
