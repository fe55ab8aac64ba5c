//! Control-protocol facade: owns the engine, the adapter and their threads.
//!
//! Inbound commands (`on_*`) are serialised by one lock. Outbound
//! notifications go through [`ControlEvents`]. Engine events are handled on
//! their own thread so the cadence thread never calls back into control code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use stream_core::config::{CALLBACK_SHUTDOWN_TIMEOUT, DAC_STABILIZATION_MS, SyncConfig};
use stream_core::engine::{DecoderFactory, EngineEvent, PlaybackEngine};
use stream_core::gate::CallbackGate;
use stream_core::{PlaybackState, SyncAdapter};
use stream_types::{PlaybackEndReason, RendererStatus};

use crate::config::RendererConfig;
use crate::decode::SymphoniaDecoder;
use crate::position::spawn_position_reporter;
use crate::sink::AdapterSink;
use crate::transport::{FileTransport, TransportStats};

const EVENT_POLL: Duration = Duration::from_millis(50);

/// Outbound notifications to the control point.
pub trait ControlEvents: Send + Sync {
    fn notify_state_change(&self, state: PlaybackState);
    fn notify_track_change(&self, uri: &str, metadata: &str);
    /// Whole seconds; `duration` is 0 when unknown.
    fn notify_position_change(&self, position: u64, duration: u64);
}

#[derive(Debug, Default)]
struct Session {
    uri: Option<String>,
    metadata: String,
    last_stop: Option<Instant>,
    end_reason: Option<PlaybackEndReason>,
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Renderer {
    config: RendererConfig,
    engine: Arc<PlaybackEngine>,
    adapter: Arc<SyncAdapter>,
    transport: Arc<FileTransport>,
    gate: Arc<CallbackGate>,
    events: Arc<dyn ControlEvents>,
    session: Arc<Mutex<Session>>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Renderer {
    /// Start with the Symphonia decoder and default adapter tuning.
    pub fn start(config: RendererConfig, events: Arc<dyn ControlEvents>) -> Result<Self> {
        let factory: Arc<dyn DecoderFactory> = Arc::new(SymphoniaDecoder::boxed);
        let sync = SyncConfig {
            mtu: Some(config.mtu),
            ..SyncConfig::default()
        };
        Self::start_with(config, sync, factory, events)
    }

    pub fn start_with(
        config: RendererConfig,
        sync: SyncConfig,
        factory: Arc<dyn DecoderFactory>,
        events: Arc<dyn ControlEvents>,
    ) -> Result<Self> {
        let transport = Arc::new(FileTransport::new(config.sink, config.mtu));
        let adapter = Arc::new(SyncAdapter::new(transport.clone(), sync));
        let producer = adapter
            .take_producer()
            .context("adapter producer already taken")?;
        let consumer = adapter
            .take_consumer()
            .context("adapter consumer already taken")?;
        let gate = Arc::new(CallbackGate::new());
        let sink = AdapterSink::new(adapter.clone(), producer, gate.clone());

        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let engine = Arc::new(PlaybackEngine::new(factory, Box::new(sink), event_tx));
        let session = Arc::new(Mutex::new(Session::default()));
        let running = Arc::new(AtomicBool::new(true));

        let mut threads = Vec::new();
        threads.push(transport.spawn_worker(
            consumer,
            config.output.as_deref(),
            running.clone(),
        )?);
        threads.push(
            stream_core::cadence::spawn_cadence_loop(engine.clone(), running.clone())
                .context("spawn cadence thread")?,
        );
        threads.push(spawn_event_loop(
            event_rx,
            adapter.clone(),
            events.clone(),
            session.clone(),
            running.clone(),
        )?);
        threads.push(
            spawn_position_reporter(engine.clone(), events.clone(), running.clone())
                .context("spawn position thread")?,
        );

        tracing::info!(
            name = %config.name,
            uuid = %config.uuid,
            sink_bits = config.sink.pcm_bits,
            mtu = config.mtu,
            "renderer started"
        );
        Ok(Self {
            config,
            engine,
            adapter,
            transport,
            gate,
            events,
            session,
            running,
            threads: Mutex::new(threads),
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// `true` while the transport is still playing out buffered audio.
    pub fn is_output_active(&self) -> bool {
        self.adapter.is_playing()
    }

    /// Stop the engine and wait for an in-flight delivery to leave the sink.
    fn halt_delivery(&self) {
        self.engine.stop();
        if !self.gate.wait_for_idle(CALLBACK_SHUTDOWN_TIMEOUT) {
            tracing::warn!("delivery did not finish before stop");
        }
        if self.adapter.is_open() {
            self.adapter.stop_playback(true);
        }
    }

    pub fn on_set_uri(&self, uri: &str, metadata: &str) -> Result<()> {
        let mut session = lock(&self.session);
        if self.engine.state() != PlaybackState::Stopped {
            tracing::info!("auto-stop before uri change");
            self.halt_delivery();
            self.events.notify_state_change(PlaybackState::Stopped);
        }
        session.uri = Some(uri.to_string());
        session.metadata = metadata.to_string();
        session.end_reason = None;
        self.engine
            .set_current_uri(uri, metadata, false)
            .with_context(|| format!("open {uri}"))
    }

    pub fn on_set_next_uri(&self, uri: &str, metadata: &str) {
        let _session = lock(&self.session);
        tracing::debug!(uri, "next uri for gapless");
        self.engine.set_next_uri(uri, metadata);
    }

    pub fn on_play(&self) -> Result<()> {
        let mut session = lock(&self.session);

        if self.adapter.is_open() && self.adapter.is_paused() {
            tracing::debug!("resuming from pause");
            self.adapter.resume_playback();
            self.engine.play().context("resume")?;
            self.events.notify_state_change(PlaybackState::Playing);
            return Ok(());
        }

        if self.engine.state() == PlaybackState::Stopped && self.adapter.is_playing() {
            // A previous tail is still draining; start the new run clean.
            self.adapter.stop_playback(true);
        }

        let stabilize = Duration::from_millis(DAC_STABILIZATION_MS);
        if session.last_stop.is_some_and(|at| at.elapsed() < stabilize) {
            std::thread::sleep(stabilize);
        }

        self.engine.play().context("start playback")?;
        session.end_reason = None;
        self.events.notify_state_change(PlaybackState::Playing);
        Ok(())
    }

    pub fn on_pause(&self) {
        let _session = lock(&self.session);
        self.engine.pause();
        if self.adapter.is_playing() {
            self.adapter.pause_playback();
        }
        self.events.notify_state_change(PlaybackState::Paused);
    }

    pub fn on_stop(&self) {
        let mut session = lock(&self.session);
        session.last_stop = Some(Instant::now());
        self.halt_delivery();

        // Keep the track loaded so a following play starts from the top.
        if let Some(uri) = session.uri.clone() {
            if let Err(err) = self.engine.set_current_uri(&uri, &session.metadata, true) {
                tracing::warn!(uri, error = %err, "reopen after stop failed");
            }
        }
        session.end_reason = Some(PlaybackEndReason::Stopped);
        self.events.notify_state_change(PlaybackState::Stopped);
    }

    /// Seek to `H:MM:SS`, `M:SS` or plain seconds.
    pub fn on_seek(&self, target: &str) -> bool {
        let _session = lock(&self.session);
        tracing::info!(target, "seek");
        self.engine.seek_to(target)
    }

    pub fn end_reason(&self) -> Option<PlaybackEndReason> {
        lock(&self.session).end_reason
    }

    pub fn status(&self) -> RendererStatus {
        let track = self.engine.current_track();
        RendererStatus {
            state: self.engine.state(),
            uri: self.engine.current_uri(),
            track_number: self.engine.track_number(),
            position_secs: self.engine.position_secs(),
            duration_secs: self.engine.duration_secs(),
            codec: track.as_ref().map(|t| t.codec.clone()),
            sample_rate: track.as_ref().map(|t| t.sample_rate),
            bit_depth: track.as_ref().map(|t| t.bit_depth),
            channels: track.as_ref().map(|t| t.channels),
            dsd: track.as_ref().is_some_and(|t| t.is_dsd),
            buffer_level: if self.adapter.is_open() {
                self.adapter.buffer_level()
            } else {
                0.0
            },
            underruns: self.adapter.underrun_count(),
            end_reason: self.end_reason(),
        }
    }

    /// Stop all threads and close the transport. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("renderer stopping");
        self.engine.stop();
        self.gate.wait_for_idle(CALLBACK_SHUTDOWN_TIMEOUT);

        let threads = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in threads {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "thread panicked");
            }
        }
        self.adapter.close();
        tracing::info!("renderer stopped");
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_event_loop(
    rx: Receiver<EngineEvent>,
    adapter: Arc<SyncAdapter>,
    events: Arc<dyn ControlEvents>,
    session: Arc<Mutex<Session>>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("engine-events".into())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                let event = match rx.recv_timeout(EVENT_POLL) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                handle_engine_event(event, &adapter, events.as_ref(), &session);
            }
        })
        .context("spawn engine event thread")
}

fn handle_engine_event(
    event: EngineEvent,
    adapter: &SyncAdapter,
    events: &dyn ControlEvents,
    session: &Mutex<Session>,
) {
    match event {
        EngineEvent::TrackChanged {
            track_number,
            info,
            uri,
            metadata,
        } => {
            tracing::info!(
                track_number,
                codec = %info.codec,
                rate_hz = info.sample_rate,
                bits = info.bit_depth,
                channels = info.channels,
                dsd = info.is_dsd,
                "now playing"
            );
            {
                let mut session = lock(session);
                session.uri = Some(uri.clone());
                session.metadata = metadata.clone();
            }
            events.notify_track_change(&uri, &metadata);
            events.notify_state_change(PlaybackState::Playing);
        }
        EngineEvent::TrackEnded => {
            tracing::info!("track ended naturally");
            // Let the transport play out what is already buffered.
            adapter.stop_playback(false);
            lock(session).end_reason = Some(PlaybackEndReason::Eof);
            events.notify_state_change(PlaybackState::Stopped);
        }
        EngineEvent::Halted => {
            tracing::warn!("playback halted by the output");
            adapter.stop_playback(true);
            lock(session).end_reason = Some(PlaybackEndReason::Error);
            events.notify_state_change(PlaybackState::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkProfile;
    use stream_core::OpenResult;
    use stream_core::engine::{AudioBuffer, Decoder};
    use stream_core::format::TrackInfo;

    #[derive(Debug, Clone, PartialEq)]
    enum Note {
        State(PlaybackState),
        Track(String),
        Position(u64, u64),
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Note>>);

    impl Recorder {
        fn notes(&self) -> Vec<Note> {
            self.0.lock().unwrap().clone()
        }

        fn wait_for(&self, note: &Note) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.notes().contains(note) {
                assert!(Instant::now() < deadline, "never saw {note:?}");
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl ControlEvents for Recorder {
        fn notify_state_change(&self, state: PlaybackState) {
            self.0.lock().unwrap().push(Note::State(state));
        }
        fn notify_track_change(&self, uri: &str, _metadata: &str) {
            self.0.lock().unwrap().push(Note::Track(uri.to_string()));
        }
        fn notify_position_change(&self, position: u64, duration: u64) {
            self.0.lock().unwrap().push(Note::Position(position, duration));
        }
    }

    /// 44.1 kHz stereo 16-bit silence; `tone:<frames>`.
    struct ToneDecoder {
        info: TrackInfo,
        left: usize,
    }

    impl Decoder for ToneDecoder {
        fn open(&mut self, uri: &str) -> OpenResult<()> {
            let frames = uri
                .strip_prefix("tone:")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| stream_core::OpenError::Decoder {
                    uri: uri.to_string(),
                    reason: "not a tone".into(),
                })?;
            self.info = TrackInfo {
                uri: uri.to_string(),
                sample_rate: 44_100,
                bit_depth: 16,
                channels: 2,
                codec: "PCM_S16LE".into(),
                duration_samples: frames as u64,
                ..TrackInfo::default()
            };
            self.left = frames;
            Ok(())
        }
        fn close(&mut self) {}
        fn track_info(&self) -> &TrackInfo {
            &self.info
        }
        fn read_samples(&mut self, buf: &mut AudioBuffer, samples: usize, _: u32, _: u32) -> usize {
            let n = samples.min(self.left);
            self.left -= n;
            buf.resize(n * 4);
            buf.as_mut_slice().fill(0);
            n
        }
        fn is_eof(&self) -> bool {
            self.left == 0
        }
        fn seek(&mut self, _: f64) -> bool {
            false
        }
    }

    fn start(sink: SinkProfile) -> (Renderer, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = RendererConfig {
            sink,
            uuid: "uuid:test".into(),
            ..RendererConfig::default()
        };
        let sync = SyncConfig {
            online_wait: Duration::from_millis(20),
            post_online_silence_buffers: 0,
            post_stop_silence_buffers: 1,
            ..SyncConfig::default()
        };
        let factory: Arc<dyn DecoderFactory> = Arc::new(|| {
            Box::new(ToneDecoder {
                info: TrackInfo::default(),
                left: 0,
            }) as Box<dyn Decoder>
        });
        let renderer = Renderer::start_with(config, sync, factory, recorder.clone()).unwrap();
        (renderer, recorder)
    }

    #[test]
    fn gapless_chain_reports_track_change_then_eof() {
        let (renderer, recorder) = start(SinkProfile::default());
        renderer.on_set_uri("tone:4410", "").unwrap();
        renderer.on_set_next_uri("tone:4410", "second");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !renderer.engine().has_next_ready() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        renderer.on_play().unwrap();

        recorder.wait_for(&Note::Track("tone:4410".into()));
        recorder.wait_for(&Note::State(PlaybackState::Stopped));
        assert_eq!(renderer.end_reason(), Some(PlaybackEndReason::Eof));
        assert_eq!(renderer.status().track_number, 2);
        assert!(recorder.notes().contains(&Note::State(PlaybackState::Playing)));
        renderer.shutdown();
    }

    #[test]
    fn stop_keeps_track_loaded_and_reports_reason() {
        let (renderer, recorder) = start(SinkProfile::default());
        renderer.on_set_uri("tone:441000", "").unwrap();
        renderer.on_play().unwrap();
        renderer.on_stop();

        assert_eq!(renderer.engine().state(), PlaybackState::Stopped);
        assert_eq!(renderer.end_reason(), Some(PlaybackEndReason::Stopped));
        assert_eq!(renderer.status().uri.as_deref(), Some("tone:441000"));
        assert_eq!(
            recorder.notes().last(),
            Some(&Note::State(PlaybackState::Stopped))
        );
        // Play straight after stop waits out the DAC settle time.
        let started = Instant::now();
        renderer.on_play().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(DAC_STABILIZATION_MS));
        assert_eq!(renderer.engine().state(), PlaybackState::Playing);
    }

    #[test]
    fn pause_then_play_resumes() {
        let (renderer, recorder) = start(SinkProfile::default());
        renderer.on_set_uri("tone:441000", "").unwrap();
        renderer.on_play().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !renderer.adapter.is_open() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        renderer.on_pause();
        assert_eq!(renderer.engine().state(), PlaybackState::Paused);
        assert!(renderer.adapter.is_paused());

        renderer.on_play().unwrap();
        assert_eq!(renderer.engine().state(), PlaybackState::Playing);
        assert!(!renderer.adapter.is_paused());
        assert!(recorder.notes().contains(&Note::State(PlaybackState::Paused)));
    }

    #[test]
    fn unsupported_sink_halts_with_error() {
        let (renderer, recorder) = start(SinkProfile {
            pcm_bits: 24,
            ..SinkProfile::default()
        });
        renderer.on_set_uri("tone:44100", "").unwrap();
        renderer.on_play().unwrap();
        recorder.wait_for(&Note::State(PlaybackState::Stopped));
        assert_eq!(renderer.end_reason(), Some(PlaybackEndReason::Error));
    }

    #[test]
    fn bad_uri_is_reported() {
        let (renderer, _recorder) = start(SinkProfile::default());
        assert!(renderer.on_set_uri("nope", "").is_err());
        assert!(renderer.on_play().is_err());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (renderer, _recorder) = start(SinkProfile::default());
        renderer.shutdown();
        renderer.shutdown();
        assert!(!renderer.adapter.is_open());
    }
}
