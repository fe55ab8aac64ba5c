//! Local stand-in for the network transport.
//!
//! Accepts whatever the configured [`SinkProfile`] allows, then pulls one
//! packet's worth of bytes per cycle on its own worker thread and writes the
//! audio to a raw file (or drops it). Idle and underrun silence is counted,
//! not written. The output file holds the delivered stream plus the silence
//! that pads the last partial buffer of a stop drain to a full cycle.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use stream_core::cadence::Cadence;
use stream_core::config::IDLE_SLEEP;
use stream_core::format::AudioFormat;
use stream_core::{AudioConsumer, OpenResult, SinkEncoding, Transport};

use crate::config::SinkProfile;

#[derive(Clone, Copy, Debug, Default)]
struct Link {
    format: Option<AudioFormat>,
    cycle: Duration,
    latency: Duration,
}

/// Counters of the worker, readable from any thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub audio_buffers: u64,
    pub silence_buffers: u64,
    pub bytes_written: u64,
}

pub struct FileTransport {
    sink: SinkProfile,
    mtu: u32,
    online: AtomicBool,
    connected: AtomicBool,
    connect_epoch: AtomicU32,
    link: Mutex<Link>,
    audio_buffers: AtomicU64,
    silence_buffers: AtomicU64,
    bytes_written: AtomicU64,
}

impl FileTransport {
    pub fn new(sink: SinkProfile, mtu: u32) -> Self {
        Self {
            sink,
            mtu,
            online: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            connect_epoch: AtomicU32::new(0),
            link: Mutex::new(Link::default()),
            audio_buffers: AtomicU64::new(0),
            silence_buffers: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            audio_buffers: self.audio_buffers.load(Ordering::Relaxed),
            silence_buffers: self.silence_buffers.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    fn link(&self) -> Link {
        *self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the pull worker. It runs until `running` is cleared.
    pub fn spawn_worker(
        self: &Arc<Self>,
        consumer: AudioConsumer,
        output: Option<&Path>,
        running: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let writer = match output {
            Some(path) => Some(BufWriter::new(
                File::create(path).with_context(|| format!("create output {path:?}"))?,
            )),
            None => None,
        };
        let transport = self.clone();
        std::thread::Builder::new()
            .name("transport".into())
            .spawn(move || transport.worker_loop(consumer, writer, &running))
            .context("spawn transport worker")
    }

    fn worker_loop(
        &self,
        mut consumer: AudioConsumer,
        mut writer: Option<BufWriter<File>>,
        running: &AtomicBool,
    ) {
        let mut cadence = Cadence::new(Duration::ZERO);
        let mut epoch = None;

        while running.load(Ordering::Acquire) {
            if !self.connected.load(Ordering::Acquire) {
                if epoch.take().is_some() {
                    flush(&mut writer);
                }
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            let current = self.connect_epoch.load(Ordering::Acquire);
            if epoch != Some(current) {
                let link = self.link();
                epoch = Some(current);
                // Sink-side start latency.
                std::thread::sleep(link.latency);
                cadence = Cadence::new(link.cycle);
                tracing::debug!(
                    cycle_us = link.cycle.as_micros() as u64,
                    latency_ms = link.latency.as_millis() as u64,
                    "transport worker (re)started"
                );
            }

            {
                let buf = consumer.pull();
                if buf.is_silence() {
                    self.silence_buffers.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.audio_buffers.fetch_add(1, Ordering::Relaxed);
                    self.bytes_written
                        .fetch_add(buf.len() as u64, Ordering::Relaxed);
                    if let Some(w) = writer.as_mut() {
                        if let Err(e) = w.write_all(&buf) {
                            tracing::error!(error = %e, "output write failed; discarding from now on");
                            writer = None;
                        }
                    }
                }
            }
            cadence.wait();
        }
        flush(&mut writer);
        tracing::debug!("transport worker stopped");
    }
}

fn flush(writer: &mut Option<BufWriter<File>>) {
    if let Some(w) = writer.as_mut() {
        if let Err(e) = w.flush() {
            tracing::warn!(error = %e, "output flush failed");
        }
    }
}

impl Transport for FileTransport {
    fn negotiate(&self, format: &AudioFormat) -> Option<SinkEncoding> {
        self.sink.encoding_for(format)
    }

    fn connect(&self, format: &AudioFormat, cycle_time: Duration) -> OpenResult<()> {
        {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            *link = Link {
                format: Some(*format),
                cycle: cycle_time,
                latency: format.jitter_target(),
            };
        }
        self.connect_epoch.fetch_add(1, Ordering::AcqRel);
        self.connected.store(true, Ordering::Release);
        tracing::info!(
            rate_hz = format.sample_rate,
            bits = format.bit_depth,
            channels = format.channels,
            dsd = format.is_dsd,
            cycle_us = cycle_time.as_micros() as u64,
            "transport connected"
        );
        Ok(())
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let format = self.link().format;
            tracing::info!(format = ?format, "transport disconnected");
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }
}
