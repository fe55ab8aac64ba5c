//! Fixed-period driver for [`PlaybackEngine::process`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use stream_types::PlaybackState;

use crate::config::{DSD_CHUNK, IDLE_SLEEP, PCM_CHUNK_HIGH, PCM_CHUNK_LOW, PCM_CHUNK_MID};
use crate::engine::PlaybackEngine;

/// Samples per `process()` call for a rate tier.
pub fn select_chunk_size(sample_rate: u32, is_dsd: bool) -> usize {
    if is_dsd {
        DSD_CHUNK
    } else if sample_rate <= 48_000 {
        PCM_CHUNK_LOW
    } else if sample_rate <= 96_000 {
        PCM_CHUNK_MID
    } else {
        PCM_CHUNK_HIGH
    }
}

pub fn chunk_period(chunk: usize, sample_rate: u32) -> Duration {
    Duration::from_micros(chunk as u64 * 1_000_000 / sample_rate.max(1) as u64)
}

/// Absolute-deadline ticker: each tick advances the deadline by exactly one
/// period, so work time does not accumulate into drift.
#[derive(Debug, Clone)]
pub struct Cadence {
    period: Duration,
    next_wake: Instant,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_wake: Instant::now(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn reset(&mut self) {
        self.next_wake = Instant::now();
    }

    /// Advance the deadline and return how long to sleep from `now`.
    /// When already behind, the deadline is re-based to `now` and no sleep is
    /// requested.
    pub fn advance(&mut self, now: Instant) -> Option<Duration> {
        self.next_wake += self.period;
        if self.next_wake > now {
            Some(self.next_wake - now)
        } else {
            self.next_wake = now;
            None
        }
    }

    /// [`Cadence::advance`] followed by the sleep.
    pub fn wait(&mut self) {
        if let Some(delay) = self.advance(Instant::now()) {
            std::thread::sleep(delay);
        }
    }
}

/// Run `engine.process()` on its own thread until `running` is cleared.
pub fn spawn_cadence_loop(
    engine: Arc<PlaybackEngine>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cadence".into())
        .spawn(move || cadence_loop(&engine, &running))
}

fn cadence_loop(engine: &PlaybackEngine, running: &AtomicBool) {
    let mut cadence = Cadence::new(Duration::ZERO);
    let mut chunk = 0;
    let mut last_rate = 0;

    while running.load(Ordering::Acquire) {
        if engine.state() != PlaybackState::Playing {
            std::thread::sleep(IDLE_SLEEP);
            last_rate = 0;
            continue;
        }
        let Some((rate, is_dsd)) = engine.current_rate() else {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        };
        if rate != last_rate {
            chunk = select_chunk_size(rate, is_dsd);
            cadence = Cadence::new(chunk_period(chunk, rate));
            last_rate = rate;
            tracing::debug!(
                rate_hz = rate,
                dsd = is_dsd,
                chunk,
                period_us = cadence.period().as_micros() as u64,
                "cadence configured"
            );
        }

        engine.process(chunk);
        cadence.wait();
    }
    tracing::debug!("cadence loop stopped");
}
