//! Once-a-second position reports while playing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use stream_core::PlaybackState;
use stream_core::engine::PlaybackEngine;

use crate::renderer::ControlEvents;

pub const POSITION_INTERVAL: Duration = Duration::from_secs(1);
const POLL_STEP: Duration = Duration::from_millis(50);

/// Whole seconds reported to control points: `(position, duration)`.
pub fn position_report(engine: &PlaybackEngine) -> Option<(u64, u64)> {
    if engine.state() != PlaybackState::Playing {
        return None;
    }
    let position = engine.position_secs().max(0.0) as u64;
    let duration = engine.duration_secs().unwrap_or(0.0).max(0.0) as u64;
    Some((position, duration))
}

pub fn spawn_position_reporter(
    engine: Arc<PlaybackEngine>,
    events: Arc<dyn ControlEvents>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("position".into())
        .spawn(move || {
            let mut next_report = Instant::now() + POSITION_INTERVAL;
            while running.load(Ordering::Acquire) {
                let now = Instant::now();
                if now < next_report {
                    std::thread::sleep(POLL_STEP.min(next_report - now));
                    continue;
                }
                next_report += POSITION_INTERVAL;
                if next_report < now {
                    next_report = now + POSITION_INTERVAL;
                }
                if let Some((position, duration)) = position_report(&engine) {
                    events.notify_position_change(position, duration);
                }
            }
            tracing::debug!("position reporter stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use stream_core::OpenResult;
    use stream_core::engine::{AudioBuffer, AudioPayload, Decoder, DeliveryResult};
    use stream_core::format::TrackInfo;

    struct Silent(TrackInfo);

    impl Decoder for Silent {
        fn open(&mut self, uri: &str) -> OpenResult<()> {
            self.0 = TrackInfo {
                uri: uri.to_string(),
                sample_rate: 1000,
                bit_depth: 16,
                channels: 1,
                duration_samples: 5000,
                ..TrackInfo::default()
            };
            Ok(())
        }
        fn close(&mut self) {}
        fn track_info(&self) -> &TrackInfo {
            &self.0
        }
        fn read_samples(&mut self, buf: &mut AudioBuffer, samples: usize, _: u32, _: u32) -> usize {
            buf.resize(samples * 2);
            samples
        }
        fn is_eof(&self) -> bool {
            false
        }
        fn seek(&mut self, _: f64) -> bool {
            true
        }
    }

    #[test]
    fn reports_only_while_playing() {
        let (tx, _rx) = unbounded();
        let factory = Arc::new(|| Box::new(Silent(TrackInfo::default())) as Box<dyn Decoder>);
        let sink = |p: &AudioPayload<'_>, _: &TrackInfo| DeliveryResult::sent(p.bytes);
        let engine = PlaybackEngine::new(factory, Box::new(sink), tx);
        engine.set_current_uri("silent", "", false).unwrap();
        assert_eq!(position_report(&engine), None);

        engine.play().unwrap();
        engine.process(2500);
        assert_eq!(position_report(&engine), Some((2, 5)));

        engine.pause();
        assert_eq!(position_report(&engine), None);
    }
}
