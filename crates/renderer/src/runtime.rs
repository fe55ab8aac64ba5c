//! Renderer runtime for the `play` command.
//!
//! The calling thread acts as the control point: it feeds URIs to the
//! renderer, keeps the gapless queue one track ahead and reacts to the
//! renderer's notifications until the list is done or the user interrupts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, select};
use stream_core::PlaybackState;
use stream_types::{PlaybackEndReason, RendererStatus};

use crate::config::PlayConfig;
use crate::renderer::{ControlEvents, Renderer};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Renderer notification as seen by the control thread.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    State(PlaybackState),
    Track { uri: String, metadata: String },
    Position { position: u64, duration: u64 },
}

/// [`ControlEvents`] that forwards into a channel.
pub struct ChannelEvents(Sender<Notification>);

impl ChannelEvents {
    pub fn new() -> (Arc<Self>, Receiver<Notification>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self(tx)), rx)
    }
}

impl ControlEvents for ChannelEvents {
    fn notify_state_change(&self, state: PlaybackState) {
        tracing::info!(state = state.transport_label(), "transport state");
        let _ = self.0.send(Notification::State(state));
    }

    fn notify_track_change(&self, uri: &str, metadata: &str) {
        let _ = self.0.send(Notification::Track {
            uri: uri.to_string(),
            metadata: metadata.to_string(),
        });
    }

    fn notify_position_change(&self, position: u64, duration: u64) {
        let _ = self.0.send(Notification::Position { position, duration });
    }
}

/// Which URI is playing and which one the renderer holds as "next".
#[derive(Debug)]
struct Queue {
    uris: Vec<String>,
    current: usize,
    gapless: bool,
}

impl Queue {
    fn new(uris: Vec<String>, gapless: bool) -> Self {
        Self {
            uris,
            current: 0,
            gapless,
        }
    }

    fn current(&self) -> Option<&str> {
        self.uris.get(self.current).map(String::as_str)
    }

    fn upcoming(&self) -> Option<&str> {
        self.uris.get(self.current + 1).map(String::as_str)
    }

    /// URI to hand over as the gapless successor, if any.
    fn gapless_next(&self) -> Option<&str> {
        if self.gapless { self.upcoming() } else { None }
    }

    /// Move to the following entry.
    fn advance(&mut self) -> Option<&str> {
        if self.current + 1 >= self.uris.len() {
            return None;
        }
        self.current += 1;
        self.current()
    }
}

/// Run the list to completion and return the final renderer status.
///
/// `interrupt` fires once per Ctrl-C; `None` never interrupts.
pub fn run_play(config: PlayConfig, interrupt: Option<Receiver<()>>) -> Result<RendererStatus> {
    let (events, notes) = ChannelEvents::new();
    let gapless = config.renderer.gapless;
    let renderer = Renderer::start(config.renderer, events)?;
    let status = drive(&renderer, config.uris, config.start.as_deref(), gapless, &notes, interrupt)?;
    renderer.shutdown();
    Ok(status)
}

fn drive(
    renderer: &Renderer,
    uris: Vec<String>,
    start: Option<&str>,
    gapless: bool,
    notes: &Receiver<Notification>,
    interrupt: Option<Receiver<()>>,
) -> Result<RendererStatus> {
    let interrupt = interrupt.unwrap_or_else(crossbeam_channel::never);
    let mut queue = Queue::new(uris, gapless);

    let Some(first) = queue.current() else {
        return Ok(renderer.status());
    };
    renderer.on_set_uri(first, "")?;
    if let Some(next) = queue.gapless_next() {
        renderer.on_set_next_uri(next, "");
    }
    renderer.on_play()?;
    if let Some(target) = start {
        if !renderer.on_seek(target) {
            tracing::warn!(target, "start position ignored");
        }
    }

    loop {
        select! {
            recv(notes) -> note => {
                let Ok(note) = note else { break };
                match note {
                    Notification::Track { uri, .. } => {
                        queue.advance();
                        tracing::info!(uri, index = queue.current, "gapless track started");
                        if let Some(next) = queue.gapless_next() {
                            renderer.on_set_next_uri(next, "");
                        }
                    }
                    Notification::State(PlaybackState::Stopped) => {
                        if renderer.end_reason() != Some(PlaybackEndReason::Eof) {
                            break;
                        }
                        if queue.gapless || queue.upcoming().is_none() {
                            break;
                        }
                        wait_for_drain(renderer);
                        let Some(uri) = queue.advance() else { break };
                        if let Err(err) = renderer.on_set_uri(uri, "").and_then(|()| renderer.on_play()) {
                            tracing::warn!(uri, error = %err, "skipping track");
                        }
                    }
                    Notification::Position { position, duration } => {
                        tracing::debug!(position, duration, "position");
                    }
                    Notification::State(_) => {}
                }
            }
            recv(interrupt) -> _ => {
                tracing::info!("interrupted");
                renderer.on_stop();
                break;
            }
        }
    }

    wait_for_drain(renderer);
    let stats = renderer.transport_stats();
    tracing::info!(
        audio_buffers = stats.audio_buffers,
        silence_buffers = stats.silence_buffers,
        bytes = stats.bytes_written,
        "transport totals"
    );
    Ok(renderer.status())
}

fn wait_for_drain(renderer: &Renderer) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while renderer.is_output_active() {
        if Instant::now() >= deadline {
            tracing::warn!("output still active after drain timeout");
            return;
        }
        std::thread::sleep(DRAIN_POLL);
    }
}
