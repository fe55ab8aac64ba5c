use serde::{Deserialize, Serialize};

/// Transport state of a renderer instance.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Nothing is being delivered; all decoders are closed.
    #[default]
    Stopped,
    /// The cadence loop is pulling samples from the current decoder.
    Playing,
    /// Decoders stay open; delivery is suspended.
    Paused,
}

impl PlaybackState {
    /// Label used by control protocols for the transport state.
    pub fn transport_label(self) -> &'static str {
        match self {
            PlaybackState::Stopped => "STOPPED",
            PlaybackState::Playing => "PLAYING",
            PlaybackState::Paused => "PAUSED_PLAYBACK",
        }
    }

    /// Encode for storage in an `AtomicU8`.
    pub fn as_u8(self) -> u8 {
        match self {
            PlaybackState::Stopped => 0,
            PlaybackState::Playing => 1,
            PlaybackState::Paused => 2,
        }
    }

    /// Decode from an `AtomicU8`; unknown values map to `Stopped`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Paused,
            _ => PlaybackState::Stopped,
        }
    }
}

/// Reason why playback of the current queue ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of the last track with no next track armed.
    Eof,
    /// The decoder or transport failed while playing.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Snapshot of a renderer's playback and transport health.
///
/// Positions are reported in seconds because control protocols exchange
/// wall-clock time strings, not sample counts.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RendererStatus {
    /// Current transport state.
    pub state: PlaybackState,
    /// URI of the track currently delivered, if any.
    pub uri: Option<String>,
    /// 1-based number of the track within the gapless chain.
    pub track_number: u32,
    /// Elapsed playback time of the current track in seconds.
    pub position_secs: f64,
    /// Total track duration in seconds, when the decoder knows it.
    pub duration_secs: Option<f64>,
    /// Codec label reported by the decoder.
    pub codec: Option<String>,
    /// Source sample rate in Hz (bit rate for DSD).
    pub sample_rate: Option<u32>,
    /// Source bit depth (1 for DSD).
    pub bit_depth: Option<u32>,
    /// Channel count.
    pub channels: Option<u32>,
    /// `true` when the stream is native DSD.
    pub dsd: bool,
    /// Ring fill level in `[0, 1]`.
    pub buffer_level: f32,
    /// Count of transport pulls answered with underrun silence.
    pub underruns: u64,
    /// Set once playback stops.
    pub end_reason: Option<PlaybackEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_state_round_trips_through_u8() {
        for state in [
            PlaybackState::Stopped,
            PlaybackState::Playing,
            PlaybackState::Paused,
        ] {
            assert_eq!(PlaybackState::from_u8(state.as_u8()), state);
        }
        assert_eq!(PlaybackState::from_u8(42), PlaybackState::Stopped);
    }

    #[test]
    fn transport_labels_match_control_protocol_names() {
        assert_eq!(PlaybackState::Paused.transport_label(), "PAUSED_PLAYBACK");
        assert_eq!(PlaybackState::Playing.transport_label(), "PLAYING");
    }

    #[test]
    fn status_serializes_with_snake_case_enums() {
        let status = RendererStatus {
            state: PlaybackState::Playing,
            end_reason: Some(PlaybackEndReason::Eof),
            ..RendererStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "playing");
        assert_eq!(json["end_reason"], "eof");
    }
}
