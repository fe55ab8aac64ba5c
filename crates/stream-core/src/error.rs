use thiserror::Error;

/// Failures surfaced by the control paths (`open`, `set_current_uri`).
///
/// The hot path never returns these; it reports counts and statuses instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    #[error("transport is offline")]
    TransportOffline,

    #[error("format not accepted by sink: {0}")]
    UnsupportedFormat(String),

    #[error("decoder failed to open {uri}: {reason}")]
    Decoder { uri: String, reason: String },

    #[error("transport connect failed: {0}")]
    Connect(String),

    #[error("no track has been set")]
    NoTrack,
}

pub type OpenResult<T> = std::result::Result<T, OpenError>;
