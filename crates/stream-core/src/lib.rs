//! Real-time data path of the gapless renderer.
//!
//! Bytes flow from the [`engine::PlaybackEngine`] (driven by
//! [`cadence::spawn_cadence_loop`]) through a delivery sink into
//! [`sync::AudioProducer::send_audio`], get converted into the
//! [`ring::RingChannel`], and are pulled back out by the transport worker via
//! [`sync::AudioConsumer::pull`].

pub mod cadence;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod format;
pub mod gate;
pub mod ring;
pub mod sync;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{OpenError, OpenResult};
pub use format::{AudioFormat, DsdSubFormat, S24Hint, TrackInfo};
pub use stream_types::PlaybackState;
pub use sync::{AudioConsumer, AudioProducer, PullBuffer, SyncAdapter};
pub use transport::{SinkEncoding, Transport};

/// Lock ignoring poison: a panicked holder leaves plain data behind.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
