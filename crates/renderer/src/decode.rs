//! Symphonia-backed track decoder.
//!
//! Decodes one file into raw little-endian interleaved PCM for the engine:
//! - 16-bit (and narrower or lossy) sources as `i16`
//! - 24-bit sources as `i32` containers with the sample in the upper three
//!   bytes (reported as an MSB-aligned S24 hint)
//! - everything wider as `i32`
//!
//! Packets rarely line up with the engine's chunk size, so decoded bytes are
//! staged in a pending buffer and handed out in whole frames.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use stream_core::engine::{AudioBuffer, Decoder};
use stream_core::format::{S24Hint, TrackInfo};
use stream_core::{OpenError, OpenResult};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::conv::ConvertibleSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

/// Container width of the samples handed to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SampleWidth {
    I16,
    I32,
}

/// Depth reported to the engine for a source depth (`None` for lossy codecs).
fn output_bits(source_bits: Option<u32>) -> u32 {
    match source_bits {
        Some(24) => 24,
        Some(bits) if bits > 16 => 32,
        _ => 16,
    }
}

/// Map a `file://` URI or plain path to a filesystem path.
fn uri_to_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

/// Best-effort codec label used for track info and status payloads.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}

struct OpenStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    width: SampleWidth,
    i16_buf: Option<SampleBuffer<i16>>,
    i32_buf: Option<SampleBuffer<i32>>,
    /// Frames to drop after an accurate seek landed before the target.
    skip_frames: u64,
}

impl OpenStream {
    fn probe(path: &Path) -> Result<(Self, TrackInfo)> {
        let file = File::open(path).with_context(|| format!("open {path:?}"))?;
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("probe container")?;
        let format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("no default audio track"))?;
        let track_id = track.id;
        let params = track.codec_params.clone();
        let channels = params
            .channels
            .ok_or_else(|| anyhow!("unknown channel layout"))?
            .count() as u32;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| anyhow!("unknown sample rate"))?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("create codec")?;

        let codec = codec_name_from_params(&params).unwrap_or("UNKNOWN");
        let bit_depth = output_bits(params.bits_per_sample);
        let info = TrackInfo {
            sample_rate,
            bit_depth,
            channels,
            codec: codec.to_string(),
            duration_samples: params.n_frames.unwrap_or(0),
            is_compressed: !codec.starts_with("PCM_"),
            s24_alignment: if bit_depth == 24 {
                S24Hint::MsbAligned
            } else {
                S24Hint::Unknown
            },
            ..TrackInfo::default()
        };
        let stream = Self {
            format,
            decoder,
            track_id,
            width: if bit_depth == 16 {
                SampleWidth::I16
            } else {
                SampleWidth::I32
            },
            i16_buf: None,
            i32_buf: None,
            skip_frames: 0,
        };
        Ok((stream, info))
    }

    /// Decode the next packet of our track and append its bytes to `out`.
    /// Returns `false` at end of stream or on a fatal error.
    fn decode_next(&mut self, out: &mut Vec<u8>) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "demux failed; ending track");
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    append_samples(
                        decoded,
                        self.width,
                        &mut self.i16_buf,
                        &mut self.i32_buf,
                        &mut self.skip_frames,
                        out,
                    );
                    return true;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!(error = e, "skipping undecodable packet");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "decode failed; ending track");
                    return false;
                }
            }
        }
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        let time = Time::new(seconds.trunc() as u64, seconds.fract());
        let seeked = self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        )?;
        self.decoder.reset();
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        Ok(())
    }
}

fn staging<T: ConvertibleSample>(
    slot: &mut Option<SampleBuffer<T>>,
    frames: u64,
    spec: SignalSpec,
) -> &mut SampleBuffer<T> {
    let channels = spec.channels.count();
    let fits = slot
        .as_ref()
        .is_some_and(|buf| buf.capacity() >= frames as usize * channels);
    if !fits {
        *slot = Some(SampleBuffer::new(frames, spec));
    }
    slot.get_or_insert_with(|| SampleBuffer::new(frames, spec))
}

fn append_samples(
    decoded: AudioBufferRef<'_>,
    width: SampleWidth,
    i16_buf: &mut Option<SampleBuffer<i16>>,
    i32_buf: &mut Option<SampleBuffer<i32>>,
    skip_frames: &mut u64,
    out: &mut Vec<u8>,
) {
    let spec = *decoded.spec();
    let channels = spec.channels.count().max(1);
    let frames = decoded.capacity() as u64;
    let skip = (*skip_frames).min(decoded.frames() as u64) as usize;
    *skip_frames -= skip as u64;

    match width {
        SampleWidth::I16 => {
            let buf = staging(i16_buf, frames, spec);
            buf.copy_interleaved_ref(decoded);
            for s in &buf.samples()[skip * channels..] {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        SampleWidth::I32 => {
            let buf = staging(i32_buf, frames, spec);
            buf.copy_interleaved_ref(decoded);
            for s in &buf.samples()[skip * channels..] {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
    }
}

/// One track at a time, opened from a local path or `file://` URI.
pub struct SymphoniaDecoder {
    info: TrackInfo,
    stream: Option<OpenStream>,
    pending: Vec<u8>,
    pending_pos: usize,
    exhausted: bool,
}

impl Default for SymphoniaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self {
            info: TrackInfo::default(),
            stream: None,
            pending: Vec::new(),
            pending_pos: 0,
            exhausted: true,
        }
    }

    pub fn boxed() -> Box<dyn Decoder> {
        Box::new(Self::new())
    }

    fn frame_bytes(&self) -> usize {
        let width = if self.info.bit_depth == 16 { 2 } else { 4 };
        width * self.info.channels.max(1) as usize
    }

    fn buffered(&self) -> usize {
        self.pending.len() - self.pending_pos
    }

    fn reset_pending(&mut self) {
        self.pending.clear();
        self.pending_pos = 0;
    }
}

impl Decoder for SymphoniaDecoder {
    fn open(&mut self, uri: &str) -> OpenResult<()> {
        let path = uri_to_path(uri);
        let (stream, mut info) = OpenStream::probe(&path).map_err(|e| OpenError::Decoder {
            uri: uri.to_string(),
            reason: format!("{e:#}"),
        })?;
        info.uri = uri.to_string();
        tracing::debug!(
            uri,
            codec = %info.codec,
            rate_hz = info.sample_rate,
            bits = info.bit_depth,
            channels = info.channels,
            "decoder opened"
        );
        self.info = info;
        self.stream = Some(stream);
        self.reset_pending();
        self.exhausted = false;
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.reset_pending();
        self.exhausted = true;
    }

    fn track_info(&self) -> &TrackInfo {
        &self.info
    }

    fn read_samples(
        &mut self,
        buf: &mut AudioBuffer,
        samples: usize,
        _target_rate: u32,
        _target_bits: u32,
    ) -> usize {
        let frame = self.frame_bytes();
        let wanted = samples * frame;
        while self.buffered() < wanted && !self.exhausted {
            if self.pending_pos > 0 {
                self.pending.drain(..self.pending_pos);
                self.pending_pos = 0;
            }
            let Some(stream) = self.stream.as_mut() else {
                self.exhausted = true;
                break;
            };
            if !stream.decode_next(&mut self.pending) {
                self.exhausted = true;
            }
        }

        let n = self.buffered().min(wanted) / frame * frame;
        buf.resize(n);
        buf.as_mut_slice()
            .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        n / frame
    }

    fn is_eof(&self) -> bool {
        self.exhausted && self.buffered() < self.frame_bytes()
    }

    fn seek(&mut self, seconds: f64) -> bool {
        if let Some(duration) = self.info.duration_secs() {
            if seconds > duration {
                return false;
            }
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        match stream.seek(seconds) {
            Ok(()) => {
                self.reset_pending();
                self.exhausted = false;
                true
            }
            Err(e) => {
                tracing::warn!(seconds, error = %e, "seek failed");
                false
            }
        }
    }
}
