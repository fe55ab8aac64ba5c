//! Sample-format conversion on the way into the ring.
//!
//! Every converting push stages its output in a fixed scratch area, clamps
//! the work to both the scratch size and the ring's free space, and reports
//! how many *input* bytes it consumed so the caller can retry the rest.
//!
//! Conversions are bit-exact:
//! - 24-in-32 PCM is repacked to 3 bytes per sample; which 3 bytes depends on
//!   the detected [`AlignmentMode`].
//! - 16-bit PCM is widened to 32-bit by placing the sample in the top half.
//! - Planar DSD is interleaved in 4-byte groups per channel, with optional
//!   per-byte bit reversal and per-group byte swap.

use std::ops::Range;

use crate::config::{ALIGNMENT_PROBE_SAMPLES, DEFERRED_TIMEOUT_SAMPLES, STAGING_SIZE};
use crate::format::S24Hint;
use crate::ring::RingChannel;

/// Where the 24 significant bits sit inside a 32-bit container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignmentMode {
    /// Nothing observed yet.
    Unknown,
    /// Significant bytes are 0..3; byte 3 is padding.
    LsbAligned,
    /// Significant bytes are 1..4; byte 0 is padding.
    MsbAligned,
    /// Only silence seen so far; decision postponed.
    Deferred,
}

impl From<S24Hint> for AlignmentMode {
    fn from(hint: S24Hint) -> Self {
        match hint {
            S24Hint::Unknown => AlignmentMode::Unknown,
            S24Hint::LsbAligned => AlignmentMode::LsbAligned,
            S24Hint::MsbAligned => AlignmentMode::MsbAligned,
        }
    }
}

/// Adaptive S24 alignment detection.
///
/// Sample evidence wins over the decoder hint. Silence defers the decision;
/// after [`DEFERRED_TIMEOUT_SAMPLES`] silent samples the hint (or LSB) is
/// taken as final. A confirmed mode is only revisited after [`reset`] or a
/// new hint.
///
/// [`reset`]: AlignmentState::reset
#[derive(Clone, Debug)]
pub struct AlignmentState {
    mode: AlignmentMode,
    hint: AlignmentMode,
    confirmed: bool,
    deferred_samples: usize,
}

impl Default for AlignmentState {
    fn default() -> Self {
        Self {
            mode: AlignmentMode::Unknown,
            hint: AlignmentMode::Unknown,
            confirmed: false,
            deferred_samples: 0,
        }
    }
}

impl AlignmentState {
    pub fn mode(&self) -> AlignmentMode {
        self.mode
    }

    pub fn hint(&self) -> AlignmentMode {
        self.hint
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Mode used for packing: undecided states fall back to the hint, then LSB.
    pub fn effective_mode(&self) -> AlignmentMode {
        match self.mode {
            AlignmentMode::Unknown | AlignmentMode::Deferred => self.hint_or_lsb(),
            mode => mode,
        }
    }

    fn hint_or_lsb(&self) -> AlignmentMode {
        match self.hint {
            AlignmentMode::MsbAligned => AlignmentMode::MsbAligned,
            _ => AlignmentMode::LsbAligned,
        }
    }

    /// Forget everything, including the hint.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Store a decoder hint and re-arm detection.
    pub fn set_hint(&mut self, hint: S24Hint) {
        self.hint = hint.into();
        self.confirmed = false;
        if matches!(self.mode, AlignmentMode::Unknown | AlignmentMode::Deferred) {
            self.mode = self.hint;
        }
    }

    /// Feed the next block of 4-byte samples.
    pub fn observe(&mut self, samples: &[u8]) {
        let undecided = matches!(self.mode, AlignmentMode::Unknown | AlignmentMode::Deferred);
        if !undecided && self.confirmed {
            return;
        }
        let count = samples.len() / 4;
        match detect_alignment(samples) {
            AlignmentMode::Deferred => {
                self.mode = AlignmentMode::Deferred;
                self.deferred_samples += count;
                if self.deferred_samples > DEFERRED_TIMEOUT_SAMPLES {
                    self.mode = self.hint_or_lsb();
                    self.confirmed = true;
                    tracing::debug!(mode = ?self.mode, "s24 alignment resolved after silence");
                }
            }
            detected => {
                if self.hint != AlignmentMode::Unknown && detected != self.hint {
                    tracing::debug!(hint = ?self.hint, detected = ?detected, "s24 detection overrides hint");
                }
                self.mode = detected;
                self.confirmed = true;
                self.deferred_samples = 0;
            }
        }
    }
}

/// Classify up to [`ALIGNMENT_PROBE_SAMPLES`] samples by which padding byte is zero.
fn detect_alignment(samples: &[u8]) -> AlignmentMode {
    let mut low_zero = true;
    let mut high_zero = true;
    for s in samples.chunks_exact(4).take(ALIGNMENT_PROBE_SAMPLES) {
        low_zero &= s[0] == 0;
        high_zero &= s[3] == 0;
    }
    match (low_zero, high_zero) {
        (false, true) => AlignmentMode::LsbAligned,
        (true, false) => AlignmentMode::MsbAligned,
        (true, true) => AlignmentMode::Deferred,
        (false, false) => AlignmentMode::LsbAligned,
    }
}

const fn build_bit_reverse() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).reverse_bits();
        i += 1;
    }
    table
}

/// Per-byte bit reversal, LSB-first <-> MSB-first.
pub static BIT_REVERSE: [u8; 256] = build_bit_reverse();

/// Repack 24-in-32 samples to 3 bytes each. Returns bytes written to `dst`.
pub fn pack_24bit(src: &[u8], dst: &mut [u8], mode: AlignmentMode) -> usize {
    let offset = if mode == AlignmentMode::MsbAligned { 1 } else { 0 };
    let mut written = 0;
    for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)) {
        d.copy_from_slice(&s[offset..offset + 3]);
        written += 3;
    }
    written
}

/// Widen 16-bit samples to 32-bit, sample in the upper half.
pub fn upsample_16_to_32(src: &[u8], dst: &mut [u8]) -> usize {
    let mut written = 0;
    for (s, d) in src.chunks_exact(2).zip(dst.chunks_exact_mut(4)) {
        d.copy_from_slice(&[0, 0, s[0], s[1]]);
        written += 4;
    }
    written
}

#[inline]
fn emit_group(src: &[u8], dst: &mut [u8], table: Option<&[u8; 256]>, byte_swap: bool) {
    let mut g = [src[0], src[1], src[2], src[3]];
    if let Some(table) = table {
        for b in &mut g {
            *b = table[*b as usize];
        }
    }
    if byte_swap {
        g.reverse();
    }
    dst.copy_from_slice(&g);
}

/// Interleave planar DSD (`[ch0 bytes][ch1 bytes]...`) into 4-byte groups.
///
/// `bytes_per_channel` is the planar stride; only whole groups are emitted.
/// Returns bytes written to `dst`.
pub fn interleave_dsd(
    src: &[u8],
    dst: &mut [u8],
    channels: usize,
    bytes_per_channel: usize,
    table: Option<&[u8; 256]>,
    byte_swap: bool,
) -> usize {
    interleave_groups(
        src,
        dst,
        channels,
        bytes_per_channel,
        0..bytes_per_channel / 4,
        table,
        byte_swap,
    )
}

/// Interleave the 4-byte groups `groups` of every channel. The output for a
/// group window is the matching slice of the full interleaved block.
fn interleave_groups(
    src: &[u8],
    dst: &mut [u8],
    channels: usize,
    bytes_per_channel: usize,
    groups: Range<usize>,
    table: Option<&[u8; 256]>,
    byte_swap: bool,
) -> usize {
    let span = groups.start * 4..groups.end * 4;
    if channels == 2 {
        let (left, right) = src.split_at(bytes_per_channel);
        let pairs = left[span.clone()]
            .chunks_exact(4)
            .zip(right[span].chunks_exact(4));
        let mut out = 0;
        for ((l, r), dst) in pairs.zip(dst.chunks_exact_mut(8)) {
            emit_group(l, &mut dst[..4], table, byte_swap);
            emit_group(r, &mut dst[4..], table, byte_swap);
            out += 8;
        }
        return out;
    }
    let mut out = 0;
    for g in groups {
        for ch in 0..channels {
            let at = ch * bytes_per_channel + g * 4;
            emit_group(&src[at..at + 4], &mut dst[out..out + 4], table, byte_swap);
            out += 4;
        }
    }
    out
}

/// Owns the staging area and alignment state of one producer.
pub struct FormatConverter {
    staging: Box<[u8]>,
    alignment: AlignmentState,
}

impl Default for FormatConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatConverter {
    pub fn new() -> Self {
        Self {
            staging: vec![0u8; STAGING_SIZE].into_boxed_slice(),
            alignment: AlignmentState::default(),
        }
    }

    pub fn alignment(&self) -> &AlignmentState {
        &self.alignment
    }

    pub fn set_alignment_hint(&mut self, hint: S24Hint) {
        self.alignment.set_hint(hint);
    }

    /// Reset per-stream state for a new connection or format.
    pub fn reset(&mut self) {
        self.alignment.reset();
    }

    /// 24-in-32 input, 3-byte output. Returns input bytes consumed.
    pub fn push_24bit_packed(&mut self, ring: &RingChannel, data: &[u8]) -> usize {
        let samples = (data.len() / 4)
            .min(STAGING_SIZE / 3)
            .min(ring.free_space() / 3);
        if samples == 0 {
            return 0;
        }
        let input = &data[..samples * 4];
        self.alignment.observe(input);
        let staged = pack_24bit(input, &mut self.staging, self.alignment.effective_mode());
        let written = ring.push(&self.staging[..staged]);
        (written / 3) * 4
    }

    /// 16-bit input, 32-bit output. Returns input bytes consumed.
    pub fn push_16_to_32(&mut self, ring: &RingChannel, data: &[u8]) -> usize {
        let samples = (data.len() / 2)
            .min(STAGING_SIZE / 4)
            .min(ring.free_space() / 4);
        if samples == 0 {
            return 0;
        }
        let staged = upsample_16_to_32(&data[..samples * 2], &mut self.staging);
        let written = ring.push(&self.staging[..staged]);
        (written / 4) * 2
    }

    /// Planar DSD chunk, interleaved output. The chunk is taken whole or not
    /// at all, because a partial planar block has no contiguous remainder.
    ///
    /// Only whole 4-byte groups per channel are converted; the return value
    /// counts exactly those bytes, so a ragged tail shows up as unconsumed.
    /// Chunks larger than the staging area are converted in several passes.
    pub fn push_dsd_planar(
        &mut self,
        ring: &RingChannel,
        data: &[u8],
        channels: usize,
        bit_reverse: bool,
        byte_swap: bool,
    ) -> usize {
        if channels == 0 || channels * 4 > self.staging.len() {
            return 0;
        }
        let bytes_per_channel = data.len() / channels;
        let groups = bytes_per_channel / 4;
        let usable = groups * 4 * channels;
        if usable == 0 || usable > ring.free_space() {
            return 0;
        }
        if usable != data.len() {
            tracing::debug!(
                bytes = data.len(),
                usable,
                channels,
                "dsd chunk has a partial group tail"
            );
        }

        let table = bit_reverse.then_some(&BIT_REVERSE);
        let per_pass = self.staging.len() / (channels * 4);
        let mut first = 0;
        while first < groups {
            let last = (first + per_pass).min(groups);
            let staged = interleave_groups(
                data,
                &mut self.staging,
                channels,
                bytes_per_channel,
                first..last,
                table,
                byte_swap,
            );
            ring.push(&self.staging[..staged]);
            first = last;
        }
        usable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(ring: &RingChannel) -> Vec<u8> {
        let mut out = vec![0u8; ring.available()];
        ring.pop(&mut out);
        out
    }

    #[test]
    fn bit_reverse_table_is_an_involution() {
        assert_eq!(BIT_REVERSE[0x01], 0x80);
        assert_eq!(BIT_REVERSE[0xF0], 0x0F);
        assert_eq!(BIT_REVERSE[0x69], 0x96);
        for i in 0..=255u8 {
            assert_eq!(BIT_REVERSE[BIT_REVERSE[i as usize] as usize], i);
        }
    }

    #[test]
    fn pack_24bit_picks_bytes_by_alignment() {
        let src = [0x11, 0x22, 0x33, 0x00, 0x44, 0x55, 0x66, 0x00];
        let mut dst = [0u8; 6];
        assert_eq!(pack_24bit(&src, &mut dst, AlignmentMode::LsbAligned), 6);
        assert_eq!(dst, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

        let src = [0x00, 0x11, 0x22, 0x33];
        let mut dst = [0u8; 3];
        pack_24bit(&src, &mut dst, AlignmentMode::MsbAligned);
        assert_eq!(dst, [0x11, 0x22, 0x33]);
    }

    #[test]
    fn pack_24bit_keeps_sample_bytes_for_a_full_block() {
        let lsb: Vec<u8> = (0..64u32)
            .flat_map(|i| [i as u8, (i * 3) as u8, (i * 7) as u8, 0])
            .collect();
        let mut dst = vec![0u8; 64 * 3];
        assert_eq!(pack_24bit(&lsb, &mut dst, AlignmentMode::LsbAligned), 192);
        let expected: Vec<u8> = lsb.chunks_exact(4).flat_map(|s| [s[0], s[1], s[2]]).collect();
        assert_eq!(dst, expected);

        let msb: Vec<u8> = (0..64u32)
            .flat_map(|i| [0, i as u8, (i * 5) as u8, 0x80 | i as u8])
            .collect();
        pack_24bit(&msb, &mut dst, AlignmentMode::MsbAligned);
        let expected: Vec<u8> = msb.chunks_exact(4).flat_map(|s| [s[1], s[2], s[3]]).collect();
        assert_eq!(dst, expected);
    }

    #[test]
    fn upsample_places_sample_in_upper_half() {
        let mut dst = [0xFFu8; 8];
        assert_eq!(upsample_16_to_32(&[0x34, 0x12, 0xCD, 0xAB], &mut dst), 8);
        assert_eq!(dst, [0, 0, 0x34, 0x12, 0, 0, 0xCD, 0xAB]);
    }

    #[test]
    fn push_24bit_reports_input_bytes() {
        let ring = RingChannel::new(1024, 0);
        let mut conv = FormatConverter::new();
        let data: Vec<u8> = (0..8u8)
            .flat_map(|i| [i, i + 1, i + 2, 0])
            .collect();
        assert_eq!(conv.push_24bit_packed(&ring, &data), 32);
        assert_eq!(ring.available(), 24);
        assert_eq!(&drain(&ring)[..6], &[0, 1, 2, 1, 2, 3]);
    }

    #[test]
    fn push_24bit_clamps_to_free_space_in_whole_samples() {
        let ring = RingChannel::new(16, 0);
        let mut conv = FormatConverter::new();
        let data = [1u8, 2, 3, 0].repeat(10);
        // 15 free bytes -> 5 packed samples -> 20 input bytes
        assert_eq!(conv.push_24bit_packed(&ring, &data), 20);
        assert_eq!(ring.available(), 15);
        assert_eq!(conv.push_24bit_packed(&ring, &data[20..]), 0);
    }

    #[test]
    fn push_16_to_32_clamps_and_reports_input_bytes() {
        let ring = RingChannel::new(16, 0);
        let mut conv = FormatConverter::new();
        let data = [0x01u8, 0x02].repeat(8);
        // 15 free bytes -> 3 widened samples -> 6 input bytes
        assert_eq!(conv.push_16_to_32(&ring, &data), 6);
        assert_eq!(drain(&ring), [0, 0, 1, 2].repeat(3));
    }

    #[test]
    fn detection_switches_to_msb_on_evidence() {
        let mut state = AlignmentState::default();
        state.observe(&[0x00, 0x11, 0x22, 0x33].repeat(4));
        assert_eq!(state.mode(), AlignmentMode::MsbAligned);
        assert!(state.is_confirmed());

        // confirmed: later contradicting samples are ignored
        state.observe(&[0x11, 0x22, 0x33, 0x00].repeat(4));
        assert_eq!(state.mode(), AlignmentMode::MsbAligned);
    }

    #[test]
    fn ambiguous_samples_default_to_lsb() {
        let mut state = AlignmentState::default();
        state.observe(&[0x11, 0x22, 0x33, 0x44].repeat(4));
        assert_eq!(state.mode(), AlignmentMode::LsbAligned);
    }

    #[test]
    fn silence_defers_until_timeout_then_uses_hint() {
        let mut state = AlignmentState::default();
        state.set_hint(S24Hint::MsbAligned);
        let silence = vec![0u8; 4 * 1000];
        for _ in 0..48 {
            state.observe(&silence);
        }
        assert_eq!(state.mode(), AlignmentMode::Deferred);
        assert!(!state.is_confirmed());
        assert_eq!(state.effective_mode(), AlignmentMode::MsbAligned);

        state.observe(&silence);
        assert_eq!(state.mode(), AlignmentMode::MsbAligned);
        assert!(state.is_confirmed());
    }

    #[test]
    fn silence_without_hint_resolves_to_lsb() {
        let mut state = AlignmentState::default();
        state.observe(&vec![0u8; 4 * (DEFERRED_TIMEOUT_SAMPLES + 1)]);
        assert_eq!(state.mode(), AlignmentMode::LsbAligned);
        assert!(state.is_confirmed());
    }

    #[test]
    fn deferred_then_audio_confirms_detected_mode() {
        let mut state = AlignmentState::default();
        state.observe(&[0u8; 64]);
        assert_eq!(state.mode(), AlignmentMode::Deferred);
        state.observe(&[0x00, 0x10, 0x20, 0x30].repeat(8));
        assert_eq!(state.mode(), AlignmentMode::MsbAligned);
        assert!(state.is_confirmed());
    }

    #[test]
    fn new_hint_rearms_detection() {
        let mut state = AlignmentState::default();
        state.observe(&[0x11, 0x22, 0x33, 0x00].repeat(4));
        assert_eq!(state.mode(), AlignmentMode::LsbAligned);

        state.set_hint(S24Hint::MsbAligned);
        assert!(!state.is_confirmed());
        assert_eq!(state.mode(), AlignmentMode::LsbAligned);
        state.observe(&[0x00, 0x22, 0x33, 0x44].repeat(4));
        assert_eq!(state.mode(), AlignmentMode::MsbAligned);
    }

    #[test]
    fn reset_clears_hint_and_mode() {
        let mut state = AlignmentState::default();
        state.set_hint(S24Hint::MsbAligned);
        assert_eq!(state.mode(), AlignmentMode::MsbAligned);
        state.reset();
        assert_eq!(state.mode(), AlignmentMode::Unknown);
        assert_eq!(state.hint(), AlignmentMode::Unknown);
        assert_eq!(state.effective_mode(), AlignmentMode::LsbAligned);
    }

    #[test]
    fn dsd_stereo_interleaves_groups_per_channel() {
        let src = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // left
            0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, // right
        ];
        let mut dst = [0u8; 16];
        assert_eq!(interleave_dsd(&src, &mut dst, 2, 8, None, false), 16);
        assert_eq!(
            dst,
            [
                0x01, 0x02, 0x03, 0x04, 0x11, 0x12, 0x13, 0x14, 0x05, 0x06, 0x07, 0x08, 0x15,
                0x16, 0x17, 0x18
            ]
        );
    }

    #[test]
    fn dsd_constant_blocks_alternate_in_four_byte_groups() {
        let ring = RingChannel::new(256, 0x69);
        let mut conv = FormatConverter::new();
        let planar = [[0xAAu8; 64], [0x55u8; 64]].concat();
        assert_eq!(conv.push_dsd_planar(&ring, &planar, 2, false, false), 128);
        assert_eq!(drain(&ring), [0xAA, 0xAA, 0xAA, 0xAA, 0x55, 0x55, 0x55, 0x55].repeat(16));
    }

    #[test]
    fn dsd_bit_reverse_and_byte_swap_compose() {
        let src = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80];
        let mut dst = [0u8; 8];
        interleave_dsd(&src, &mut dst, 2, 4, Some(&BIT_REVERSE), true);
        assert_eq!(dst, [0x10, 0x20, 0x40, 0x80, 0x01, 0x02, 0x04, 0x08]);
    }

    #[test]
    fn dsd_generic_path_matches_stereo_fast_path() {
        let src: Vec<u8> = (0..64u8).collect();
        for (table, swap) in [(None, false), (Some(&BIT_REVERSE), true)] {
            let mut fast = vec![0u8; 64];
            interleave_dsd(&src, &mut fast, 2, 32, table, swap);

            let mut generic = vec![0u8; 64];
            let mut out = 0;
            for g in 0..8 {
                for ch in 0..2 {
                    let at = ch * 32 + g * 4;
                    emit_group(&src[at..at + 4], &mut generic[out..out + 4], table, swap);
                    out += 4;
                }
            }
            assert_eq!(fast, generic);
        }
    }

    #[test]
    fn dsd_multichannel_round_robins_channels() {
        let src: Vec<u8> = (0..24u8).collect(); // 3 channels x 8 bytes
        let mut dst = vec![0u8; 24];
        interleave_dsd(&src, &mut dst, 3, 8, None, false);
        assert_eq!(&dst[..12], &[0, 1, 2, 3, 8, 9, 10, 11, 16, 17, 18, 19]);
        assert_eq!(&dst[12..], &[4, 5, 6, 7, 12, 13, 14, 15, 20, 21, 22, 23]);
    }

    #[test]
    fn push_dsd_planar_is_all_or_nothing() {
        let ring = RingChannel::new(16, 0x69);
        let mut conv = FormatConverter::new();
        let chunk = vec![0xAAu8; 16];
        // 15 free bytes cannot hold 16
        assert_eq!(conv.push_dsd_planar(&ring, &chunk, 2, false, false), 0);
        assert!(ring.is_empty());
        assert_eq!(conv.push_dsd_planar(&ring, &chunk[..8], 2, true, false), 8);
        assert_eq!(drain(&ring), vec![0x55u8; 8]);
    }

    #[test]
    fn push_dsd_planar_reports_only_whole_groups() {
        let ring = RingChannel::new(64, 0x69);
        let mut conv = FormatConverter::new();
        // 2 channels x 10 bytes plus one stray byte: 2 whole groups each
        let chunk: Vec<u8> = (0..21u8).collect();
        assert_eq!(conv.push_dsd_planar(&ring, &chunk, 2, false, false), 16);
        assert_eq!(
            drain(&ring),
            [0, 1, 2, 3, 10, 11, 12, 13, 4, 5, 6, 7, 14, 15, 16, 17]
        );
    }

    #[test]
    fn push_dsd_planar_splits_chunks_larger_than_staging() {
        let ring = RingChannel::new(1 << 18, 0x69);
        let mut conv = FormatConverter::new();
        let per_channel = 40_000;
        let chunk: Vec<u8> = (0..per_channel * 2).map(|i| (i % 251) as u8).collect();
        assert!(chunk.len() > STAGING_SIZE);

        let mut expected = vec![0u8; chunk.len()];
        interleave_dsd(&chunk, &mut expected, 2, per_channel, Some(&BIT_REVERSE), true);

        assert_eq!(conv.push_dsd_planar(&ring, &chunk, 2, true, true), chunk.len());
        assert_eq!(drain(&ring), expected);
    }
}
