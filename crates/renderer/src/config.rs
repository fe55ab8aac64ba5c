use std::path::PathBuf;

use stream_core::SinkEncoding;
use stream_core::config::DEFAULT_MTU;
use stream_core::format::AudioFormat;
use uuid::Uuid;

/// Encodings the output sink accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkProfile {
    /// PCM word size on the wire: 16, 24 (packed) or 32.
    pub pcm_bits: u32,
    pub dsd_msb_first: bool,
    pub dsd_little_endian: bool,
}

impl Default for SinkProfile {
    fn default() -> Self {
        Self {
            pcm_bits: 32,
            dsd_msb_first: true,
            dsd_little_endian: false,
        }
    }
}

impl SinkProfile {
    /// Wire encoding for `format`.
    ///
    /// 16-bit sources travel as 16-bit on a 16-bit sink and are widened on a
    /// 32-bit one. 24/32-bit sources need a 24 or 32-bit sink.
    pub fn encoding_for(&self, format: &AudioFormat) -> Option<SinkEncoding> {
        if format.is_dsd {
            return Some(SinkEncoding::Dsd {
                msb_first: self.dsd_msb_first,
                little_endian: self.dsd_little_endian,
            });
        }
        match (format.bit_depth, self.pcm_bits) {
            (16, 16) | (16, 32) | (24, 24) | (24, 32) | (32, 32) => {
                Some(SinkEncoding::Pcm { bits: self.pcm_bits })
            }
            _ => None,
        }
    }
}

/// Renderer identity and output settings.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub name: String,
    pub uuid: String,
    pub sink: SinkProfile,
    pub mtu: u32,
    /// Raw transport output; `None` discards the bytes.
    pub output: Option<PathBuf>,
    pub gapless: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            name: "Gapless Network Renderer".to_string(),
            uuid: default_uuid(),
            sink: SinkProfile::default(),
            mtu: DEFAULT_MTU,
            output: None,
            gapless: true,
        }
    }
}

/// One `play` run: the renderer plus the tracks to feed it.
#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub renderer: RendererConfig,
    pub uris: Vec<String>,
    /// Seek target applied once the first track starts.
    pub start: Option<String>,
}

/// Stable device id derived from the host name.
pub fn default_uuid() -> String {
    let host = gethostname::gethostname();
    let host = host.to_string_lossy();
    let host = if host.is_empty() {
        "gapless-renderer"
    } else {
        host.as_ref()
    };
    uuid_for_host(host)
}

/// Name-based (v5) UUID, so the id only depends on the host name.
fn uuid_for_host(host: &str) -> String {
    format!("uuid:{}", Uuid::new_v5(&Uuid::NAMESPACE_DNS, host.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_core::format::DsdSubFormat;

    #[test]
    fn uuid_is_stable_per_host() {
        assert_eq!(
            uuid_for_host("studio"),
            "uuid:af421c62-7500-5431-a2d2-e50cf523ff02"
        );
        assert_ne!(uuid_for_host("studio"), uuid_for_host("kitchen"));
    }

    #[test]
    fn sink_profile_maps_pcm_depths() {
        let sink32 = SinkProfile::default();
        let sink24 = SinkProfile {
            pcm_bits: 24,
            ..SinkProfile::default()
        };
        let cd = AudioFormat::pcm(44_100, 16, 2);
        let hires = AudioFormat::pcm(96_000, 24, 2);
        assert_eq!(sink32.encoding_for(&cd), Some(SinkEncoding::Pcm { bits: 32 }));
        assert_eq!(sink24.encoding_for(&cd), None);
        assert_eq!(sink24.encoding_for(&hires), Some(SinkEncoding::Pcm { bits: 24 }));
    }

    #[test]
    fn sink_profile_passes_dsd_flags() {
        let sink = SinkProfile {
            dsd_msb_first: false,
            dsd_little_endian: true,
            ..SinkProfile::default()
        };
        let dsd = AudioFormat::dsd(2_822_400, 2, DsdSubFormat::Dff);
        assert_eq!(
            sink.encoding_for(&dsd),
            Some(SinkEncoding::Dsd {
                msb_first: false,
                little_endian: true
            })
        );
    }
}
