use std::sync::Arc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::hardware::{HardwareCapabilities, HardwareTier};

/// Encoder used when the requested codec is not recognized
pub const DEFAULT_SOFTWARE_ENCODER: &str = "libx264";
const DEFAULT_CODEC: &str = "h264";

/// Canonical codec names and the spellings that collapse onto them
const CODEC_ALIASES: &[(&str, &[&str])] = &[
    ("h264", &["h264", "x264", "h.264", "avc", "libx264"]),
    ("hevc", &["hevc", "x265", "h265", "h.265", "libx265"]),
    ("av1", &["av1", "libaom", "libaom-av1", "aom", "svt-av1"]),
];

/// Whether the chosen encoder runs on a GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccelerationKind {
    Hardware,
    Software,
}

/// Concrete encoder picked for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderResolution {
    pub requested_codec: String,
    /// Canonical codec the encoder produces (differs from the request when the fallback codec was used)
    pub effective_codec: String,
    pub hardware_tier: HardwareTier,
    pub resolved_encoder_id: String,
    pub acceleration_kind: AccelerationKind,
}

/// Collapse a user-supplied codec name onto its canonical form
pub fn canonical_codec(name: &str) -> Option<&'static str> {
    let needle = name.trim().to_lowercase();
    CODEC_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&needle.as_str()))
        .map(|(canonical, _)| *canonical)
}

/// GPU encoder for a canonical codec on a tier, if the vendor has one
pub fn hardware_encoder(tier: HardwareTier, codec: &str) -> Option<&'static str> {
    match (tier, codec) {
        (HardwareTier::Nvidia, "h264") => Some("h264_nvenc"),
        (HardwareTier::Nvidia, "hevc") => Some("hevc_nvenc"),
        (HardwareTier::Nvidia, "av1") => Some("av1_nvenc"),
        (HardwareTier::Intel, "h264") => Some("h264_qsv"),
        (HardwareTier::Intel, "hevc") => Some("hevc_qsv"),
        (HardwareTier::Intel, "av1") => Some("av1_qsv"),
        (HardwareTier::Amd, "h264") => Some("h264_amf"),
        (HardwareTier::Amd, "hevc") => Some("hevc_amf"),
        _ => None,
    }
}

/// CPU encoder for a canonical codec
pub fn software_encoder(codec: &str) -> Option<&'static str> {
    match codec {
        "h264" => Some("libx264"),
        "hevc" => Some("libx265"),
        "av1" => Some("libaom-av1"),
        _ => None,
    }
}

/// Maps a requested codec to an encoder the local toolchain can run
#[derive(Clone)]
pub struct EncoderResolver {
    capabilities: Arc<dyn HardwareCapabilities>,
}

impl EncoderResolver {
    pub fn new(capabilities: Arc<dyn HardwareCapabilities>) -> Self {
        Self { capabilities }
    }

    pub fn hardware_tier(&self) -> HardwareTier {
        self.capabilities.tier()
    }

    /// Resolve against the detected hardware tier
    pub fn resolve(&self, requested_codec: &str, fallback_codec: Option<&str>) -> EncoderResolution {
        self.resolve_for_tier(requested_codec, self.capabilities.tier(), fallback_codec)
    }

    /// Hardware encoder for the request, then hardware encoder for the fallback
    /// codec, then the software encoder. Always returns a usable resolution.
    pub fn resolve_for_tier(
        &self,
        requested_codec: &str,
        tier: HardwareTier,
        fallback_codec: Option<&str>,
    ) -> EncoderResolution {
        let canonical = canonical_codec(requested_codec);

        let resolution = |codec: &str, encoder: &str, kind: AccelerationKind| EncoderResolution {
            requested_codec: requested_codec.to_string(),
            effective_codec: codec.to_string(),
            hardware_tier: tier,
            resolved_encoder_id: encoder.to_string(),
            acceleration_kind: kind,
        };

        if let Some(codec) = canonical {
            if let Some(encoder) = hardware_encoder(tier, codec) {
                if self.capabilities.supports(encoder) {
                    info!("Using {} GPU encoder {}", tier, encoder);
                    return resolution(codec, encoder, AccelerationKind::Hardware);
                }
                warn!("GPU encoder {} not available. Trying fallback encoder.", encoder);
            }
        }

        if let Some(fallback) = fallback_codec.and_then(canonical_codec) {
            if let Some(encoder) = hardware_encoder(tier, fallback) {
                if self.capabilities.supports(encoder) {
                    warn!(
                        "{} on {} is unavailable, using fallback GPU encoder {}",
                        requested_codec, tier, encoder
                    );
                    return resolution(fallback, encoder, AccelerationKind::Hardware);
                }
                warn!("Fallback GPU encoder {} not available. Falling back to CPU encoding.", encoder);
            }
        }

        match canonical.and_then(|codec| software_encoder(codec).map(|enc| (codec, enc))) {
            Some((codec, encoder)) => resolution(codec, encoder, AccelerationKind::Software),
            None => {
                warn!(
                    "Unsupported encoder: {}. Falling back to {}.",
                    requested_codec, DEFAULT_SOFTWARE_ENCODER
                );
                resolution(DEFAULT_CODEC, DEFAULT_SOFTWARE_ENCODER, AccelerationKind::Software)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::StaticCapabilities;
    use proptest::prelude::*;

    fn resolver(tier: HardwareTier, encoders: &[&str]) -> EncoderResolver {
        EncoderResolver::new(Arc::new(StaticCapabilities::new(tier, encoders.iter().copied())))
    }

    #[test]
    fn test_alias_normalization() {
        assert_eq!(canonical_codec("x264"), Some("h264"));
        assert_eq!(canonical_codec(" H.264 "), Some("h264"));
        assert_eq!(canonical_codec("AVC"), Some("h264"));
        assert_eq!(canonical_codec("x265"), Some("hevc"));
        assert_eq!(canonical_codec("H.265"), Some("hevc"));
        assert_eq!(canonical_codec("av1"), Some("av1"));
        assert_eq!(canonical_codec("vp9"), None);
    }

    #[test]
    fn test_hardware_encoder_selected_when_supported() {
        let r = resolver(HardwareTier::Nvidia, &["h264_nvenc", "libx264"]);
        let res = r.resolve("x264", None);
        assert_eq!(res.resolved_encoder_id, "h264_nvenc");
        assert_eq!(res.acceleration_kind, AccelerationKind::Hardware);
        assert_eq!(res.effective_codec, "h264");
        assert_eq!(res.requested_codec, "x264");
    }

    #[test]
    fn test_unsupported_nvenc_without_fallback_uses_libx264() {
        let r = resolver(HardwareTier::Nvidia, &["libx264"]);
        let res = r.resolve("h264", None);
        assert_eq!(res.resolved_encoder_id, "libx264");
        assert_eq!(res.acceleration_kind, AccelerationKind::Software);
        assert_eq!(res.hardware_tier, HardwareTier::Nvidia);
    }

    #[test]
    fn test_fallback_codec_on_hardware() {
        // AMD has no AV1 encoder in the table, HEVC fallback is available
        let r = resolver(HardwareTier::Amd, &["hevc_amf"]);
        let res = r.resolve("av1", Some("x265"));
        assert_eq!(res.resolved_encoder_id, "hevc_amf");
        assert_eq!(res.effective_codec, "hevc");
        assert_eq!(res.acceleration_kind, AccelerationKind::Hardware);
    }

    #[test]
    fn test_unsupported_fallback_goes_to_software_of_requested_codec() {
        let r = resolver(HardwareTier::Intel, &[]);
        let res = r.resolve("av1", Some("hevc"));
        assert_eq!(res.resolved_encoder_id, "libaom-av1");
        assert_eq!(res.effective_codec, "av1");
        assert_eq!(res.acceleration_kind, AccelerationKind::Software);
    }

    #[test]
    fn test_no_gpu_ignores_fallback() {
        let r = resolver(HardwareTier::None, &["hevc_nvenc"]);
        let res = r.resolve("hevc", Some("h264"));
        assert_eq!(res.resolved_encoder_id, "libx265");
        assert_eq!(res.acceleration_kind, AccelerationKind::Software);
    }

    #[test]
    fn test_unknown_codec_uses_default() {
        let r = resolver(HardwareTier::Nvidia, &["h264_nvenc"]);
        let res = r.resolve("prores", None);
        assert_eq!(res.resolved_encoder_id, DEFAULT_SOFTWARE_ENCODER);
        assert_eq!(res.effective_codec, "h264");
        assert_eq!(res.acceleration_kind, AccelerationKind::Software);
    }

    fn tier() -> impl Strategy<Value = HardwareTier> {
        prop_oneof![
            Just(HardwareTier::None),
            Just(HardwareTier::Nvidia),
            Just(HardwareTier::Intel),
            Just(HardwareTier::Amd),
        ]
    }

    fn codec_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("h264".to_string()),
            Just("x264".to_string()),
            Just("avc".to_string()),
            Just("hevc".to_string()),
            Just("x265".to_string()),
            Just("av1".to_string()),
            "[a-zA-Z0-9.\\- ]{0,12}",
        ]
    }

    const ALL_HW: &[&str] = &[
        "h264_nvenc", "hevc_nvenc", "av1_nvenc",
        "h264_qsv", "hevc_qsv", "av1_qsv",
        "h264_amf", "hevc_amf",
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Every codec/tier combination yields a non-empty encoder id
        #[test]
        fn test_resolution_is_never_empty(
            codec in codec_name(),
            fallback in proptest::option::of(codec_name()),
            tier in tier(),
            supported in proptest::collection::vec(proptest::sample::select(ALL_HW), 0..8),
        ) {
            let r = resolver(tier, &supported);
            let res = r.resolve_for_tier(&codec, tier, fallback.as_deref());
            prop_assert!(!res.resolved_encoder_id.is_empty());
            prop_assert!(canonical_codec(&res.effective_codec).is_some());
            if res.acceleration_kind == AccelerationKind::Hardware {
                prop_assert!(supported.contains(&res.resolved_encoder_id.as_str()));
                prop_assert!(tier != HardwareTier::None);
            }
        }

        /// An unsupported primary encoder never gets selected
        #[test]
        fn test_unsupported_primary_falls_through(
            codec in prop_oneof![Just("h264"), Just("hevc")],
            fallback in proptest::option::of(prop_oneof![Just("h264"), Just("hevc"), Just("av1")]),
            tier in prop_oneof![Just(HardwareTier::Nvidia), Just(HardwareTier::Intel), Just(HardwareTier::Amd)],
            fallback_supported in any::<bool>(),
        ) {
            let primary = hardware_encoder(tier, codec).unwrap();
            let fallback_hw = fallback.and_then(|f| hardware_encoder(tier, f));
            let mut supported = Vec::new();
            if fallback_supported {
                if let Some(enc) = fallback_hw {
                    if enc != primary {
                        supported.push(enc);
                    }
                }
            }

            let res = resolver(tier, &supported).resolve(codec, fallback);
            prop_assert_ne!(res.resolved_encoder_id.as_str(), primary);
            match supported.first() {
                Some(enc) => {
                    prop_assert_eq!(res.resolved_encoder_id.as_str(), *enc);
                    prop_assert_eq!(res.acceleration_kind, AccelerationKind::Hardware);
                }
                None => {
                    prop_assert_eq!(res.resolved_encoder_id.as_str(), software_encoder(codec).unwrap());
                    prop_assert_eq!(res.acceleration_kind, AccelerationKind::Software);
                }
            }
        }
    }
}
