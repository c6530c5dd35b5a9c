//! Client device capabilities.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{Resolution, normalize_codec, normalize_container};

/// Capability snapshot supplied with a playback request.
///
/// Optional limits default to "unlimited" and optional feature flags to
/// "unsupported". Codec and container names are normalized on construction
/// so comparisons against a [`MediaProfile`](super::MediaProfile) are exact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawDeviceProfile")]
pub struct DeviceProfile {
    pub name: Option<String>,
    pub video_codecs: BTreeSet<String>,
    pub audio_codecs: BTreeSet<String>,
    pub containers: BTreeSet<String>,
    pub max_resolution: Option<Resolution>,
    /// Upper bound in kbit/s
    pub max_bitrate_kbps: Option<u64>,
    pub supports_hdr: bool,
    pub supports_hevc: bool,
    pub supports_av1: bool,
    pub preferred_container: Option<String>,
    pub preferred_video_codec: Option<String>,
    pub preferred_audio_codec: Option<String>,
}

/// Wire form; `codecs` is a shorthand that feeds both codec sets.
#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDeviceProfile {
    name: Option<String>,
    codecs: Vec<String>,
    video_codecs: Vec<String>,
    audio_codecs: Vec<String>,
    containers: Vec<String>,
    max_resolution: Option<Resolution>,
    max_bitrate_kbps: Option<u64>,
    supports_hdr: bool,
    supports_hevc: bool,
    supports_av1: bool,
    preferred_container: Option<String>,
    preferred_video_codec: Option<String>,
    preferred_audio_codec: Option<String>,
}

impl From<RawDeviceProfile> for DeviceProfile {
    fn from(raw: RawDeviceProfile) -> Self {
        let mut profile = DeviceProfile::new()
            .with_containers(raw.containers)
            .with_video_codecs(raw.video_codecs.iter().chain(&raw.codecs))
            .with_audio_codecs(raw.audio_codecs.iter().chain(&raw.codecs));
        profile.name = raw.name;
        profile.max_resolution = raw.max_resolution;
        profile.max_bitrate_kbps = raw.max_bitrate_kbps;
        profile.supports_hdr = raw.supports_hdr;
        profile.supports_hevc = raw.supports_hevc;
        profile.supports_av1 = raw.supports_av1;
        profile.preferred_container = raw.preferred_container.as_deref().map(normalize_container);
        profile.preferred_video_codec = raw.preferred_video_codec.as_deref().map(normalize_codec);
        profile.preferred_audio_codec = raw.preferred_audio_codec.as_deref().map(normalize_codec);
        profile
    }
}

impl DeviceProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_containers<I, S>(mut self, containers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.containers
            .extend(containers.into_iter().map(|c| normalize_container(c.as_ref())));
        self
    }

    pub fn with_video_codecs<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.video_codecs
            .extend(codecs.into_iter().map(|c| normalize_codec(c.as_ref())));
        self
    }

    pub fn with_audio_codecs<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.audio_codecs
            .extend(codecs.into_iter().map(|c| normalize_codec(c.as_ref())));
        self
    }

    /// Adds every codec to both the video and the audio set.
    pub fn with_codecs<I, S>(self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S> + Clone,
        S: AsRef<str>,
    {
        self.with_video_codecs(codecs.clone()).with_audio_codecs(codecs)
    }

    pub fn with_max_resolution(mut self, resolution: Resolution) -> Self {
        self.max_resolution = Some(resolution);
        self
    }

    pub fn with_max_bitrate(mut self, kbps: u64) -> Self {
        self.max_bitrate_kbps = Some(kbps);
        self
    }

    pub fn supports_container(&self, container: &str) -> bool {
        self.containers.contains(&normalize_container(container))
    }

    /// Listed codecs, plus HEVC and AV1 when the matching flag is set.
    pub fn supports_video_codec(&self, codec: &str) -> bool {
        let codec = normalize_codec(codec);
        if self.video_codecs.contains(&codec) {
            return true;
        }
        match codec.as_str() {
            "hevc" => self.supports_hevc,
            "av1" => self.supports_av1,
            _ => false,
        }
    }

    pub fn supports_audio_codec(&self, codec: &str) -> bool {
        self.audio_codecs.contains(&normalize_codec(codec))
    }

    pub fn accepts_resolution(&self, resolution: &Resolution) -> bool {
        self.max_resolution
            .map(|max| resolution.fits_within(&max))
            .unwrap_or(true)
    }

    pub fn accepts_bitrate(&self, kbps: u64) -> bool {
        self.max_bitrate_kbps.map(|max| kbps <= max).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_default_to_capable_limits() {
        let profile: DeviceProfile = serde_json::from_str(r#"{"containers":["mp4"]}"#).unwrap();

        assert!(profile.accepts_bitrate(u64::MAX));
        assert!(profile.accepts_resolution(&Resolution::new(7680, 4320)));
        assert!(!profile.supports_hdr);
        assert!(!profile.supports_hevc);
        assert!(profile.video_codecs.is_empty());
    }

    #[test]
    fn test_codecs_shorthand_feeds_both_sets() {
        let profile: DeviceProfile = serde_json::from_str(
            r#"{"containers":["MP4"],"codecs":["H264","aac"],"max_resolution":"720p"}"#,
        )
        .unwrap();

        assert!(profile.supports_container("mp4"));
        assert!(profile.supports_video_codec("h264"));
        assert!(profile.supports_audio_codec("aac"));
        assert_eq!(profile.max_resolution, Some(Resolution::new(1280, 720)));
    }

    #[test]
    fn test_hevc_and_av1_flags() {
        let mut profile = DeviceProfile::new().with_video_codecs(["h264"]);
        assert!(!profile.supports_video_codec("hevc"));

        profile.supports_hevc = true;
        assert!(profile.supports_video_codec("h265"));
        assert!(!profile.supports_video_codec("av1"));

        profile.supports_av1 = true;
        assert!(profile.supports_video_codec("av1"));
    }

    #[test]
    fn test_container_aliases_match() {
        let profile = DeviceProfile::new().with_containers(["matroska"]);
        assert!(profile.supports_container("mkv"));
        assert!(!profile.supports_container("mp4"));
    }
}
