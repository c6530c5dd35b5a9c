//! Technical description of source media and client devices.
//!
//! A [`MediaProfile`] is produced once per file by a [`MediaProbe`] and never
//! edited afterwards; re-probing yields a fresh value. A [`DeviceProfile`] is
//! supplied with every playback request.

pub mod catalog;
pub mod device;
pub mod probe;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use catalog::{CatalogError, LibraryCatalog, MediaCatalog, MediaFile, StaticCatalog};
pub use device::DeviceProfile;
pub use probe::{CachedProbe, FfprobeProbe, MediaProbe, ProbeError};

/// Technical facts about a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaProfile {
    /// Normalized container name, e.g. `mkv` or `mp4`
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub resolution: Option<Resolution>,
    /// Overall bitrate in kbit/s
    pub bitrate_kbps: Option<u64>,
    pub duration_ms: Option<u64>,
    /// PQ or HLG transfer characteristics
    #[serde(default)]
    pub hdr: bool,
}

impl MediaProfile {
    /// Builds a profile with normalized container and codec names.
    pub fn new(
        container: &str,
        video_codec: Option<&str>,
        audio_codec: Option<&str>,
    ) -> Self {
        Self {
            container: normalize_container(container),
            video_codec: video_codec.map(normalize_codec),
            audio_codec: audio_codec.map(normalize_codec),
            resolution: None,
            bitrate_kbps: None,
            duration_ms: None,
            hdr: false,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }

    pub fn with_bitrate(mut self, kbps: u64) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_hdr(mut self, hdr: bool) -> Self {
        self.hdr = hdr;
        self
    }

    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }

    pub fn is_audio_only(&self) -> bool {
        !self.has_video() && self.has_audio()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ResolutionRepr")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResolutionRepr {
    Label(String),
    Size { width: u32, height: u32 },
}

impl TryFrom<ResolutionRepr> for Resolution {
    type Error = String;

    fn try_from(repr: ResolutionRepr) -> Result<Self, Self::Error> {
        match repr {
            ResolutionRepr::Label(label) => {
                Resolution::from_label(&label).ok_or_else(|| format!("unknown resolution '{label}'"))
            }
            ResolutionRepr::Size { width, height } => Ok(Resolution::new(width, height)),
        }
    }
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parses `480p`, `720p`, `1080p`, `1440p`, `4k`/`2160p` or `WxH`.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        let known = match label.as_str() {
            "480p" => Some(Self::new(854, 480)),
            "720p" => Some(Self::new(1280, 720)),
            "1080p" => Some(Self::new(1920, 1080)),
            "1440p" => Some(Self::new(2560, 1440)),
            "4k" | "2160p" => Some(Self::new(3840, 2160)),
            _ => None,
        };
        if known.is_some() {
            return known;
        }

        let (w, h) = label.split_once('x')?;
        let width = w.parse().ok().filter(|w| *w > 0)?;
        let height = h.parse().ok().filter(|h| *h > 0)?;
        Some(Self::new(width, height))
    }

    pub fn fits_within(&self, max: &Resolution) -> bool {
        self.width <= max.width && self.height <= max.height
    }

    /// Largest size not exceeding `max` with the same aspect ratio.
    ///
    /// Never upscales. Dimensions are rounded down to even numbers so that
    /// 4:2:0 encoders accept them.
    pub fn fit_within(&self, max: &Resolution) -> Resolution {
        if self.fits_within(max) || self.width == 0 || self.height == 0 {
            return *self;
        }

        let scale = f64::min(
            max.width as f64 / self.width as f64,
            max.height as f64 / self.height as f64,
        );
        let even = |v: f64| ((v.floor() as u32) & !1).max(2);

        Resolution::new(
            even(self.width as f64 * scale),
            even(self.height as f64 * scale),
        )
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Maps container aliases onto one canonical name.
pub fn normalize_container(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "matroska" => "mkv".to_string(),
        "mpeg4" | "m4v" => "mp4".to_string(),
        "quicktime" => "mov".to_string(),
        "mpegts" | "m2ts" => "ts".to_string(),
        _ => name,
    }
}

/// Maps codec aliases onto one canonical name.
pub fn normalize_codec(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "h265" | "hev1" | "hvc1" => "hevc".to_string(),
        "avc" | "avc1" | "h.264" => "h264".to_string(),
        "vp09" => "vp9".to_string(),
        "av01" => "av1".to_string(),
        "mp4a" => "aac".to_string(),
        "eac3" | "e-ac3" => "eac3".to_string(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_labels() {
        assert_eq!(Resolution::from_label("720p"), Some(Resolution::new(1280, 720)));
        assert_eq!(Resolution::from_label("4K"), Some(Resolution::new(3840, 2160)));
        assert_eq!(Resolution::from_label("2160p"), Resolution::from_label("4k"));
        assert_eq!(Resolution::from_label("640x360"), Some(Resolution::new(640, 360)));
        assert_eq!(Resolution::from_label("0x360"), None);
        assert_eq!(Resolution::from_label("huge"), None);
    }

    #[test]
    fn test_fit_within_downscales_preserving_aspect() {
        let source = Resolution::new(3840, 2160);
        let fitted = source.fit_within(&Resolution::new(1920, 1080));
        assert_eq!(fitted, Resolution::new(1920, 1080));

        // Ultra-wide: width is the binding constraint
        let wide = Resolution::new(2560, 1080);
        let fitted = wide.fit_within(&Resolution::new(1280, 720));
        assert_eq!(fitted.width, 1280);
        assert_eq!(fitted.height, 540);
    }

    #[test]
    fn test_fit_within_never_upscales() {
        let source = Resolution::new(640, 360);
        assert_eq!(source.fit_within(&Resolution::new(1920, 1080)), source);
    }

    #[test]
    fn test_fit_within_produces_even_dimensions() {
        let source = Resolution::new(1921, 1081);
        let fitted = source.fit_within(&Resolution::new(1001, 1001));
        assert_eq!(fitted.width % 2, 0);
        assert_eq!(fitted.height % 2, 0);
        assert!(fitted.fits_within(&Resolution::new(1001, 1001)));
    }

    #[test]
    fn test_aliases() {
        assert_eq!(normalize_container("Matroska"), "mkv");
        assert_eq!(normalize_container("MPEG4"), "mp4");
        assert_eq!(normalize_codec("H265"), "hevc");
        assert_eq!(normalize_codec("avc"), "h264");
        assert_eq!(normalize_codec("opus"), "opus");
    }

    #[test]
    fn test_resolution_deserializes_from_label_or_object() {
        let r: Resolution = serde_json::from_str("\"1080p\"").unwrap();
        assert_eq!(r, Resolution::new(1920, 1080));
        let r: Resolution = serde_json::from_str(r#"{"width":640,"height":480}"#).unwrap();
        assert_eq!(r, Resolution::new(640, 480));
        assert!(serde_json::from_str::<Resolution>("\"bogus\"").is_err());
    }
}
