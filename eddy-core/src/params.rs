//! Canonical transcode parameters and the content hash derived from them.
//!
//! The canonical form is a sorted list of `key=value` lines behind a version
//! header, with line breaks and backslashes in values escaped. Names are normalized before rendering, so requests that differ
//! only in spelling ("H265" vs "hevc") or field order produce byte-identical
//! input to the digest.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::media::{Resolution, normalize_codec, normalize_container};

/// Bumped whenever the canonical rendering changes.
const CANONICAL_VERSION: &str = "eddy-params/2";

/// Adaptive streaming format produced by the package stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingFormat {
    #[default]
    Dash,
    Hls,
}

impl StreamingFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamingFormat::Dash => "dash",
            StreamingFormat::Hls => "hls",
        }
    }

    /// File name of the top-level manifest inside a content directory.
    pub fn manifest_name(&self) -> &'static str {
        match self {
            StreamingFormat::Dash => "manifest.mpd",
            StreamingFormat::Hls => "playlist.m3u8",
        }
    }
}

impl fmt::Display for StreamingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dash" | "mpd" => Ok(StreamingFormat::Dash),
            "hls" | "m3u8" => Ok(StreamingFormat::Hls),
            other => Err(format!("unknown streaming format '{other}'")),
        }
    }
}

/// Target of a remux or transcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeParams {
    /// Identity of the source media
    pub media_id: String,
    pub container: String,
    pub format: StreamingFormat,
    /// None for audio-only output
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// Stream-copy the source video instead of encoding it
    #[serde(default)]
    pub copy_video: bool,
    #[serde(default)]
    pub copy_audio: bool,
    /// None keeps the source size
    pub resolution: Option<Resolution>,
    pub video_bitrate_kbps: Option<u64>,
    pub audio_bitrate_kbps: Option<u64>,
    /// Start position within the source
    #[serde(default)]
    pub seek_offset_ms: u64,
}

impl TranscodeParams {
    pub fn new(media_id: impl Into<String>, container: &str, format: StreamingFormat) -> Self {
        Self {
            media_id: media_id.into(),
            container: normalize_container(container),
            format,
            video_codec: None,
            audio_codec: None,
            copy_video: false,
            copy_audio: false,
            resolution: None,
            video_bitrate_kbps: None,
            audio_bitrate_kbps: None,
            seek_offset_ms: 0,
        }
    }

    pub fn with_video(mut self, codec: &str, copy: bool) -> Self {
        self.video_codec = Some(normalize_codec(codec));
        self.copy_video = copy;
        self
    }

    pub fn with_audio(mut self, codec: &str, copy: bool) -> Self {
        self.audio_codec = Some(normalize_codec(codec));
        self.copy_audio = copy;
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_bitrates(mut self, video_kbps: Option<u64>, audio_kbps: Option<u64>) -> Self {
        self.video_bitrate_kbps = video_kbps;
        self.audio_bitrate_kbps = audio_kbps;
        self
    }

    pub fn with_seek_offset(mut self, offset_ms: u64) -> Self {
        self.seek_offset_ms = offset_ms;
        self
    }

    /// True when neither stream is re-encoded.
    pub fn is_remux(&self) -> bool {
        let video_copied = self.video_codec.is_none() || self.copy_video;
        let audio_copied = self.audio_codec.is_none() || self.copy_audio;
        video_copied && audio_copied
    }

    /// Deterministic serialization used as the hash input.
    pub fn canonical(&self) -> String {
        let opt = |v: &Option<String>| v.as_deref().map(normalize_codec).unwrap_or_default();
        let num = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_default();

        let mut fields = [
            ("media_id", self.media_id.trim().to_string()),
            ("container", normalize_container(&self.container)),
            ("format", self.format.as_str().to_string()),
            ("video_codec", opt(&self.video_codec)),
            ("audio_codec", opt(&self.audio_codec)),
            ("copy_video", (self.copy_video && self.video_codec.is_some()).to_string()),
            ("copy_audio", (self.copy_audio && self.audio_codec.is_some()).to_string()),
            (
                "resolution",
                self.resolution.map(|r| r.to_string()).unwrap_or_default(),
            ),
            ("video_bitrate", num(self.video_bitrate_kbps)),
            ("audio_bitrate", num(self.audio_bitrate_kbps)),
            ("seek_offset_ms", self.seek_offset_ms.to_string()),
        ];
        fields.sort_by_key(|(key, _)| *key);

        let mut out = String::from(CANONICAL_VERSION);
        for (key, value) in fields {
            out.push('\n');
            out.push_str(key);
            out.push('=');
            push_escaped(&mut out, &value);
        }
        out
    }

    pub fn content_hash(&self) -> ContentHash {
        let digest = Sha1::digest(self.canonical().as_bytes());
        ContentHash(hex::encode(digest))
    }
}

/// Length of a hex-encoded SHA-1 digest.
pub const HASH_LEN: usize = 40;

/// Validated storage key: 40 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

/// Rejected content hash string.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("Invalid content hash: {0:?}")]
pub struct InvalidHash(pub String);

impl ContentHash {
    pub fn parse(value: &str) -> Result<Self, InvalidHash> {
        let valid = value.len() == HASH_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(InvalidHash(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two directory levels an entry is sharded under.
    pub fn shards(&self) -> (&str, &str) {
        (&self.0[0..2], &self.0[2..4])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ContentHash::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl FromStr for ContentHash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentHash::parse(s)
    }
}

/// Keeps one field per line whatever the value contains.
fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}
