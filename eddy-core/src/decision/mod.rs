//! Decides how a media file reaches a client: as-is, repackaged or re-encoded.
//!
//! Deciding is cheap. It never spawns work; it only computes the target
//! parameters and looks their hash up in the content store so callers can skip
//! session creation when the output already exists.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::content::{ContentStore, ContentUrls};
use crate::media::{DeviceProfile, MediaProfile};
use crate::params::{ContentHash, StreamingFormat, TranscodeParams};
use crate::provider::{ProviderError, ProviderRegistry};

/// Video encoders tried when the device states no usable preference.
const VIDEO_FALLBACKS: [&str; 4] = ["h264", "hevc", "vp9", "av1"];
const AUDIO_FALLBACKS: [&str; 4] = ["aac", "opus", "mp3", "ac3"];
const CONTAINER_FALLBACKS: [&str; 5] = ["mp4", "mkv", "webm", "ts", "mov"];

/// Intermediate container when direct-play media is packaged for streaming.
const PASSTHROUGH_CONTAINER: &str = "mp4";

/// Share of the device bitrate limit given to video; audio gets the rest.
const VIDEO_BITRATE_SHARE: u64 = 80;

/// Errors raised while deciding.
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    /// The profile has neither a video nor an audio stream
    #[error("Media '{media_id}' has no playable streams")]
    NoStreams { media_id: String },

    #[error("Media '{media_id}' has an unknown container")]
    UnknownContainer { media_id: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// How the media reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    /// Original bytes, untouched
    Direct,
    /// Streams copied into another container
    Remux,
    /// At least one stream re-encoded
    Transcode,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Direct => "direct",
            DecisionKind::Remux => "remux",
            DecisionKind::Transcode => "transcode",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`DecisionEngine::decide`]. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackDecision {
    pub kind: DecisionKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<TranscodeParams>,
    /// Set when the output is already in the content store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
}

impl PlaybackDecision {
    /// True when the store already holds the output and no session is needed.
    pub fn is_cached(&self) -> bool {
        self.content_hash.is_some()
    }
}

/// Per-request knobs that are not part of either profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecideOptions {
    /// Adaptive format; the engine default when unset
    pub format: Option<StreamingFormat>,
    pub seek_offset_ms: u64,
}

/// Compatibility negotiation between a media profile and a device profile.
pub struct DecisionEngine {
    registry: Arc<ProviderRegistry>,
    store: Arc<ContentStore>,
    urls: ContentUrls,
    default_format: StreamingFormat,
}

impl DecisionEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<ContentStore>,
        urls: ContentUrls,
        default_format: StreamingFormat,
    ) -> Self {
        Self {
            registry,
            store,
            urls,
            default_format,
        }
    }

    pub fn default_format(&self) -> StreamingFormat {
        self.default_format
    }

    /// Chooses direct play, remux or transcode.
    ///
    /// Remux and transcode decisions carry their target parameters. When the
    /// output is already committed the decision also carries its hash and URL,
    /// and no provider check is made.
    ///
    /// # Errors
    ///
    /// - `DecisionError::NoStreams` / `UnknownContainer` - Unusable media profile
    /// - `DecisionError::Provider` - No registered provider can produce the target
    pub async fn decide(
        &self,
        media_id: &str,
        media: &MediaProfile,
        device: &DeviceProfile,
        options: DecideOptions,
    ) -> Result<PlaybackDecision, DecisionError> {
        let format = options.format.unwrap_or(self.default_format);
        let (kind, reason, params) = plan(media_id, media, device, format)?;

        match params {
            Some(params) => {
                let params = params.with_seek_offset(options.seek_offset_ms);
                self.resolve(kind, reason, params, format).await
            }
            None => {
                debug!(media_id, "Direct play");
                Ok(PlaybackDecision {
                    kind,
                    reason,
                    params: None,
                    content_hash: None,
                    content_url: None,
                })
            }
        }
    }

    /// Like [`decide`](Self::decide) but always yields parameters for an
    /// adaptive stream. Direct-play media is packaged with both streams copied.
    ///
    /// # Errors
    ///
    /// Same as [`decide`](Self::decide).
    pub async fn decide_stream(
        &self,
        media_id: &str,
        media: &MediaProfile,
        device: &DeviceProfile,
        options: DecideOptions,
    ) -> Result<(PlaybackDecision, TranscodeParams), DecisionError> {
        let format = options.format.unwrap_or(self.default_format);
        let (kind, reason, params) = plan(media_id, media, device, format)?;
        let params = params
            .unwrap_or_else(|| passthrough_params(media_id, media, PASSTHROUGH_CONTAINER, format))
            .with_seek_offset(options.seek_offset_ms);

        let decision = self.resolve(kind, reason, params.clone(), format).await?;
        Ok((decision, params))
    }

    /// Looks the params up in the store, then checks a provider can produce
    /// them when they are not stored yet.
    async fn resolve(
        &self,
        kind: DecisionKind,
        reason: String,
        params: TranscodeParams,
        format: StreamingFormat,
    ) -> Result<PlaybackDecision, DecisionError> {
        let hash = self.store.hash(&params);
        if self.store.exists(&hash).await {
            debug!(media_id = %params.media_id, %kind, %hash, "Output already stored");
            let url = self.urls.manifest_url(&hash, format);
            return Ok(PlaybackDecision {
                kind,
                reason,
                params: Some(params),
                content_hash: Some(hash),
                content_url: Some(url),
            });
        }

        self.registry.find_capable(&params)?;
        debug!(media_id = %params.media_id, %kind, %hash, reason = %reason, "Work required");
        Ok(PlaybackDecision {
            kind,
            reason,
            params: Some(params),
            content_hash: None,
            content_url: None,
        })
    }
}

/// Parameters that package the source unchanged, streams copied.
pub fn passthrough_params(
    media_id: &str,
    media: &MediaProfile,
    container: &str,
    format: StreamingFormat,
) -> TranscodeParams {
    let mut params = TranscodeParams::new(media_id, container, format);
    if let Some(video) = &media.video_codec {
        params = params.with_video(video, true);
    }
    if let Some(audio) = &media.audio_codec {
        params = params.with_audio(audio, true);
    }
    params
}

type Plan = (DecisionKind, String, Option<TranscodeParams>);

fn plan(
    media_id: &str,
    media: &MediaProfile,
    device: &DeviceProfile,
    format: StreamingFormat,
) -> Result<Plan, DecisionError> {
    if !media.has_video() && !media.has_audio() {
        return Err(DecisionError::NoStreams {
            media_id: media_id.to_string(),
        });
    }
    if media.container.is_empty() {
        return Err(DecisionError::UnknownContainer {
            media_id: media_id.to_string(),
        });
    }

    let container_ok = device.supports_container(&media.container);
    let video_codec_ok = media
        .video_codec
        .as_deref()
        .is_none_or(|c| device.supports_video_codec(c));
    let audio_codec_ok = media
        .audio_codec
        .as_deref()
        .is_none_or(|c| device.supports_audio_codec(c));
    let resolution_ok = media
        .resolution
        .is_none_or(|r| device.accepts_resolution(&r));
    let bitrate_ok = media.bitrate_kbps.is_none_or(|b| device.accepts_bitrate(b));
    let hdr_ok = !media.has_video() || !media.hdr || device.supports_hdr;

    let mut problems = Vec::new();
    if !container_ok {
        problems.push(format!("container {} not supported", media.container));
    }
    if let (false, Some(codec)) = (video_codec_ok, &media.video_codec) {
        problems.push(format!("video codec {codec} not supported"));
    }
    if let (false, Some(codec)) = (audio_codec_ok, &media.audio_codec) {
        problems.push(format!("audio codec {codec} not supported"));
    }
    if let (false, Some(resolution), Some(max)) =
        (resolution_ok, media.resolution, device.max_resolution)
    {
        problems.push(format!("resolution {resolution} exceeds {max}"));
    }
    if let (false, Some(bitrate), Some(max)) =
        (bitrate_ok, media.bitrate_kbps, device.max_bitrate_kbps)
    {
        problems.push(format!("bitrate {bitrate} kbps exceeds {max} kbps"));
    }
    if !hdr_ok {
        problems.push("HDR not supported".to_string());
    }

    if problems.is_empty() {
        return Ok((
            DecisionKind::Direct,
            "Media is compatible with the device".to_string(),
            None,
        ));
    }
    let reason = problems.join("; ");

    let streams_ok = video_codec_ok && audio_codec_ok && resolution_ok && bitrate_ok && hdr_ok;
    if streams_ok {
        let video = media.video_codec.as_deref();
        let audio = media.audio_codec.as_deref();
        let container = choose_container(device, video, audio);
        let params = passthrough_params(media_id, media, &container, format);
        return Ok((DecisionKind::Remux, reason, Some(params)));
    }

    let mut params = TranscodeParams::new(media_id, "mp4", format);

    // Video is copied only when nothing about it needs to change
    let video_target = media.video_codec.as_deref().map(|source| {
        let copy = video_codec_ok && resolution_ok && bitrate_ok && hdr_ok;
        if copy {
            (source.to_string(), true)
        } else {
            (choose_video_codec(device), false)
        }
    });
    // A copied stream keeps its own bitrate, so audio is re-encoded too when
    // the total has to come down
    let audio_target = media.audio_codec.as_deref().map(|source| {
        if audio_codec_ok && bitrate_ok {
            (source.to_string(), true)
        } else {
            (choose_audio_codec(device), false)
        }
    });

    if let Some((codec, copy)) = &video_target {
        params = params.with_video(codec, *copy);
        if !copy {
            if let (Some(source), Some(max)) = (media.resolution, device.max_resolution) {
                if !source.fits_within(&max) {
                    params = params.with_resolution(source.fit_within(&max));
                }
            }
        }
    }
    if let Some((codec, copy)) = &audio_target {
        params = params.with_audio(codec, *copy);
    }

    if let (false, Some(limit)) = (bitrate_ok, device.max_bitrate_kbps) {
        let (video_kbps, audio_kbps) = split_bitrate(limit, media.has_video(), media.has_audio());
        params = params.with_bitrates(video_kbps, audio_kbps);
    }

    let container_ok = device.supports_container(&media.container)
        && container_accepts(
            &media.container,
            params.video_codec.as_deref(),
            params.audio_codec.as_deref(),
        );
    params.container = if container_ok {
        media.container.clone()
    } else {
        choose_container(
            device,
            params.video_codec.as_deref(),
            params.audio_codec.as_deref(),
        )
    };

    Ok((DecisionKind::Transcode, reason, Some(params)))
}

/// Divides a bitrate limit between the streams present; a lone stream gets
/// all of it.
fn split_bitrate(limit: u64, video: bool, audio: bool) -> (Option<u64>, Option<u64>) {
    match (video, audio) {
        (true, true) => {
            let video_kbps = limit * VIDEO_BITRATE_SHARE / 100;
            (Some(video_kbps), Some(limit - video_kbps))
        }
        (true, false) => (Some(limit), None),
        (false, true) => (None, Some(limit)),
        (false, false) => (None, None),
    }
}

fn choose_video_codec(device: &DeviceProfile) -> String {
    choose(
        device.preferred_video_codec.as_deref(),
        &VIDEO_FALLBACKS,
        |c| device.supports_video_codec(c),
    )
}

fn choose_audio_codec(device: &DeviceProfile) -> String {
    choose(
        device.preferred_audio_codec.as_deref(),
        &AUDIO_FALLBACKS,
        |c| device.supports_audio_codec(c),
    )
}

/// Device preference when usable, else the first supported fallback, else
/// the first fallback.
fn choose(preferred: Option<&str>, fallbacks: &[&str], supported: impl Fn(&str) -> bool) -> String {
    preferred
        .filter(|p| supported(p))
        .or_else(|| fallbacks.iter().copied().find(|c| supported(c)))
        .unwrap_or(fallbacks[0])
        .to_string()
}

fn choose_container(device: &DeviceProfile, video: Option<&str>, audio: Option<&str>) -> String {
    let usable = |c: &str| device.supports_container(c) && container_accepts(c, video, audio);
    device
        .preferred_container
        .as_deref()
        .filter(|c| usable(c))
        .or_else(|| CONTAINER_FALLBACKS.iter().copied().find(|c| usable(c)))
        .unwrap_or("mp4")
        .to_string()
}

/// WebM only carries VP8/VP9/AV1 video and Vorbis/Opus audio.
fn container_accepts(container: &str, video: Option<&str>, audio: Option<&str>) -> bool {
    if container != "webm" {
        return true;
    }
    video.is_none_or(|v| matches!(v, "vp8" | "vp9" | "av1"))
        && audio.is_none_or(|a| matches!(a, "vorbis" | "opus"))
}
