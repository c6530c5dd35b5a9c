//! Encoder backends and their capability descriptors.

pub mod ffmpeg;
pub mod registry;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use ffmpeg::{FfmpegProvider, HardwareAccel};
pub use registry::ProviderRegistry;

use crate::media::{normalize_codec, normalize_container};
use crate::params::TranscodeParams;
use crate::process::{ManagedProcess, ProcessError};

/// Errors raised by provider lookup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Nothing registered can produce the requested output
    #[error("No provider can encode {container} with video {video} and audio {audio}")]
    NoCapableProvider {
        container: String,
        video: String,
        audio: String,
    },

    #[error("Provider '{id}' is already registered")]
    DuplicateProvider { id: String },
}

impl ProviderError {
    pub(crate) fn no_capable(params: &TranscodeParams) -> Self {
        let describe = |codec: &Option<String>, copy: bool| match (codec, copy) {
            (None, _) => "none".to_string(),
            (Some(c), true) => format!("{c} (copy)"),
            (Some(c), false) => c.clone(),
        };
        ProviderError::NoCapableProvider {
            container: params.container.clone(),
            video: describe(&params.video_codec, params.copy_video),
            audio: describe(&params.audio_codec, params.copy_audio),
        }
    }
}

/// Static capability descriptor, read-only after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    /// Encoders the backend can run
    pub video_codecs: BTreeSet<String>,
    pub audio_codecs: BTreeSet<String>,
    /// Containers the backend can write
    pub containers: BTreeSet<String>,
    pub hardware_accelerated: bool,
    /// Concurrent encodes the backend is comfortable with
    pub max_concurrent: usize,
}

impl ProviderInfo {
    /// Stream copies need no encoder, so only re-encoded streams are checked.
    pub fn can_handle(&self, params: &TranscodeParams) -> bool {
        if !self.containers.contains(&normalize_container(&params.container)) {
            return false;
        }
        let video_ok = match (&params.video_codec, params.copy_video) {
            (None, _) | (Some(_), true) => true,
            (Some(codec), false) => self.video_codecs.contains(&normalize_codec(codec)),
        };
        let audio_ok = match (&params.audio_codec, params.copy_audio) {
            (None, _) | (Some(_), true) => true,
            (Some(codec), false) => self.audio_codecs.contains(&normalize_codec(codec)),
        };
        video_ok && audio_ok
    }
}

/// Everything an encoder needs for one encode stage.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub input: PathBuf,
    /// Intermediate file the encoder writes
    pub output: PathBuf,
    pub params: TranscodeParams,
    /// Source duration, used to turn encoder timestamps into fractions
    pub source_duration: Option<Duration>,
}

impl EncodeJob {
    /// Length of media the encoder will actually produce.
    pub fn expected_duration(&self) -> Option<Duration> {
        let offset = Duration::from_millis(self.params.seek_offset_ms);
        self.source_duration
            .map(|d| d.saturating_sub(offset))
            .filter(|d| !d.is_zero())
    }
}

/// An encoder backend.
///
/// Whether the encoder runs in-process or as a subprocess is up to the
/// implementation; callers only see the [`ManagedProcess`] handle, which
/// exposes progress, exit and termination.
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> &ProviderInfo;

    /// Starts the encode stage.
    ///
    /// # Errors
    ///
    /// - `ProcessError::NotFound` - Encoder binary missing
    /// - `ProcessError::Spawn` - Encoder could not be started
    async fn start_encode(&self, job: &EncodeJob) -> Result<ManagedProcess, ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::StreamingFormat;

    fn info() -> ProviderInfo {
        ProviderInfo {
            id: "sw".into(),
            name: "Software".into(),
            video_codecs: ["h264".to_string()].into(),
            audio_codecs: ["aac".to_string()].into(),
            containers: ["mp4".to_string()].into(),
            hardware_accelerated: false,
            max_concurrent: 2,
        }
    }

    #[test]
    fn test_can_handle_checks_encoded_streams_only() {
        let info = info();
        let encode = TranscodeParams::new("m", "mp4", StreamingFormat::Dash)
            .with_video("h264", false)
            .with_audio("aac", false);
        assert!(info.can_handle(&encode));

        let copy_hevc = TranscodeParams::new("m", "mp4", StreamingFormat::Dash)
            .with_video("hevc", true)
            .with_audio("aac", false);
        assert!(info.can_handle(&copy_hevc));

        let encode_hevc = copy_hevc.clone().with_video("hevc", false);
        assert!(!info.can_handle(&encode_hevc));

        let webm = TranscodeParams::new("m", "webm", StreamingFormat::Dash).with_video("h264", false);
        assert!(!info.can_handle(&webm));
    }

    #[test]
    fn test_expected_duration_accounts_for_seek() {
        let job = EncodeJob {
            input: "in.mkv".into(),
            output: "out.mp4".into(),
            params: TranscodeParams::new("m", "mp4", StreamingFormat::Dash).with_seek_offset(60_000),
            source_duration: Some(Duration::from_secs(100)),
        };
        assert_eq!(job.expected_duration(), Some(Duration::from_secs(40)));

        let past_end = EncodeJob {
            params: job.params.clone().with_seek_offset(200_000),
            ..job
        };
        assert_eq!(past_end.expected_duration(), None);
    }
}
