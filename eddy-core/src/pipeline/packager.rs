//! Package stage backends turning the encoded intermediate into DASH or HLS.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::params::StreamingFormat;
use crate::process::{ManagedProcess, ProcessError, ProgressMode};

/// Input and output of one package stage.
#[derive(Debug, Clone)]
pub struct PackageJob {
    /// Encoded intermediate
    pub input: PathBuf,
    /// Directory that receives the manifest and media files
    pub output_dir: PathBuf,
    pub format: StreamingFormat,
    pub segment_duration: Duration,
    pub has_video: bool,
    pub has_audio: bool,
}

/// A packaging backend.
#[async_trait]
pub trait Packager: Send + Sync {
    fn name(&self) -> &str;

    /// Starts packaging; the process runs with `output_dir` as working directory.
    async fn start_package(&self, job: &PackageJob) -> Result<ManagedProcess, ProcessError>;
}

/// Shaka Packager producing on-demand output.
pub struct ShakaPackager {
    binary: PathBuf,
}

impl ShakaPackager {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn build_args(&self, job: &PackageJob) -> Vec<OsString> {
        let input = job.input.display();
        let mut args: Vec<OsString> = Vec::new();

        let streams = [("video", job.has_video), ("audio", job.has_audio)];
        for (stream, _) in streams.iter().filter(|(_, present)| *present) {
            let mut descriptor = format!(
                "in={input},stream={stream},init_segment={stream}/init.mp4,segment_template={stream}/seg-$Number$.m4s"
            );
            if job.format == StreamingFormat::Hls {
                descriptor.push_str(&format!(",playlist_name={stream}.m3u8"));
            }
            args.push(descriptor.into());
        }

        args.push("--segment_duration".into());
        args.push(job.segment_duration.as_secs().max(1).to_string().into());

        match job.format {
            StreamingFormat::Dash => {
                args.push("--mpd_output".into());
                args.push(StreamingFormat::Dash.manifest_name().into());
            }
            StreamingFormat::Hls => {
                args.push("--hls_master_playlist_output".into());
                args.push(StreamingFormat::Hls.manifest_name().into());
                args.push("--hls_playlist_type".into());
                args.push("VOD".into());
            }
        }
        args
    }
}

#[async_trait]
impl Packager for ShakaPackager {
    fn name(&self) -> &str {
        "shaka"
    }

    async fn start_package(&self, job: &PackageJob) -> Result<ManagedProcess, ProcessError> {
        create_stream_dirs(&job.output_dir).await?;
        ManagedProcess::spawn(
            "package:shaka",
            &self.binary,
            &self.build_args(job),
            Some(&job.output_dir),
            ProgressMode::Ignore,
        )
    }
}

/// ffmpeg's dash and hls muxers with stream copy.
pub struct FfmpegPackager {
    binary: PathBuf,
}

impl FfmpegPackager {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn build_args(&self, job: &PackageJob) -> Vec<OsString> {
        let segment = job.segment_duration.as_secs().max(1).to_string();
        let mut args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            job.input.clone().into(),
            "-map".into(),
            "0".into(),
            "-c".into(),
            "copy".into(),
        ];
        let mut push = |values: &[&str]| args.extend(values.iter().map(OsString::from));

        match job.format {
            StreamingFormat::Dash => push(&[
                "-f",
                "dash",
                "-seg_duration",
                &segment,
                "-use_template",
                "1",
                "-use_timeline",
                "1",
                "-init_seg_name",
                "init-$RepresentationID$.m4s",
                "-media_seg_name",
                "chunk-$RepresentationID$-$Number%05d$.m4s",
                StreamingFormat::Dash.manifest_name(),
            ]),
            StreamingFormat::Hls => push(&[
                "-f",
                "hls",
                "-hls_time",
                &segment,
                "-hls_playlist_type",
                "vod",
                "-hls_segment_type",
                "fmp4",
                "-hls_fmp4_init_filename",
                "init.mp4",
                "-hls_segment_filename",
                "seg-%05d.m4s",
                StreamingFormat::Hls.manifest_name(),
            ]),
        }
        args
    }
}

#[async_trait]
impl Packager for FfmpegPackager {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn start_package(&self, job: &PackageJob) -> Result<ManagedProcess, ProcessError> {
        tokio::fs::create_dir_all(&job.output_dir).await?;
        ManagedProcess::spawn(
            "package:ffmpeg",
            &self.binary,
            &self.build_args(job),
            Some(&job.output_dir),
            ProgressMode::Ignore,
        )
    }
}

async fn create_stream_dirs(output_dir: &Path) -> std::io::Result<()> {
    for stream in ["video", "audio"] {
        tokio::fs::create_dir_all(output_dir.join(stream)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(format: StreamingFormat) -> PackageJob {
        PackageJob {
            input: "/tmp/job/encoded.mp4".into(),
            output_dir: "/tmp/job/package".into(),
            format,
            segment_duration: Duration::from_secs(4),
            has_video: true,
            has_audio: true,
        }
    }

    fn joined(args: &[OsString]) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_shaka_dash_args() {
        let args = joined(&ShakaPackager::new("packager").build_args(&job(StreamingFormat::Dash)));
        assert!(args.contains(
            "in=/tmp/job/encoded.mp4,stream=video,init_segment=video/init.mp4,segment_template=video/seg-$Number$.m4s"
        ));
        assert!(args.contains("stream=audio"));
        assert!(args.contains("--segment_duration 4"));
        assert!(args.ends_with("--mpd_output manifest.mpd"));
    }

    #[test]
    fn test_shaka_hls_is_vod() {
        let mut audio_only = job(StreamingFormat::Hls);
        audio_only.has_video = false;
        let args = joined(&ShakaPackager::new("packager").build_args(&audio_only));

        assert!(!args.contains("stream=video"));
        assert!(args.contains("playlist_name=audio.m3u8"));
        assert!(args.contains("--hls_master_playlist_output playlist.m3u8"));
        assert!(args.ends_with("--hls_playlist_type VOD"));
    }

    #[test]
    fn test_ffmpeg_packager_args() {
        let packager = FfmpegPackager::new("ffmpeg");
        let dash = joined(&packager.build_args(&job(StreamingFormat::Dash)));
        assert!(dash.contains("-c copy -f dash -seg_duration 4"));
        assert!(dash.ends_with("manifest.mpd"));

        let hls = joined(&packager.build_args(&job(StreamingFormat::Hls)));
        assert!(hls.contains("-hls_playlist_type vod"));
        assert!(hls.ends_with("playlist.m3u8"));
    }
}
