//! ffmpeg-based encoders, software and hardware accelerated.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;

use super::{EncodeJob, Provider, ProviderInfo};
use crate::process::{ManagedProcess, ProcessError, ProgressMode};

/// Hardware encoder families ffmpeg can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareAccel {
    /// NVIDIA NVENC
    Nvenc,
    /// Intel Quick Sync
    Qsv,
    /// VA-API (Intel/AMD on Linux)
    Vaapi,
}

impl HardwareAccel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareAccel::Nvenc => "nvenc",
            HardwareAccel::Qsv => "qsv",
            HardwareAccel::Vaapi => "vaapi",
        }
    }
}

impl fmt::Display for HardwareAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardwareAccel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nvenc" | "nvidia" | "cuda" => Ok(HardwareAccel::Nvenc),
            "qsv" | "intel" => Ok(HardwareAccel::Qsv),
            "vaapi" => Ok(HardwareAccel::Vaapi),
            other => Err(format!("unknown hardware acceleration '{other}'")),
        }
    }
}

const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Encodes through an ffmpeg binary into an intermediate in the target
/// container; MP4 and MOV outputs are written faststart.
pub struct FfmpegProvider {
    info: ProviderInfo,
    binary: PathBuf,
    accel: Option<HardwareAccel>,
}

impl FfmpegProvider {
    pub fn software(binary: impl Into<PathBuf>) -> Self {
        Self {
            info: ProviderInfo {
                id: "ffmpeg-software".to_string(),
                name: "FFmpeg (software)".to_string(),
                video_codecs: set(&["h264", "hevc", "vp9", "av1"]),
                audio_codecs: set(&["aac", "opus", "mp3", "ac3"]),
                containers: set(&["mp4", "mkv", "webm", "mov", "ts"]),
                hardware_accelerated: false,
                max_concurrent: num_cpus::get().max(1),
            },
            binary: binary.into(),
            accel: None,
        }
    }

    pub fn hardware(binary: impl Into<PathBuf>, accel: HardwareAccel) -> Self {
        let label = match accel {
            HardwareAccel::Nvenc => "NVIDIA NVENC",
            HardwareAccel::Qsv => "Intel Quick Sync",
            HardwareAccel::Vaapi => "VA-API",
        };
        Self {
            info: ProviderInfo {
                id: format!("ffmpeg-{accel}"),
                name: format!("FFmpeg ({label})"),
                video_codecs: set(&["h264", "hevc"]),
                audio_codecs: set(&["aac", "opus", "mp3", "ac3"]),
                containers: set(&["mp4", "mkv", "ts"]),
                hardware_accelerated: true,
                max_concurrent: 2,
            },
            binary: binary.into(),
            accel: Some(accel),
        }
    }

    fn video_encoder(&self, codec: &str) -> Option<&'static str> {
        let encoder = match (self.accel, codec) {
            (None, "h264") => "libx264",
            (None, "hevc") => "libx265",
            (None, "vp9") => "libvpx-vp9",
            (None, "av1") => "libsvtav1",
            (Some(HardwareAccel::Nvenc), "h264") => "h264_nvenc",
            (Some(HardwareAccel::Nvenc), "hevc") => "hevc_nvenc",
            (Some(HardwareAccel::Qsv), "h264") => "h264_qsv",
            (Some(HardwareAccel::Qsv), "hevc") => "hevc_qsv",
            (Some(HardwareAccel::Vaapi), "h264") => "h264_vaapi",
            (Some(HardwareAccel::Vaapi), "hevc") => "hevc_vaapi",
            _ => return None,
        };
        Some(encoder)
    }

    fn audio_encoder(codec: &str) -> Option<&'static str> {
        match codec {
            "aac" => Some("aac"),
            "opus" => Some("libopus"),
            "mp3" => Some("libmp3lame"),
            "ac3" => Some("ac3"),
            _ => None,
        }
    }

    /// Command line for one encode stage.
    pub fn build_args(&self, job: &EncodeJob) -> Vec<OsString> {
        let params = &job.params;
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]
            .iter()
            .map(OsString::from)
            .collect();
        let mut push = |values: &[&str]| args.extend(values.iter().map(OsString::from));

        let encodes_video = params.video_codec.is_some() && !params.copy_video;
        if encodes_video && self.accel == Some(HardwareAccel::Vaapi) {
            push(&[
                "-hwaccel",
                "vaapi",
                "-hwaccel_output_format",
                "vaapi",
                "-vaapi_device",
                VAAPI_DEVICE,
            ]);
        }

        if params.seek_offset_ms > 0 {
            let seconds = format!("{:.3}", params.seek_offset_ms as f64 / 1000.0);
            push(&["-ss", &seconds]);
        }
        args.push("-i".into());
        args.push(job.input.clone().into());

        let mut push = |values: &[&str]| args.extend(values.iter().map(OsString::from));
        push(&["-map", "0:v:0?", "-map", "0:a:0?"]);

        match (&params.video_codec, params.copy_video) {
            (None, _) => push(&["-vn"]),
            (Some(_), true) => push(&["-c:v", "copy"]),
            (Some(codec), false) => {
                let encoder = self.video_encoder(codec).unwrap_or("libx264");
                push(&["-c:v", encoder]);
                match encoder {
                    "libx264" | "libx265" => push(&["-preset", "veryfast", "-pix_fmt", "yuv420p"]),
                    "libvpx-vp9" => push(&["-deadline", "realtime", "-row-mt", "1"]),
                    "libsvtav1" => push(&["-preset", "10"]),
                    _ => {}
                }
                if let Some(resolution) = params.resolution {
                    let filter = match self.accel {
                        Some(HardwareAccel::Vaapi) => {
                            format!("scale_vaapi=w={}:h={}", resolution.width, resolution.height)
                        }
                        _ => format!("scale={}:{}", resolution.width, resolution.height),
                    };
                    push(&["-vf", &filter]);
                }
                if let Some(kbps) = params.video_bitrate_kbps {
                    let rate = format!("{kbps}k");
                    let buffer = format!("{}k", kbps * 2);
                    push(&["-b:v", &rate, "-maxrate", &rate, "-bufsize", &buffer]);
                }
            }
        }

        match (&params.audio_codec, params.copy_audio) {
            (None, _) => push(&["-an"]),
            (Some(_), true) => push(&["-c:a", "copy"]),
            (Some(codec), false) => {
                let encoder = Self::audio_encoder(codec).unwrap_or("aac");
                push(&["-c:a", encoder, "-ac", "2"]);
                if let Some(kbps) = params.audio_bitrate_kbps {
                    push(&["-b:a", &format!("{kbps}k")]);
                }
            }
        }

        if matches!(params.container.as_str(), "mp4" | "mov") {
            push(&["-movflags", "+faststart"]);
        }
        push(&["-progress", "pipe:1", "-nostats"]);
        args.push(job.output.clone().into());
        args
    }
}

fn set(values: &[&str]) -> std::collections::BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[async_trait]
impl Provider for FfmpegProvider {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    async fn start_encode(&self, job: &EncodeJob) -> Result<ManagedProcess, ProcessError> {
        let args = self.build_args(job);
        ManagedProcess::spawn(
            format!("encode:{}", self.info.id),
            &self.binary,
            &args,
            job.output.parent(),
            ProgressMode::Ffmpeg {
                expected: job.expected_duration(),
            },
        )
    }
}
