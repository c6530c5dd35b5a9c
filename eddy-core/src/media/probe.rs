//! Media probing via `ffprobe`.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{MediaProfile, Resolution, normalize_codec, normalize_container};

/// Errors raised while probing a source file.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to run {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Probe of {path} failed: {stderr}")]
    Failed { path: PathBuf, stderr: String },

    #[error("Unreadable probe output for {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of [`MediaProfile`]s.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaProfile, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    color_transfer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Runs `ffprobe -print_format json` and maps the result.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    binary: PathBuf,
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaProfile, ProbeError> {
        let output = Command::new(&self.binary)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed: FfprobeOutput =
            serde_json::from_slice(&output.stdout).map_err(|e| ProbeError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let profile = profile_from_ffprobe(parsed, path);
        debug!(path = %path.display(), ?profile, "Probed media");
        Ok(profile)
    }
}

fn profile_from_ffprobe(output: FfprobeOutput, path: &Path) -> MediaProfile {
    let format = output.format;
    let container = format
        .as_ref()
        .and_then(|f| f.format_name.as_deref())
        .map(|names| pick_container(names, path))
        .unwrap_or_default();

    let mut profile = MediaProfile::new(&container, None, None);

    for stream in output.streams.unwrap_or_default() {
        match stream.codec_type.as_deref() {
            Some("video") if profile.video_codec.is_none() => {
                // Cover art is reported as a video stream
                if matches!(stream.codec_name.as_deref(), Some("mjpeg" | "png")) {
                    continue;
                }
                profile.video_codec = stream.codec_name.as_deref().map(normalize_codec);
                if let (Some(w), Some(h)) = (stream.width, stream.height) {
                    profile.resolution = Some(Resolution::new(w, h));
                }
                profile.hdr = matches!(
                    stream.color_transfer.as_deref(),
                    Some("smpte2084" | "arib-std-b67")
                );
            }
            Some("audio") if profile.audio_codec.is_none() => {
                profile.audio_codec = stream.codec_name.as_deref().map(normalize_codec);
            }
            _ => {}
        }
    }

    if let Some(format) = format {
        profile.duration_ms = format
            .duration
            .and_then(|d| d.parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as u64);
        profile.bitrate_kbps = format
            .bit_rate
            .and_then(|b| b.parse::<u64>().ok())
            .map(|bps| bps / 1000);
    }

    profile
}

/// ffprobe reports demuxer families such as `mov,mp4,m4a,3gp`; prefer the
/// member matching the file extension.
fn pick_container(format_names: &str, path: &Path) -> String {
    let candidates: Vec<String> = format_names.split(',').map(normalize_container).collect();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(normalize_container);

    match extension {
        Some(ext) if candidates.contains(&ext) => ext,
        _ => candidates.into_iter().next().unwrap_or_default(),
    }
}

/// LRU cache in front of another probe.
///
/// Entries are keyed by path, size and modification time, so a replaced file
/// is probed again and produces a new profile.
pub struct CachedProbe<P> {
    inner: P,
    cache: Mutex<LruCache<(PathBuf, u64, Option<SystemTime>), MediaProfile>>,
}

impl<P: MediaProbe> CachedProbe<P> {
    pub fn new(inner: P, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

#[async_trait]
impl<P: MediaProbe> MediaProbe for CachedProbe<P> {
    async fn probe(&self, path: &Path) -> Result<MediaProfile, ProbeError> {
        let metadata = tokio::fs::metadata(path).await?;
        let key = (path.to_path_buf(), metadata.len(), metadata.modified().ok());

        if let Some(profile) = self.cache.lock().get(&key) {
            return Ok(profile.clone());
        }

        let profile = self.inner.probe(path).await?;
        self.cache.lock().put(key, profile.clone());
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const MKV_JSON: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "hevc", "width": 3840, "height": 2160,
             "color_transfer": "smpte2084"},
            {"codec_type": "audio", "codec_name": "eac3"},
            {"codec_type": "audio", "codec_name": "aac"}
        ],
        "format": {"format_name": "matroska,webm", "duration": "5400.250000", "bit_rate": "25000000"}
    }"#;

    #[test]
    fn test_profile_from_ffprobe_json() {
        let output: FfprobeOutput = serde_json::from_str(MKV_JSON).unwrap();
        let profile = profile_from_ffprobe(output, Path::new("/media/movie.mkv"));

        assert_eq!(profile.container, "mkv");
        assert_eq!(profile.video_codec.as_deref(), Some("hevc"));
        assert_eq!(profile.audio_codec.as_deref(), Some("eac3"));
        assert_eq!(profile.resolution, Some(Resolution::new(3840, 2160)));
        assert_eq!(profile.bitrate_kbps, Some(25_000));
        assert_eq!(profile.duration_ms, Some(5_400_250));
        assert!(profile.hdr);
    }

    #[test]
    fn test_cover_art_is_not_the_video_stream() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "mp3"},
                {"codec_type": "video", "codec_name": "mjpeg", "width": 500, "height": 500}
            ],
            "format": {"format_name": "mp3"}
        }"#;
        let output: FfprobeOutput = serde_json::from_str(json).unwrap();
        let profile = profile_from_ffprobe(output, Path::new("song.mp3"));

        assert!(profile.is_audio_only());
        assert_eq!(profile.resolution, None);
    }

    #[test]
    fn test_container_family_uses_extension() {
        assert_eq!(pick_container("mov,mp4,m4a,3gp,3g2,mj2", Path::new("a.mp4")), "mp4");
        assert_eq!(pick_container("mov,mp4,m4a,3gp,3g2,mj2", Path::new("a.mov")), "mov");
        assert_eq!(pick_container("mov,mp4,m4a,3gp,3g2,mj2", Path::new("a.bin")), "mov");
    }

    struct CountingProbe(AtomicUsize);

    #[async_trait]
    impl MediaProbe for CountingProbe {
        async fn probe(&self, _path: &Path) -> Result<MediaProfile, ProbeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(MediaProfile::new("mkv", Some("h264"), Some("aac")))
        }
    }

    #[tokio::test]
    async fn test_cached_probe_hits_and_invalidates_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mkv");
        std::fs::write(&file, b"one").unwrap();

        let probe = CachedProbe::new(CountingProbe(AtomicUsize::new(0)), NonZeroUsize::new(8).unwrap());

        probe.probe(&file).await.unwrap();
        probe.probe(&file).await.unwrap();
        assert_eq!(probe.inner.0.load(Ordering::SeqCst), 1);

        std::fs::write(&file, b"longer contents").unwrap();
        probe.probe(&file).await.unwrap();
        assert_eq!(probe.inner.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let probe = FfprobeProbe::new("/nonexistent/ffprobe-binary");
        let result = probe.probe(Path::new("whatever.mkv")).await;
        assert!(matches!(result, Err(ProbeError::Spawn { .. })));
    }
}
