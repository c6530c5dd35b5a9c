//! Forces packaged manifests into fixed-duration (VOD) form.
//!
//! Packagers that write incrementally may leave a DASH manifest marked
//! `dynamic` or HLS playlists without an end marker. The source has a known
//! duration, so the committed output must always describe a complete
//! presentation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::params::StreamingFormat;

static DYNAMIC_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"type\s*=\s*"dynamic""#).expect("valid mpd type regex"));

static LIVE_ONLY_ATTRS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+(minimumUpdatePeriod|timeShiftBufferDepth)\s*=\s*"[^"]*""#)
        .expect("valid mpd attribute regex")
});

/// Rewrites a DASH manifest as static. Returns `None` when already static.
pub fn finalize_dash(mpd: &str) -> Option<String> {
    if !DYNAMIC_TYPE.is_match(mpd) && !LIVE_ONLY_ATTRS.is_match(mpd) {
        return None;
    }
    let fixed = DYNAMIC_TYPE.replace_all(mpd, r#"type="static""#);
    Some(LIVE_ONLY_ATTRS.replace_all(&fixed, "").into_owned())
}

/// Marks an HLS media playlist as VOD and closes it. Master playlists and
/// playlists already in VOD form yield `None`.
pub fn finalize_hls_media(playlist: &str) -> Option<String> {
    if is_master_playlist(playlist) || !playlist.contains("#EXTINF") {
        return None;
    }

    let mut lines: Vec<&str> = playlist
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter(|l| !l.starts_with("#EXT-X-PLAYLIST-TYPE"))
        .collect();

    // The type tag belongs in the header, before the first segment
    let header_end = lines
        .iter()
        .position(|l| l.starts_with("#EXTINF") || l.starts_with("#EXT-X-MAP"))
        .unwrap_or(lines.len());
    lines.insert(header_end, "#EXT-X-PLAYLIST-TYPE:VOD");

    if !lines.iter().any(|l| l.trim() == "#EXT-X-ENDLIST") {
        lines.push("#EXT-X-ENDLIST");
    }

    let mut fixed = lines.join("\n");
    fixed.push('\n');
    (fixed != playlist).then_some(fixed)
}

pub fn is_master_playlist(playlist: &str) -> bool {
    playlist.contains("#EXT-X-STREAM-INF")
}

/// True when a DASH manifest describes a complete presentation.
pub fn dash_is_vod(mpd: &str) -> bool {
    !DYNAMIC_TYPE.is_match(mpd)
}

/// True when an HLS media playlist is VOD and ended.
pub fn hls_is_vod(playlist: &str) -> bool {
    is_master_playlist(playlist)
        || (playlist.contains("#EXT-X-PLAYLIST-TYPE:VOD") && playlist.contains("#EXT-X-ENDLIST"))
}

/// Rewrites every manifest in `dir` for `format`. Returns the files changed.
///
/// # Errors
///
/// - `std::io::Error` - Reading or rewriting a manifest failed
pub async fn finalize_manifests(dir: &Path, format: StreamingFormat) -> std::io::Result<Vec<PathBuf>> {
    let mut changed = Vec::new();

    match format {
        StreamingFormat::Dash => {
            let path = dir.join(format.manifest_name());
            let mpd = tokio::fs::read_to_string(&path).await?;
            if let Some(fixed) = finalize_dash(&mpd) {
                write_atomic(&path, &fixed).await?;
                changed.push(path);
            }
        }
        StreamingFormat::Hls => {
            for path in find_files(dir, "m3u8").await? {
                let playlist = tokio::fs::read_to_string(&path).await?;
                if let Some(fixed) = finalize_hls_media(&playlist) {
                    write_atomic(&path, &fixed).await?;
                    changed.push(path);
                }
            }
        }
    }

    if !changed.is_empty() {
        debug!(files = ?changed, "Finalized manifests as VOD");
    }
    Ok(changed)
}

async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Files under `dir` (recursively) with the given extension.
pub(crate) async fn find_files(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|e| e == extension) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}
