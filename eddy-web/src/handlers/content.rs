//! Serving of committed manifests and segments from the content store.

use std::path::Path;

use axum::extract::{Path as UrlPath, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use eddy_core::ContentHash;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use super::range::{build_range_response, extract_range_header, parse_range_header};
use crate::error::ApiError;
use crate::server::AppState;

/// Content type for a file in a committed entry.
pub fn content_type_for(file: &str) -> String {
    let extension = Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("mpd") => "application/dash+xml".to_string(),
        Some("m3u8") => "application/vnd.apple.mpegurl".to_string(),
        Some("m4s") => "video/iso.segment".to_string(),
        Some("ts") => "video/mp2t".to_string(),
        Some("mp4") | Some("m4v") => "video/mp4".to_string(),
        Some("m4a") => "audio/mp4".to_string(),
        _ => mime_guess::from_path(file)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// `GET /content/{hash}/{*file}`
///
/// Serves one file of a committed entry, honouring a single byte range.
/// Unknown hashes and files answer 404.
pub async fn content_file(
    State(state): State<AppState>,
    UrlPath((hash, file)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let hash = ContentHash::parse(&hash).map_err(|_| ApiError::BadPath {
        what: "content hash",
        value: hash.clone(),
    })?;
    let store = state.playback.store();
    let path = store.resolve_file(&hash, &file).await?;

    let mut handle = tokio::fs::File::open(&path).await.map_err(io_error(&path))?;
    let total_size = handle.metadata().await.map_err(io_error(&path))?.len();

    let range = match extract_range_header(&headers) {
        Some(value) => parse_range_header(value, total_size).map_err(|status| {
            debug!(%hash, file = %file, range = value, ?status, "Rejected range request");
            ApiError::RangeNotSatisfiable { total: total_size }
        })?,
        None => None,
    };

    let (offset, length) = match range {
        Some(range) => (range.start, range.len()),
        None => (0, total_size),
    };
    let mut data = vec![0u8; usize::try_from(length).unwrap_or(usize::MAX)];
    handle
        .seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(io_error(&path))?;
    handle.read_exact(&mut data).await.map_err(io_error(&path))?;

    // Manifests mark a playback access for retention accounting
    if file.ends_with(".mpd") || file.ends_with(".m3u8") {
        if let Err(e) = store.touch(&hash).await {
            warn!(%hash, error = %e, "Failed to record content access");
        }
    }

    let content_type = content_type_for(&file);
    Ok(
        match build_range_response(Bytes::from(data), &content_type, range, total_size) {
            Ok(response) => response,
            Err(status) => status.into_response(),
        },
    )
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ApiError {
    let path = path.to_path_buf();
    move |source| {
        ApiError::Storage(eddy_core::StorageError::Io {
            operation: "serve",
            path,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("manifest.mpd"), "application/dash+xml");
        assert_eq!(
            content_type_for("playlist.m3u8"),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(content_type_for("chunk-0-00001.m4s"), "video/iso.segment");
        assert_eq!(content_type_for("segment_001.TS"), "video/mp2t");
        assert_eq!(content_type_for("stream_0/init.mp4"), "video/mp4");
        assert_eq!(content_type_for("subs.vtt"), "text/vtt");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }
}
