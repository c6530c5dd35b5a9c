//! HTTP Range request handling for segment and manifest serving
//!
//! Implements single-range RFC 7233 requests. Multi-range and malformed
//! headers are ignored and the full file is served instead.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;

/// Inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte
    pub start: u64,
    /// Last byte, inclusive
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a parsed range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parse a Range header against a file of `total_size` bytes.
///
/// Handles `bytes=start-end`, `bytes=start-` and `bytes=-suffix`. Returns
/// `Ok(None)` when the header should be ignored.
///
/// # Examples
/// ```
/// use eddy_web::handlers::range::{ByteRange, parse_range_header};
/// let range = parse_range_header("bytes=100-199", 1000).unwrap();
/// assert_eq!(range, Some(ByteRange { start: 100, end: 199 }));
/// ```
///
/// # Errors
/// Returns RANGE_NOT_SATISFIABLE if the range starts past the end of the file
pub fn parse_range_header(range: &str, total_size: u64) -> Result<Option<ByteRange>, StatusCode> {
    let Some(spec) = range.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return Ok(None);
    };
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        // Suffix range: the last n bytes
        let Ok(suffix) = end_str.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || total_size == 0 {
            return Err(StatusCode::RANGE_NOT_SATISFIABLE);
        }
        return Ok(Some(ByteRange {
            start: total_size.saturating_sub(suffix),
            end: total_size - 1,
        }));
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return Ok(None);
    };
    let end = if end_str.is_empty() {
        None
    } else {
        match end_str.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return Ok(None),
        }
    };

    validate_range_bounds(start, end, total_size).map(Some)
}

/// Validate range request bounds and clamp the end to the file.
///
/// # Errors
/// Returns RANGE_NOT_SATISFIABLE if start position is at or beyond the file size
pub fn validate_range_bounds(
    start: u64,
    end: Option<u64>,
    total_size: u64,
) -> Result<ByteRange, StatusCode> {
    if start >= total_size {
        return Err(StatusCode::RANGE_NOT_SATISFIABLE);
    }
    let last = total_size - 1;
    Ok(ByteRange {
        start,
        end: end.map_or(last, |end| end.min(last)),
    })
}

/// Extract the Range header value, if present and valid UTF-8.
pub fn extract_range_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::RANGE)
        .and_then(|range| range.to_str().ok())
}

/// Build a 200 or 206 response around already-sliced data.
///
/// # Errors
/// Returns StatusCode error if response building fails
pub fn build_range_response(
    data: Bytes,
    content_type: &str,
    range: Option<ByteRange>,
    total_size: u64,
) -> Result<Response<Body>, StatusCode> {
    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, data.len().to_string());

    response = match range {
        Some(range) => response.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{total_size}", range.start, range.end),
        ),
        None => response.status(StatusCode::OK),
    };

    response
        .body(Body::from(data))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
