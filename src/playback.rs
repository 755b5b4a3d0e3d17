//! HTTP Range resolution for the local-file playback scheme
//!
//! The desktop shell serves recorded audio over a `local-file://` scheme
//! with byte-range semantics; this module is the pure part of that
//! handler — given a file size and the raw `Range` header, decide status,
//! content range, and offsets. The shell only does I/O.

/// Resolution of one request against a file of known size
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeResolution {
    /// 200: serve the whole file
    Full { content_length: u64 },
    /// 206: serve `[start, end]` inclusive
    Partial {
        start: u64,
        end: u64,
        content_length: u64,
        content_range: String,
    },
    /// 416: unsatisfiable start offset
    NotSatisfiable { content_range: String },
}

/// Resolve an optional `Range` header value against `file_size`.
///
/// Supports the single-range forms `bytes=a-b`, `bytes=a-`, and the suffix
/// form `bytes=-n`. Malformed headers fall back to the full file, matching
/// what lenient HTTP servers do.
pub fn resolve_range(file_size: u64, range_header: Option<&str>) -> RangeResolution {
    let Some(header) = range_header else {
        return RangeResolution::Full {
            content_length: file_size,
        };
    };

    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeResolution::Full {
            content_length: file_size,
        };
    };

    // Only the first range of a multi-range request is honored
    let spec = spec.split(',').next().unwrap_or("").trim();
    let Some((start_part, end_part)) = spec.split_once('-') else {
        return RangeResolution::Full {
            content_length: file_size,
        };
    };

    let (start, end) = if start_part.is_empty() {
        // Suffix form: last n bytes
        match end_part.parse::<u64>() {
            Ok(0) | Err(_) => {
                return RangeResolution::Full {
                    content_length: file_size,
                }
            }
            Ok(n) => (file_size.saturating_sub(n), file_size.saturating_sub(1)),
        }
    } else {
        let Ok(start) = start_part.parse::<u64>() else {
            return RangeResolution::Full {
                content_length: file_size,
            };
        };
        let end = match end_part {
            "" => file_size.saturating_sub(1),
            e => match e.parse::<u64>() {
                Ok(end) => end.min(file_size.saturating_sub(1)),
                Err(_) => {
                    return RangeResolution::Full {
                        content_length: file_size,
                    }
                }
            },
        };
        (start, end)
    };

    if start >= file_size || end < start {
        return RangeResolution::NotSatisfiable {
            content_range: format!("bytes */{}", file_size),
        };
    }

    RangeResolution::Partial {
        start,
        end,
        content_length: end - start + 1,
        content_range: format!("bytes {}-{}/{}", start, end, file_size),
    }
}

/// MIME type by file extension; audio formats the recorder produces plus a
/// generic fallback.
pub fn mime_for_path(path: &str) -> &'static str {
    let extension = path.rsplit('.').next().unwrap_or_default();
    match extension.to_ascii_lowercase().as_str() {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_header_serves_full_file() {
        assert_eq!(
            resolve_range(2_000_000, None),
            RangeResolution::Full {
                content_length: 2_000_000
            }
        );
    }

    #[test]
    fn open_ended_range_serves_tail() {
        match resolve_range(2_000_000, Some("bytes=1000000-")) {
            RangeResolution::Partial {
                start,
                end,
                content_length,
                content_range,
            } => {
                assert_eq!(start, 1_000_000);
                assert_eq!(end, 1_999_999);
                assert_eq!(content_length, 1_000_000);
                assert_eq!(content_range, "bytes 1000000-1999999/2000000");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn start_at_size_is_not_satisfiable() {
        match resolve_range(2_000_000, Some("bytes=2000000-")) {
            RangeResolution::NotSatisfiable { content_range } => {
                assert_eq!(content_range, "bytes */2000000");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn bounded_range_clamps_to_file_end() {
        match resolve_range(1_000, Some("bytes=900-5000")) {
            RangeResolution::Partial {
                start,
                end,
                content_length,
                ..
            } => {
                assert_eq!((start, end), (900, 999));
                assert_eq!(content_length, 100);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn suffix_range_serves_last_bytes() {
        match resolve_range(1_000, Some("bytes=-100")) {
            RangeResolution::Partial {
                start,
                end,
                content_range,
                ..
            } => {
                assert_eq!((start, end), (900, 999));
                assert_eq!(content_range, "bytes 900-999/1000");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn malformed_header_degrades_to_full() {
        assert!(matches!(
            resolve_range(1_000, Some("bytes=abc-def")),
            RangeResolution::Full { .. }
        ));
        assert!(matches!(
            resolve_range(1_000, Some("chunks=0-10")),
            RangeResolution::Full { .. }
        ));
    }

    #[test]
    fn mime_inference_by_extension() {
        assert_eq!(mime_for_path("/recordings/m1/take.wav"), "audio/wav");
        assert_eq!(mime_for_path("clip.MP3"), "audio/mpeg");
        assert_eq!(mime_for_path("no_extension"), "application/octet-stream");
    }
}
