//! Invocation target attenuation.
//!
//! A delegated capability may narrow its target by appending a path or query
//! suffix to its parent's target. The suffix may not climb out of the parent
//! (`..` segments, including percent-encoded forms), may not introduce empty
//! segments or fragments, and may not change the scheme or authority.

use crate::{Error, Result};
use url::Url;

/// Check that `requested` equals `parent` or is an acceptable extension of it.
pub fn check_target_attenuation(parent: &str, requested: &str) -> Result<()> {
    if requested == parent {
        return Ok(());
    }

    let Some(suffix) = requested.strip_prefix(parent) else {
        return Err(Error::InvocationTargetMismatch {
            parent: parent.to_string(),
            requested: requested.to_string(),
        });
    };

    validate_suffix(parent, suffix)?;
    check_authority(parent, requested, suffix)
}

/// Whether `requested` falls within `parent` under the attenuation rules.
pub fn is_within_target(parent: &str, requested: &str) -> bool {
    check_target_attenuation(parent, requested).is_ok()
}

fn invalid(suffix: &str, reason: &'static str) -> Error {
    Error::InvalidTargetSuffix {
        suffix: suffix.to_string(),
        reason,
    }
}

fn validate_suffix(parent: &str, suffix: &str) -> Result<()> {
    if suffix.contains('#') {
        return Err(invalid(suffix, "fragments are not allowed"));
    }
    if suffix.contains('\\') {
        return Err(invalid(suffix, "backslashes are not allowed"));
    }
    if suffix.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid(suffix, "whitespace is not allowed"));
    }

    // Once the parent has a query, only further parameters may follow.
    if parent.contains('?') {
        if !suffix.starts_with('&') {
            return Err(invalid(suffix, "must append query parameters with '&'"));
        }
        return Ok(());
    }

    let at_boundary = parent.ends_with('/') || suffix.starts_with('/') || suffix.starts_with('?');
    if !at_boundary {
        return Err(invalid(suffix, "must begin at a path or query boundary"));
    }
    if parent.ends_with('/') && suffix.starts_with('/') {
        return Err(invalid(suffix, "empty path segments are not allowed"));
    }

    let path = suffix.split_once('?').map_or(suffix, |(path, _)| path);
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return Ok(());
    }

    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        let Some(decoded) = decode_segment(segment) else {
            return Err(invalid(suffix, "path traversal segments are not allowed"));
        };
        if decoded == "." || decoded == ".." {
            return Err(invalid(suffix, "path traversal segments are not allowed"));
        }
        if decoded.contains('/') || decoded.contains('\\') {
            return Err(invalid(suffix, "encoded path separators are not allowed"));
        }
        // A single trailing slash is fine.
        if segment.is_empty() && i != last {
            return Err(invalid(suffix, "empty path segments are not allowed"));
        }
    }

    Ok(())
}

/// Undo percent-encoding until the segment is stable. `None` when the bytes
/// are not UTF-8 or more than three layers are stacked.
fn decode_segment(segment: &str) -> Option<String> {
    let mut current = segment.to_string();
    for _ in 0..=3 {
        match urlencoding::decode(&current) {
            Ok(decoded) if decoded != current => current = decoded.into_owned(),
            Ok(_) => return Some(current),
            Err(_) => return None,
        }
    }
    None
}
fn check_authority(parent: &str, requested: &str, suffix: &str) -> Result<()> {
    let parent_url = match Url::parse(parent) {
        Ok(url) => url,
        // Opaque targets (URNs, DIDs) rely on the textual prefix rule alone.
        Err(_) => return Ok(()),
    };
    let Ok(requested_url) = Url::parse(requested) else {
        return Err(invalid(suffix, "result is not a valid URL"));
    };

    let same_authority = parent_url.scheme() == requested_url.scheme()
        && parent_url.username() == requested_url.username()
        && parent_url.host_str() == requested_url.host_str()
        && parent_url.port_or_known_default() == requested_url.port_or_known_default();
    if !same_authority {
        return Err(invalid(suffix, "scheme or authority may not change"));
    }

    if !requested_url.path().starts_with(parent_url.path()) {
        return Err(invalid(suffix, "normalized path leaves the parent path"));
    }

    Ok(())
}
