//! File validation against an [`UploadPolicy`].

use super::errors::{ValidationError, ValidationReason};
use super::types::{Payload, UploadPolicy};

/// Reject a batch that would push the queue past `max_file_count`.
pub fn check_capacity(queued: usize, incoming: usize, policy: &UploadPolicy) -> Result<(), ValidationError> {
    if queued + incoming > policy.max_file_count {
        return Err(ValidationError::new(
            format!("batch of {} files", incoming),
            ValidationReason::QueueFull { limit: policy.max_file_count },
        ));
    }

    Ok(())
}

/// Per-file checks: non-empty, within the size limit, allowed type.
pub fn validate_file(payload: &Payload, policy: &UploadPolicy) -> Result<(), ValidationError> {
    if payload.size == 0 {
        return Err(ValidationError::new(&payload.file_name, ValidationReason::EmptyFile));
    }

    if payload.size > policy.max_file_size_bytes {
        return Err(ValidationError::new(
            &payload.file_name,
            ValidationReason::TooLarge {
                size: payload.size,
                limit: policy.max_file_size_bytes,
            },
        ));
    }

    if !is_type_allowed(payload, &policy.allowed_mime_patterns) {
        return Err(ValidationError::new(
            &payload.file_name,
            ValidationReason::UnsupportedType { media_type: payload.media_type.clone() },
        ));
    }

    Ok(())
}

/// An empty pattern list allows everything.
fn is_type_allowed(payload: &Payload, patterns: &[String]) -> bool {
    patterns.is_empty()
        || patterns
            .iter()
            .any(|pattern| matches_pattern(pattern.trim(), &payload.media_type, &payload.file_name))
}

fn matches_pattern(pattern: &str, media_type: &str, file_name: &str) -> bool {
    if pattern == "*" || pattern == "*/*" {
        return true;
    }

    // 扩展名匹配, 例如 ".mp4"
    if pattern.starts_with('.') {
        return file_name.to_ascii_lowercase().ends_with(&pattern.to_ascii_lowercase());
    }

    let media_type = media_type.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_suffix("/*") {
        Some(top_level) => media_type
            .split_once('/')
            .is_some_and(|(kind, _)| kind == top_level),
        None => media_type == pattern,
    }
}
