use std::path::Path;
use anyhow::{Result, Context};
use infer::MatcherType;

/// MIME type from the file's magic bytes; None when no signature matches.
pub fn sniff_mimetype(path: &Path) -> Result<Option<&'static str>> {
    let kind = infer::get_from_path(path)
        .with_context(|| format!("Failed to read {:?} for type detection", path))?;
    Ok(kind.map(|k| k.mime_type()))
}

/// True when the magic bytes identify a video container. Unreadable files are not videos.
pub fn is_video(path: &Path) -> bool {
    matches!(
        infer::get_from_path(path),
        Ok(Some(kind)) if kind.matcher_type() == MatcherType::Video
    )
}
