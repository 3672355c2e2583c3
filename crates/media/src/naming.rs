//! Naming helpers for stored media: sanitizing, kind detection, and the
//! `media_NNNN` sequence format.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const MEDIA_PREFIX: &str = "media_";
pub const MEDIA_SEQ_WIDTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Unknown,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Unknown => "unknown",
        }
    }
}

/// Strip any directory components and NUL bytes; empty names become
/// `unnamed`.
pub fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let clean: String = base.chars().filter(|c| *c != '\0').collect();
    if clean.is_empty() {
        "unnamed".to_string()
    } else {
        clean
    }
}

pub fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

pub fn detect_media_kind(filename: &str) -> MediaKind {
    match file_extension(filename).as_str() {
        ".png" | ".jpg" | ".jpeg" | ".gif" | ".bmp" | ".webp" => MediaKind::Image,
        ".mp4" | ".mov" | ".avi" | ".mkv" | ".webm" => MediaKind::Video,
        _ => MediaKind::Unknown,
    }
}

/// `media_0001.mp4` for `(1, ".mp4")`.
pub fn make_store_filename(seq: u32, ext: &str) -> String {
    let mut ext = ext.to_lowercase();
    if !ext.is_empty() && !ext.starts_with('.') {
        ext.insert(0, '.');
    }
    format!("{MEDIA_PREFIX}{seq:0width$}{ext}", width = MEDIA_SEQ_WIDTH)
}

fn media_seq_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^media_(\d+)").expect("valid regex"))
}

/// Sequence number of a stored media filename, if it follows the
/// `media_NNNN` convention.
pub fn parse_media_seq(filename: &str) -> Option<u32> {
    let base = Path::new(filename).file_name()?.to_string_lossy().into_owned();
    media_seq_re()
        .captures(&base)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// MIME type by extension; `application/octet-stream` when unknown.
pub fn guess_media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Whether `path`, after symlink resolution, stays inside `root`.
/// Unresolvable paths are treated as outside.
pub fn is_under_dir(path: &Path, root: &Path) -> bool {
    let resolved_root = match root.canonicalize() {
        Ok(r) => r,
        Err(_) => return false,
    };
    // The file itself may not exist yet; resolve the deepest existing
    // ancestor and re-append the remainder.
    match path.canonicalize() {
        Ok(p) => p.starts_with(&resolved_root),
        Err(_) => {
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                return false;
            };
            match parent.canonicalize() {
                Ok(p) => PathBuf::from(p).join(name).starts_with(&resolved_root),
                Err(_) => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir/clip.mp4"), "clip.mp4");
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename("a\0b.png"), "ab.png");
    }

    #[test]
    fn kind_detection() {
        assert_eq!(detect_media_kind("x.PNG"), MediaKind::Image);
        assert_eq!(detect_media_kind("clip.webm"), MediaKind::Video);
        assert_eq!(detect_media_kind("notes.txt"), MediaKind::Unknown);
        assert_eq!(detect_media_kind("noext"), MediaKind::Unknown);
    }

    #[test]
    fn store_filename_format() {
        assert_eq!(make_store_filename(1, ".mp4"), "media_0001.mp4");
        assert_eq!(make_store_filename(42, "JPG"), "media_0042.jpg");
        assert_eq!(make_store_filename(12345, ""), "media_12345");
    }

    #[test]
    fn seq_parsing() {
        assert_eq!(parse_media_seq("media_0001.mp4"), Some(1));
        assert_eq!(parse_media_seq("MEDIA_0123.png"), Some(123));
        assert_eq!(parse_media_seq("/a/b/media_0009.jpg"), Some(9));
        assert_eq!(parse_media_seq("thumb_0001.jpg"), None);
        assert_eq!(parse_media_seq(""), None);
    }

    #[test]
    fn names_roundtrip_through_parse() {
        for seq in [1u32, 99, 1000, 9999] {
            assert_eq!(parse_media_seq(&make_store_filename(seq, ".mp4")), Some(seq));
        }
    }

    #[test]
    fn containment_accepts_children_rejects_escapes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/f.bin"), b"x").unwrap();

        assert!(is_under_dir(&root.join("sub/f.bin"), root));
        assert!(is_under_dir(&root.join("sub/not_yet_created.bin"), root));
        assert!(!is_under_dir(&root.join("../outside"), root));
        assert!(!is_under_dir(Path::new("/etc/passwd"), root));
    }

    #[test]
    fn containment_resolves_symlinks() {
        let outer = tempdir().unwrap();
        let root = tempdir().unwrap();
        let target = outer.path().join("secret.txt");
        std::fs::write(&target, b"s").unwrap();
        let link = root.path().join("link.txt");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&target, &link).unwrap();
            assert!(!is_under_dir(&link, root.path()));
        }
    }
}
