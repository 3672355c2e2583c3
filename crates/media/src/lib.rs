//! Filesystem layer for uploaded assets: deterministic store naming,
//! streamed saves, thumbnails, and containment-checked deletion.

pub mod naming;
pub mod store;
pub mod thumbs;

pub use naming::{
    detect_media_kind, file_extension, guess_media_type, is_under_dir, make_store_filename,
    parse_media_seq, sanitize_filename, MediaKind, MEDIA_PREFIX, MEDIA_SEQ_WIDTH,
};
pub use store::{MediaMeta, MediaStore};
