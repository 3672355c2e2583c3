//! Per-session artifact persistence for pipeline step results, plus the
//! blob codec used to inline and extract binary media payloads.

pub mod blob;
pub mod store;

pub use blob::{extract_media_blobs, inline_path_blobs, BlobCodec, CompressedBlob};
pub use store::{ArtifactEnvelope, ArtifactMeta, ArtifactStore};
