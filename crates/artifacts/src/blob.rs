//! Blob codec: files travel through tool payloads as
//! `{path, base64, md5}` triples, where `base64` is the
//! deflate-compressed file content and `md5` digests the raw bytes.
//!
//! Payload walking treats any JSON array whose members are all objects
//! as a media list; maps are walked recursively.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use serde_json::Value;

use cf_domain::{Error, Result};

/// A file encoded for transport inside a JSON payload.
#[derive(Debug, Clone)]
pub struct CompressedBlob {
    pub base64: String,
    pub md5: String,
    pub filename: String,
}

pub struct BlobCodec;

impl BlobCodec {
    /// Compress + encode a file for inlining. The digest covers the
    /// raw (uncompressed) bytes.
    pub fn compress_and_encode(path: &Path) -> Result<CompressedBlob> {
        let raw = fs::read(path)?;

        let mut hasher = Md5::new();
        hasher.update(&raw);
        let md5 = hex::encode(hasher.finalize());

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;

        Ok(CompressedBlob {
            base64: BASE64.encode(compressed),
            md5,
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string()),
        })
    }

    /// Decode an inlined blob back to a file, creating parent dirs.
    pub fn decompress_to_file(encoded: &str, dst: &Path) -> Result<()> {
        let compressed = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::invalid(format!("bad base64 blob: {e}")))?;

        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| Error::invalid(format!("bad deflate blob: {e}")))?;

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dst, raw)?;
        Ok(())
    }

    /// Digest of the raw bytes of a file, hex-encoded.
    pub fn md5_of_file(path: &Path) -> Result<String> {
        let raw = fs::read(path)?;
        let mut hasher = Md5::new();
        hasher.update(&raw);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn is_media_list(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty() && items.iter().all(Value::is_object),
        _ => false,
    }
}

/// Inline `{base64, md5}` for every media-list item carrying a `path`,
/// recursing through nested objects. Items whose file cannot be read
/// are left untouched.
pub fn inline_path_blobs(payload: &mut Value) {
    let Value::Object(map) = payload else {
        return;
    };
    for value in map.values_mut() {
        if is_media_list(value) {
            let Value::Array(items) = value else { continue };
            for item in items {
                let Some(obj) = item.as_object_mut() else { continue };
                let Some(path) = obj.get("path").and_then(Value::as_str).map(PathBuf::from)
                else {
                    continue;
                };
                match BlobCodec::compress_and_encode(&path) {
                    Ok(blob) => {
                        obj.insert("base64".into(), Value::String(blob.base64));
                        obj.insert("md5".into(), Value::String(blob.md5));
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "blob inline failed");
                    }
                }
            }
        } else if value.is_object() {
            inline_path_blobs(value);
        }
    }
}

/// Extract every inlined blob in the payload into `dir`, rewriting each
/// item's `path` to the on-disk location and dropping the `base64`
/// field. Items without a blob are left as-is.
pub fn extract_media_blobs(payload: &mut Value, dir: &Path, artifact_id: &str) -> Result<()> {
    let Value::Object(map) = payload else {
        return Ok(());
    };
    for value in map.values_mut() {
        if is_media_list(value) {
            let Value::Array(items) = value else { continue };
            for item in items {
                let Some(obj) = item.as_object_mut() else { continue };
                let Some(Value::String(encoded)) = obj.remove("base64") else {
                    continue;
                };
                let rel = obj
                    .get("path")
                    .and_then(Value::as_str)
                    .map(|p| {
                        Path::new(p)
                            .file_name()
                            .map(PathBuf::from)
                            .unwrap_or_else(|| PathBuf::from(p))
                    })
                    .unwrap_or_else(|| PathBuf::from(format!("{artifact_id}.bin")));
                let dst = dir.join(rel);
                tracing::info!(artifact_id, path = %dst.display(), "saving media blob");
                BlobCodec::decompress_to_file(&encoded, &dst)?;
                obj.insert(
                    "path".into(),
                    Value::String(dst.to_string_lossy().into_owned()),
                );
            }
        } else if value.is_object() {
            extract_media_blobs(value, dir, artifact_id)?;
        }
    }
    Ok(())
}
