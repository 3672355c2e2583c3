//! Media store: filesystem operations for one session's uploaded
//! assets. Saves never overwrite an existing target; deletion only
//! touches files that resolve inside the media directory.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt};

use cf_domain::{short_hex_id, unix_now, Error, Result};

use crate::naming::{
    detect_media_kind, is_under_dir, sanitize_filename, MediaKind,
};
use crate::thumbs;

/// Metadata for one stored asset.
#[derive(Debug, Clone, Serialize)]
pub struct MediaMeta {
    pub id: String,
    /// Display name (the original upload filename).
    pub name: String,
    pub kind: MediaKind,
    /// On-disk path of the stored file (`media_NNNN.<ext>`).
    pub path: PathBuf,
    pub thumb_path: Option<PathBuf>,
    pub ts: f64,
}

pub struct MediaStore {
    media_dir: PathBuf,
    thumbs_dir: PathBuf,
    uploads_dir: PathBuf,
}

impl MediaStore {
    pub fn new(media_dir: impl Into<PathBuf>) -> Result<Self> {
        let media_dir = media_dir.into();
        let thumbs_dir = media_dir.join(".thumbs");
        let uploads_dir = media_dir.join(".uploads");
        std::fs::create_dir_all(&media_dir)?;
        std::fs::create_dir_all(&thumbs_dir)?;
        std::fs::create_dir_all(&uploads_dir)?;
        Ok(Self {
            media_dir,
            thumbs_dir,
            uploads_dir,
        })
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Directory holding in-flight resumable `.part` files.
    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// Stream an upload body into `<media_dir>/<store_filename>`.
    /// Fails with `Conflict` if the target already exists.
    pub async fn save_upload<R>(
        &self,
        reader: &mut R,
        store_filename: &str,
        display_name: &str,
    ) -> Result<MediaMeta>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let store_filename = sanitize_filename(store_filename);
        let display_name = sanitize_filename(display_name);
        let save_path = self.media_dir.join(&store_filename);

        if save_path.exists() {
            return Err(Error::Conflict(format!(
                "media filename exists: {store_filename}"
            )));
        }

        let mut out = tokio::fs::File::create(&save_path).await?;
        tokio::io::copy(reader, &mut out).await?;
        out.flush().await?;
        drop(out);

        self.finish_meta(save_path, display_name).await
    }

    /// Promote a pre-written temp file (resumable completion) to its
    /// final store path via atomic rename.
    pub async fn save_from_path(
        &self,
        src: &Path,
        store_filename: &str,
        display_name: &str,
    ) -> Result<MediaMeta> {
        let store_filename = sanitize_filename(store_filename);
        let display_name = sanitize_filename(display_name);

        if !src.exists() {
            return Err(Error::invalid("upload temp file missing"));
        }
        let save_path = self.media_dir.join(&store_filename);
        if save_path.exists() {
            return Err(Error::Conflict(format!(
                "media already exists: {store_filename}"
            )));
        }

        tokio::fs::rename(src, &save_path).await?;
        self.finish_meta(save_path, display_name).await
    }

    /// Remove the stored file and its thumbnail. Paths that resolve
    /// outside the media directory are skipped, never deleted.
    pub async fn delete_files(&self, meta: &MediaMeta) {
        let mut targets = vec![meta.path.clone()];
        if let Some(thumb) = &meta.thumb_path {
            targets.push(thumb.clone());
        }
        for path in targets {
            if !is_under_dir(&path, &self.media_dir) {
                tracing::warn!(path = %path.display(), "refusing delete outside media dir");
                continue;
            }
            if path.is_dir() {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "media delete failed");
                }
            }
        }
    }

    // ── Private ──────────────────────────────────────────────────────

    async fn finish_meta(&self, save_path: PathBuf, display_name: String) -> Result<MediaMeta> {
        let media_id = short_hex_id(10);
        let kind = detect_media_kind(&display_name);
        let thumb_path = self.make_thumbnail(&media_id, kind, &save_path).await;

        Ok(MediaMeta {
            id: media_id,
            name: display_name,
            kind,
            path: save_path,
            thumb_path,
            ts: unix_now(),
        })
    }

    /// Image thumb failures fall back to the original file; video thumb
    /// failures yield `None` and the thumb endpoint serves a
    /// placeholder.
    async fn make_thumbnail(
        &self,
        media_id: &str,
        kind: MediaKind,
        save_path: &Path,
    ) -> Option<PathBuf> {
        let thumb_path = self.thumbs_dir.join(format!("{media_id}.jpg"));
        match kind {
            MediaKind::Image => {
                let src = save_path.to_path_buf();
                let dst = thumb_path.clone();
                let made = tokio::task::spawn_blocking(move || {
                    thumbs::make_image_thumbnail(&src, &dst).is_ok()
                })
                .await
                .unwrap_or(false);
                if made {
                    Some(thumb_path)
                } else {
                    Some(save_path.to_path_buf())
                }
            }
            MediaKind::Video => {
                if thumbs::make_video_thumbnail(save_path, &thumb_path).await {
                    Some(thumb_path)
                } else {
                    None
                }
            }
            MediaKind::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn save_bytes(store: &MediaStore, data: &[u8], store_name: &str, display: &str) -> Result<MediaMeta> {
        let mut reader = std::io::Cursor::new(data.to_vec());
        store.save_upload(&mut reader, store_name, display).await
    }

    #[tokio::test]
    async fn save_upload_writes_file_and_meta() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("media")).unwrap();

        let meta = save_bytes(&store, b"x", "media_0001.bin", "notes.bin")
            .await
            .unwrap();
        assert_eq!(meta.name, "notes.bin");
        assert_eq!(meta.kind, MediaKind::Unknown);
        assert_eq!(meta.id.len(), 10);
        assert_eq!(std::fs::read(&meta.path).unwrap(), b"x");
        assert!(meta.thumb_path.is_none());
    }

    #[tokio::test]
    async fn save_upload_conflicts_on_existing_target() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("media")).unwrap();

        save_bytes(&store, b"1", "media_0001.bin", "a.bin").await.unwrap();
        match save_bytes(&store, b"2", "media_0001.bin", "b.bin").await {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_upload_gets_a_thumbnail() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("media")).unwrap();

        let img = image::RgbImage::from_pixel(640, 480, image::Rgb([0, 120, 240]));
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let meta = save_bytes(&store, &png, "media_0001.png", "photo.png")
            .await
            .unwrap();
        assert_eq!(meta.kind, MediaKind::Image);
        let thumb = meta.thumb_path.unwrap();
        assert!(thumb.to_string_lossy().contains(".thumbs"));
        assert!(thumb.exists());
    }

    #[tokio::test]
    async fn broken_image_falls_back_to_original() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("media")).unwrap();

        let meta = save_bytes(&store, b"not a png", "media_0001.png", "bad.png")
            .await
            .unwrap();
        assert_eq!(meta.thumb_path.as_deref(), Some(meta.path.as_path()));
    }

    #[tokio::test]
    async fn save_from_path_promotes_tmp() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("media")).unwrap();

        let tmp = store.uploads_dir().join("u1.part");
        std::fs::write(&tmp, b"chunked content").unwrap();

        let meta = store
            .save_from_path(&tmp, "media_0002.bin", "big.bin")
            .await
            .unwrap();
        assert!(!tmp.exists());
        assert_eq!(std::fs::read(&meta.path).unwrap(), b"chunked content");
    }

    #[tokio::test]
    async fn delete_removes_file_but_never_outside_root() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("media")).unwrap();

        let meta = save_bytes(&store, b"x", "media_0001.bin", "a.bin").await.unwrap();
        let stored = meta.path.clone();
        store.delete_files(&meta).await;
        assert!(!stored.exists());

        // A meta pointing outside the media dir must be left alone.
        let outside = dir.path().join("precious.txt");
        std::fs::write(&outside, b"keep me").unwrap();
        let rogue = MediaMeta {
            id: "rogue".into(),
            name: "precious.txt".into(),
            kind: MediaKind::Unknown,
            path: outside.clone(),
            thumb_path: None,
            ts: 0.0,
        };
        store.delete_files(&rogue).await;
        assert!(outside.exists());
    }
}
