//! Resumable chunked uploads.
//!
//! Each upload owns a pre-created `.part` temp file; chunks write at
//! absolute offsets derived from their index, so re-sends are
//! idempotent. A per-upload async mutex serializes chunk writes and
//! the close transition.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use cf_domain::{unix_now, Error, Result};
use cf_media::MediaKind;

#[derive(Debug)]
struct UploadState {
    received: HashSet<u32>,
    closed: bool,
}

pub struct ResumableUpload {
    pub upload_id: String,
    /// Original filename, shown in the UI.
    pub filename: String,
    /// Store name reserved at init time (`media_NNNN.<ext>`).
    pub store_filename: String,
    pub size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub tmp_path: PathBuf,
    pub kind: MediaKind,
    pub created_ts: f64,
    /// Unix seconds of the last chunk/init activity, read lock-free by
    /// the TTL reaper.
    last_activity: AtomicU64,
    state: Mutex<UploadState>,
}

impl ResumableUpload {
    pub fn new(
        upload_id: String,
        filename: String,
        store_filename: String,
        size: u64,
        chunk_size: u64,
        tmp_path: PathBuf,
        kind: MediaKind,
    ) -> Self {
        let total_chunks = size.div_ceil(chunk_size.max(1)) as u32;
        let now = unix_now();
        Self {
            upload_id,
            filename,
            store_filename,
            size,
            chunk_size: chunk_size.max(1),
            total_chunks,
            tmp_path,
            kind,
            created_ts: now,
            last_activity: AtomicU64::new(now as u64),
            state: Mutex::new(UploadState {
                received: HashSet::new(),
                closed: false,
            }),
        }
    }

    pub fn touch(&self) {
        self.last_activity.store(unix_now() as u64, Ordering::Relaxed);
    }

    /// Seconds since the last activity.
    pub fn idle_secs(&self, now: f64) -> u64 {
        (now as u64).saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    /// Byte length chunk `index` must carry (the last chunk may be
    /// short).
    pub fn expected_len(&self, index: u32) -> Result<u64> {
        if index >= self.total_chunks {
            return Err(Error::invalid("invalid chunk index"));
        }
        let offset = index as u64 * self.chunk_size;
        let remaining = self
            .size
            .checked_sub(offset)
            .ok_or_else(|| Error::invalid("invalid chunk index"))?;
        if remaining == 0 {
            return Err(Error::invalid("invalid chunk index"));
        }
        Ok(remaining.min(self.chunk_size))
    }

    /// Write one chunk at its absolute offset. Returns the number of
    /// received chunks after the write.
    pub async fn write_chunk(&self, index: u32, data: &[u8]) -> Result<usize> {
        let expected = self.expected_len(index)?;
        if data.len() as u64 > expected {
            return Err(Error::invalid("chunk too large"));
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::invalid("upload already closed"));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.tmp_path)
            .await?;
        file.seek(std::io::SeekFrom::Start(index as u64 * self.chunk_size))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;

        if data.len() as u64 != expected {
            return Err(Error::invalid(format!(
                "chunk size mismatch: {} != {}",
                data.len(),
                expected
            )));
        }

        state.received.insert(index);
        self.touch();
        Ok(state.received.len())
    }

    /// Close the upload for completion. Fails when chunks are missing;
    /// the upload stays closed either way.
    pub async fn seal(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.closed = true;
        let received = state.received.len() as u32;
        if received != self.total_chunks {
            return Err(Error::invalid(format!(
                "chunks missing: {}",
                self.total_chunks - received
            )));
        }
        Ok(())
    }

    /// Close and remove the temp file.
    pub async fn abort(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        drop(state);
        if let Err(e) = tokio::fs::remove_file(&self.tmp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(upload_id = %self.upload_id, error = %e, "tmp cleanup failed");
            }
        }
    }

    pub async fn received_count(&self) -> usize {
        self.state.lock().await.received.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn upload(dir: &std::path::Path, size: u64, chunk_size: u64) -> ResumableUpload {
        let tmp = dir.join("u1.part");
        std::fs::write(&tmp, b"").unwrap();
        ResumableUpload::new(
            "u1".into(),
            "big.mp4".into(),
            "media_0001.mp4".into(),
            size,
            chunk_size,
            tmp,
            MediaKind::Video,
        )
    }

    #[test]
    fn total_chunks_rounds_up() {
        let dir = tempdir().unwrap();
        assert_eq!(upload(dir.path(), 10_485_761, 8_388_608).total_chunks, 2);
        assert_eq!(upload(dir.path(), 8_388_608, 8_388_608).total_chunks, 1);
        assert_eq!(upload(dir.path(), 1, 8_388_608).total_chunks, 1);
    }

    #[test]
    fn expected_len_handles_short_tail() {
        let dir = tempdir().unwrap();
        let u = upload(dir.path(), 10, 8);
        assert_eq!(u.expected_len(0).unwrap(), 8);
        assert_eq!(u.expected_len(1).unwrap(), 2);
        assert!(u.expected_len(2).is_err());
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble_correctly() {
        let dir = tempdir().unwrap();
        let u = upload(dir.path(), 10, 8);

        // Tail first, then head.
        assert_eq!(u.write_chunk(1, b"89").await.unwrap(), 1);
        assert_eq!(u.write_chunk(0, b"01234567").await.unwrap(), 2);

        u.seal().await.unwrap();
        let content = std::fs::read(&u.tmp_path).unwrap();
        assert_eq!(content, b"0123456789");
    }

    #[tokio::test]
    async fn resent_chunk_overwrites_same_offset() {
        let dir = tempdir().unwrap();
        let u = upload(dir.path(), 4, 4);
        u.write_chunk(0, b"AAAA").await.unwrap();
        assert_eq!(u.write_chunk(0, b"BBBB").await.unwrap(), 1);
        assert_eq!(std::fs::read(&u.tmp_path).unwrap(), b"BBBB");
    }

    #[tokio::test]
    async fn wrong_length_chunk_is_rejected() {
        let dir = tempdir().unwrap();
        let u = upload(dir.path(), 10, 8);
        assert!(u.write_chunk(0, b"short").await.is_err());
        assert!(u.write_chunk(1, b"too long").await.is_err());
        assert_eq!(u.received_count().await, 0);
    }

    #[tokio::test]
    async fn seal_requires_all_chunks() {
        let dir = tempdir().unwrap();
        let u = upload(dir.path(), 10, 8);
        u.write_chunk(0, b"01234567").await.unwrap();
        let err = u.seal().await.unwrap_err();
        assert!(err.to_string().contains("chunks missing: 1"));

        // Sealed: further chunks are refused.
        assert!(u.write_chunk(1, b"89").await.is_err());
    }

    #[tokio::test]
    async fn abort_removes_tmp_file() {
        let dir = tempdir().unwrap();
        let u = upload(dir.path(), 4, 4);
        assert!(u.tmp_path.exists());
        u.abort().await;
        assert!(!u.tmp_path.exists());
        // Idempotent.
        u.abort().await;
    }
}
