//! Thumbnail generation.
//!
//! Images re-encode to a bounded 320×320 JPEG on the blocking pool.
//! Videos grab a single frame through an ffmpeg subprocess: three seek
//! strategies are tried in order (fast seek at 0.5s, accurate seek at
//! 0.5s, fast seek at 1.0s), each bounded by a timeout, writing to a
//! `.tmp.jpg` sibling that is renamed into place on success.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use cf_domain::Result;

pub const THUMB_MAX_SIZE: u32 = 320;
pub const FFMPEG_TIMEOUT: Duration = Duration::from_secs(20);

/// Placeholder shown when a video has no extractable thumbnail.
pub fn video_placeholder_svg() -> &'static [u8] {
    br##"<svg xmlns="http://www.w3.org/2000/svg" width="320" height="320" viewBox="0 0 320 320">
  <defs>
    <linearGradient id="g" x1="0" x2="1" y1="0" y2="1">
      <stop stop-color="#f2f2f2" offset="0"/>
      <stop stop-color="#e6e6e6" offset="1"/>
    </linearGradient>
  </defs>
  <rect x="0" y="0" width="320" height="320" fill="url(#g)"/>
  <rect x="22" y="22" width="276" height="276" rx="22" fill="rgba(0,0,0,0.06)"/>
  <polygon points="140,120 140,200 210,160" fill="rgba(0,0,0,0.55)"/>
</svg>"##
}

/// Bounded JPEG re-encode of an image. Runs synchronously; callers use
/// `spawn_blocking`.
pub fn make_image_thumbnail(src: &Path, dst: &Path) -> Result<()> {
    let img = image::open(src)
        .map_err(|e| cf_domain::Error::invalid(format!("image decode failed: {e}")))?;
    let thumb = img.thumbnail(THUMB_MAX_SIZE, THUMB_MAX_SIZE).into_rgb8();

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(dst)?;
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, 85);
    encoder
        .encode_image(&thumb)
        .map_err(|e| cf_domain::Error::invalid(format!("jpeg encode failed: {e}")))?;
    Ok(())
}

fn ffmpeg_bin() -> String {
    std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string())
}

fn scale_pad_filter() -> String {
    format!(
        "scale={s}:{s}:force_original_aspect_ratio=decrease,pad={s}:{s}:(ow-iw)/2:(oh-ih)/2",
        s = THUMB_MAX_SIZE
    )
}

/// Run one ffmpeg attempt; returns `(success, stderr)`.
async fn run_ffmpeg(args: &[String]) -> (bool, String) {
    let mut cmd = Command::new(ffmpeg_bin());
    cmd.args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return (false, format!("spawn failed: {e}")),
    };

    match tokio::time::timeout(FFMPEG_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            (output.status.success(), stderr)
        }
        Ok(Err(e)) => (false, format!("wait failed: {e}")),
        Err(_) => (false, format!("timeout after {}s", FFMPEG_TIMEOUT.as_secs())),
    }
}

/// Extract a single frame from `src` into `dst`. Returns `false` (not
/// an error) when every attempt fails; the caller serves a placeholder.
pub async fn make_video_thumbnail(src: &Path, dst: &Path) -> bool {
    if let Some(parent) = dst.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return false;
        }
    }

    let src_s = src.to_string_lossy().into_owned();
    let tmp = PathBuf::from(format!("{}.tmp.jpg", dst.to_string_lossy()));
    let tmp_s = tmp.to_string_lossy().into_owned();
    let vf = scale_pad_filter();

    let common_tail = |tmp_s: &str| -> Vec<String> {
        [
            "-an",
            "-frames:v",
            "1",
            "-vf",
            &vf,
            "-vcodec",
            "mjpeg",
            "-q:v",
            "3",
            "-f",
            "image2",
            tmp_s,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    };

    let head = ["-hide_banner", "-loglevel", "error", "-y"].map(str::to_string);
    let attempts: Vec<Vec<String>> = vec![
        // Fast seek: -ss before -i. Cheap but keyframe-sensitive.
        [head.to_vec(), vec!["-ss".into(), "0.5".into(), "-i".into(), src_s.clone()], common_tail(&tmp_s)].concat(),
        // Accurate seek: -ss after -i.
        [head.to_vec(), vec!["-i".into(), src_s.clone(), "-ss".into(), "0.5".into()], common_tail(&tmp_s)].concat(),
        // Later seek point for clips that fail right at the start.
        [head.to_vec(), vec!["-ss".into(), "1.0".into(), "-i".into(), src_s.clone()], common_tail(&tmp_s)].concat(),
    ];

    let mut last_err = String::new();
    for args in &attempts {
        let (ok, err) = run_ffmpeg(args).await;
        let produced = tmp.metadata().map(|m| m.len() > 0).unwrap_or(false);
        if ok && produced {
            if std::fs::rename(&tmp, dst).is_ok() {
                return true;
            }
        }
        if !err.is_empty() {
            last_err = err;
        }
        let _ = std::fs::remove_file(&tmp);
    }

    tracing::warn!(
        src = %src.display(),
        dst = %dst.display(),
        error = %last_err,
        "ffmpeg thumbnail failed"
    );
    let _ = std::fs::remove_file(&tmp);
    false
}
