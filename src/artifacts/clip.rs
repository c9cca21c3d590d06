//! Best-effort video clip encoding from persisted frames via ffmpeg.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{ClipMode, ClipOptions};
use crate::models::ImageFormat;

const ENCODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Whether an `ffmpeg` binary is on PATH and responsive.
pub fn is_ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Encode `frames_dir/*.{ext}` into `out_path`.
///
/// Returns `Ok(true)` when a clip was written, `Ok(false)` when skipped
/// (mode `auto` with no encoder available). Mode `on` without an encoder
/// warns and skips.
pub(super) fn generate_clip(
    frames_dir: &Path,
    out_path: &Path,
    options: &ClipOptions,
    frame_format: ImageFormat,
) -> Result<bool, String> {
    match options.mode {
        ClipMode::Off => return Ok(false),
        ClipMode::Auto => {
            if !is_ffmpeg_available() {
                debug!("ffmpeg unavailable, skipping clip generation (mode=auto)");
                return Ok(false);
            }
        }
        ClipMode::On => {
            if !is_ffmpeg_available() {
                warn!("ffmpeg unavailable, cannot generate clip (mode=on)");
                return Ok(false);
            }
        }
    }

    let pattern = frames_dir
        .join(format!("*.{}", frame_format.extension()))
        .to_string_lossy()
        .to_string();

    let mut command = Command::new("ffmpeg");
    command
        .arg("-y")
        .arg("-framerate")
        .arg(options.fps.max(1).to_string())
        .arg("-pattern_type")
        .arg("glob")
        .arg("-i")
        .arg(&pattern);
    if let Some(seconds) = options.seconds {
        command.arg("-t").arg(format!("{seconds}"));
    }
    command
        .arg("-c:v")
        .arg("libx264")
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg(out_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = command.spawn().map_err(|e| format!("spawn ffmpeg: {e}"))?;

    // Bounded wait; a wedged encoder must not stall persistence.
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return Ok(true);
                }
                return Err(format!("ffmpeg exited with {status}"));
            }
            Ok(None) => {
                if start.elapsed() >= ENCODE_TIMEOUT {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!(
                        "ffmpeg timed out after {}s",
                        ENCODE_TIMEOUT.as_secs()
                    ));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(format!("wait on ffmpeg: {e}")),
        }
    }
}
