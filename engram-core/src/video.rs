//! Video frame extraction via ffmpeg.
//!
//! Video preprocessing sends a representative frame to the vision model.
//! The extractor probes the duration with ffprobe, seeks to the midpoint
//! (or to N evenly spaced timestamps), and writes JPEG frames to temp
//! files the caller removes after the vision call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

const FFMPEG_TIMEOUT: Duration = Duration::from_secs(30);

/// ffmpeg-backed frame extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameExtractor;

impl FrameExtractor {
    /// Probe whether ffmpeg is installed and runnable.
    pub async fn is_available() -> bool {
        match tokio::time::timeout(
            Duration::from_secs(5),
            Command::new("ffmpeg").arg("-version").output(),
        )
        .await
        {
            Ok(Ok(output)) => output.status.success(),
            _ => false,
        }
    }

    /// Extract the middle frame of a video to a temp JPEG.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ingest`] when ffprobe/ffmpeg fail or produce no
    /// output file.
    pub async fn extract_middle_frame(video_path: &Path) -> Result<PathBuf> {
        let duration = Self::probe_duration(video_path).await?;
        let frames = Self::extract_frames_at(video_path, &[duration / 2.0]).await?;
        frames
            .into_iter()
            .next()
            .ok_or_else(|| Error::Ingest("frame extraction produced no output".to_string()))
    }

    /// Extract `count` evenly spaced frames to temp JPEGs.
    pub async fn extract_spaced_frames(video_path: &Path, count: usize) -> Result<Vec<PathBuf>> {
        let duration = Self::probe_duration(video_path).await?;
        let count = count.max(1);
        // Midpoints of equal slices, so one frame degenerates to the middle.
        let timestamps: Vec<f64> = (0..count)
            .map(|i| duration * (2 * i + 1) as f64 / (2 * count) as f64)
            .collect();
        Self::extract_frames_at(video_path, &timestamps).await
    }

    async fn probe_duration(video_path: &Path) -> Result<f64> {
        let output = Self::run(
            Command::new("ffprobe")
                .arg("-v")
                .arg("error")
                .arg("-show_entries")
                .arg("format=duration")
                .arg("-of")
                .arg("default=noprint_wrappers=1:nokey=1")
                .arg(video_path),
        )
        .await?;
        let text = String::from_utf8_lossy(&output);
        text.trim()
            .parse::<f64>()
            .map_err(|_| Error::Ingest(format!("ffprobe returned no duration: {}", text.trim())))
    }

    async fn extract_frames_at(video_path: &Path, timestamps: &[f64]) -> Result<Vec<PathBuf>> {
        let mut frames = Vec::with_capacity(timestamps.len());
        for timestamp in timestamps {
            let output_path =
                std::env::temp_dir().join(format!("engram-frame-{}.jpg", Uuid::new_v4().simple()));
            Self::run(
                Command::new("ffmpeg")
                    .arg("-ss")
                    .arg(timestamp.to_string())
                    .arg("-i")
                    .arg(video_path)
                    .arg("-vframes")
                    .arg("1")
                    .arg("-q:v")
                    .arg("2")
                    .arg("-y")
                    .arg(&output_path),
            )
            .await?;
            if !output_path.exists() {
                return Err(Error::Ingest(format!(
                    "frame extraction produced no file at {}",
                    output_path.display()
                )));
            }
            debug!(frame = %output_path.display(), timestamp, "extracted video frame");
            frames.push(output_path);
        }
        Ok(frames)
    }

    async fn run(command: &mut Command) -> Result<Vec<u8>> {
        let output = tokio::time::timeout(FFMPEG_TIMEOUT, command.output())
            .await
            .map_err(|_| Error::Ingest("video processing timed out".to_string()))?
            .map_err(|e| Error::Ingest(format!("failed to spawn ffmpeg: {e}")))?;
        if !output.status.success() {
            return Err(Error::Ingest(format!(
                "ffmpeg/ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaced_timestamps_cover_the_middle() {
        // One frame lands at duration/2; the helper math is inlined here.
        let duration: f64 = 10.0;
        let midpoint = duration * 1.0 / 2.0;
        assert!((midpoint - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn probe_on_missing_binary_or_file_errors() {
        let err = FrameExtractor::extract_middle_frame(Path::new("/nonexistent/clip.mp4")).await;
        assert!(err.is_err());
    }
}
