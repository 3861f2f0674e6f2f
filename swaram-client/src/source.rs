//! File-backed frame source.
//!
//! Stands in for a camera: replays the JPEG files of a directory in name
//! order, wrapping around at the end.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use swaram_core::{CaptureError, FrameSource};
use tracing::debug;

#[derive(Debug)]
pub struct DirectorySource {
    frames: Vec<PathBuf>,
    cursor: AtomicUsize,
}

impl DirectorySource {
    /// Index the `.jpg` / `.jpeg` files under `dir`.
    pub async fn open(dir: &Path) -> Result<Self, CaptureError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut frames = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_jpeg(&path) {
                frames.push(path);
            }
        }
        frames.sort();

        if frames.is_empty() {
            return Err(CaptureError::Unavailable(format!(
                "no JPEG frames in {}",
                dir.display()
            )));
        }
        debug!(count = frames.len(), dir = %dir.display(), "frame directory indexed");
        Ok(Self::from_paths(frames))
    }

    pub fn from_paths(frames: Vec<PathBuf>) -> Self {
        Self {
            frames,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn capture(&self) -> Result<Bytes, CaptureError> {
        if self.frames.is_empty() {
            return Err(CaptureError::Unavailable("no frames".into()));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.frames.len();
        let data = tokio::fs::read(&self.frames[index]).await?;
        if data.is_empty() {
            return Err(CaptureError::Failed(format!(
                "{} is empty",
                self.frames[index].display()
            )));
        }
        Ok(Bytes::from(data))
    }
}
