//! Capture collaborators: anything that can produce one compressed frame on
//! demand.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::CaptureError;
use crate::frame::{CaptureOptions, FramePayload, ImageFormat};

/// Produces one compressed frame per call.
///
/// Called at most once at a time by the capture loop, but shared with it
/// behind an `Arc`, so implementations take `&self`.
pub trait Capture: Send + Sync + 'static {
    fn capture(
        &self,
        options: &CaptureOptions,
    ) -> impl Future<Output = Result<FramePayload, CaptureError>> + Send;
}

/// Replays pre-compressed image files from a directory, in name order,
/// wrapping around at the end.
///
/// Files are sent as-is, so `options` only selects which files are eligible
/// (by extension) when the source is opened.
#[derive(Debug)]
pub struct ReplayCapture {
    files: Vec<PathBuf>,
    next: AtomicUsize,
}

impl ReplayCapture {
    pub fn open(dir: impl AsRef<Path>, format: ImageFormat) -> Result<Self, CaptureError> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && matches_format(path, format))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CaptureError::Unavailable(format!(
                "no {:?} files in {}",
                format,
                dir.display()
            )));
        }
        tracing::info!("Replaying {} frames from {}", files.len(), dir.display());
        Ok(ReplayCapture {
            files,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn matches_format(path: &Path, format: ImageFormat) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    match format {
        ImageFormat::Jpeg => ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"),
        ImageFormat::Png => ext.eq_ignore_ascii_case("png"),
    }
}

impl Capture for ReplayCapture {
    fn capture(
        &self,
        _options: &CaptureOptions,
    ) -> impl Future<Output = Result<FramePayload, CaptureError>> + Send {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.files.len();
        let path = self.files[idx].clone();
        async move {
            let data = tokio::fs::read(&path).await?;
            tracing::trace!("replayed {} ({} bytes)", path.display(), data.len());
            Ok(FramePayload::new(data))
        }
    }
}
