//! Webcam capture via nokhwa.
//!
//! The camera handle is not `Send` on every backend, so it lives on its own
//! thread for the whole session. Capture requests reach that thread over a
//! channel and each one answers with a freshly encoded frame.

use std::future::Future;
use std::thread::JoinHandle;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use tokio::sync::{mpsc, oneshot};

use crate::capture::Capture;
use crate::error::CaptureError;
use crate::frame::{CaptureOptions, FramePayload, ImageFormat};

struct CaptureRequest {
    options: CaptureOptions,
    reply: oneshot::Sender<Result<FramePayload, CaptureError>>,
}

/// A camera opened on a dedicated device thread.
pub struct WebcamCapture {
    requests: Option<mpsc::Sender<CaptureRequest>>,
    device_thread: Option<JoinHandle<()>>,
}

impl WebcamCapture {
    /// Open camera `index` and start streaming from it.
    pub fn open(index: u32) -> Result<Self, CaptureError> {
        let (requests, request_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        let device_thread = std::thread::Builder::new()
            .name(format!("webcam-{index}"))
            .spawn(move || run_device(index, request_rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(WebcamCapture {
                requests: Some(requests),
                device_thread: Some(device_thread),
            }),
            Ok(Err(e)) => {
                let _ = device_thread.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::Stopped),
        }
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        // Closing the request channel ends the device loop.
        self.requests = None;
        if let Some(handle) = self.device_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Capture for WebcamCapture {
    fn capture(
        &self,
        options: &CaptureOptions,
    ) -> impl Future<Output = Result<FramePayload, CaptureError>> + Send {
        let requests = self.requests.clone();
        let options = *options;
        async move {
            let requests = requests.ok_or(CaptureError::Stopped)?;
            let (reply, reply_rx) = oneshot::channel();
            requests
                .send(CaptureRequest { options, reply })
                .await
                .map_err(|_| CaptureError::Stopped)?;
            reply_rx.await.map_err(|_| CaptureError::Stopped)?
        }
    }
}

fn run_device(
    index: u32,
    mut requests: mpsc::Receiver<CaptureRequest>,
    ready: std::sync::mpsc::SyncSender<Result<(), CaptureError>>,
) {
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera = match Camera::new(CameraIndex::Index(index), format)
        .and_then(|mut cam| cam.open_stream().map(|()| cam))
    {
        Ok(cam) => cam,
        Err(e) => {
            let _ = ready.send(Err(CaptureError::Unavailable(e.to_string())));
            return;
        }
    };
    tracing::info!("Camera {} streaming at {:?}", index, camera.camera_format());
    let _ = ready.send(Ok(()));

    while let Some(request) = requests.blocking_recv() {
        let result = grab(&mut camera, &request.options);
        let _ = request.reply.send(result);
    }

    if let Err(e) = camera.stop_stream() {
        tracing::debug!("failed to stop camera {}: {}", index, e);
    }
    tracing::info!("Camera {} released", index);
}

fn grab(camera: &mut Camera, options: &CaptureOptions) -> Result<FramePayload, CaptureError> {
    let frame = camera
        .frame()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let rgb = frame
        .decode_image::<RgbFormat>()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let (width, height) = (rgb.width(), rgb.height());
    encode_rgb(rgb.as_raw(), width, height, options)
}

/// Compress one RGB8 image according to `options`.
pub fn encode_rgb(
    rgb: &[u8],
    width: u32,
    height: u32,
    options: &CaptureOptions,
) -> Result<FramePayload, CaptureError> {
    let mut out = Vec::new();
    let encoded = match options.format {
        ImageFormat::Jpeg => JpegEncoder::new_with_quality(&mut out, options.encoder_quality())
            .encode(rgb, width, height, ExtendedColorType::Rgb8),
        ImageFormat::Png => {
            PngEncoder::new_with_quality(&mut out, CompressionType::Default, FilterType::Adaptive)
                .write_image(rgb, width, height, ExtendedColorType::Rgb8)
        }
    };
    encoded.map_err(|e| CaptureError::Encode(e.to_string()))?;
    Ok(FramePayload::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| {
                let v = (i % 256) as u8;
                [v, v / 2, 255 - v]
            })
            .collect()
    }

    #[test]
    fn jpeg_has_soi_marker() {
        let frame = encode_rgb(&gradient(16, 8), 16, 8, &CaptureOptions::default()).unwrap();
        assert_eq!(&frame.as_bytes()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn png_has_signature() {
        let opts = CaptureOptions {
            format: ImageFormat::Png,
            ..Default::default()
        };
        let frame = encode_rgb(&gradient(4, 4), 4, 4, &opts).unwrap();
        assert_eq!(&frame.as_bytes()[1..4], b"PNG");
    }
}
