use super::CaptureSource;
use crate::error::MediaError;
use crate::frame::{Frame, FrameMarker};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::sync::mpsc;
use std::thread;
use tokio::sync::watch;

/// Webcam read on a dedicated thread.
///
/// The thread decodes frames as fast as the device delivers them and publishes
/// only the newest one, so a slow consumer never builds a backlog.
pub struct WebcamCapture {
    frames: watch::Receiver<Option<Frame>>,
    width: u32,
    height: u32,
    fps: f64,
}

impl WebcamCapture {
    /// Opens the device and waits for its first frame.
    pub fn new(device_index: u32) -> Result<Self, MediaError> {
        tracing::info!("Initializing webcam {}", device_index);

        let (frame_tx, frame_rx) = watch::channel(None);
        let (open_tx, open_rx) = mpsc::channel();

        thread::Builder::new()
            .name("webcam".into())
            .spawn(move || run_camera(device_index, frame_tx, open_tx))
            .map_err(|err| MediaError::CameraUnavailable(err.to_string()))?;

        let (width, height, fps) = open_rx
            .recv()
            .map_err(|_| MediaError::CameraUnavailable("camera thread exited".into()))??;

        tracing::info!("Webcam initialized successfully ({}x{} @ {} fps)", width, height, fps);

        Ok(Self {
            frames: frame_rx,
            width,
            height,
            fps,
        })
    }
}

type OpenResult = Result<(u32, u32, f64), MediaError>;

fn run_camera(
    device_index: u32,
    frames: watch::Sender<Option<Frame>>,
    opened: mpsc::Sender<OpenResult>,
) {
    let index = CameraIndex::Index(device_index);
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

    let mut camera = match Camera::new(index, requested).and_then(|mut camera| {
        camera.open_stream()?;
        Ok(camera)
    }) {
        Ok(camera) => camera,
        Err(err) => {
            let _ = opened.send(Err(MediaError::CameraUnavailable(err.to_string())));
            return;
        }
    };

    let format = camera.camera_format();
    let fps = f64::from(format.frame_rate());
    let mut opened = Some(opened);
    let mut marker = 0u64;

    loop {
        let decoded = camera
            .frame()
            .and_then(|buffer| buffer.decode_image::<RgbFormat>());
        let image = match decoded {
            Ok(image) => image,
            Err(err) => {
                tracing::error!("Failed to capture frame: {}", err);
                if let Some(opened) = opened.take() {
                    let _ = opened.send(Err(MediaError::CameraUnavailable(err.to_string())));
                }
                break;
            }
        };

        if let Some(opened) = opened.take() {
            let (width, height) = image.dimensions();
            let _ = opened.send(Ok((width, height, fps)));
        }

        if frames.send(Some(Frame::new(image, FrameMarker(marker)))).is_err() {
            // Capture dropped
            break;
        }
        marker += 1;
    }

    let _ = camera.stop_stream();
}

impl CaptureSource for WebcamCapture {
    fn latest_frame(&mut self) -> Result<Frame, MediaError> {
        if self.frames.has_changed().is_err() {
            return Err(MediaError::CameraStopped);
        }
        self.frames
            .borrow_and_update()
            .clone()
            .ok_or(MediaError::CameraStopped)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn native_fps(&self) -> f64 {
        self.fps
    }
}
