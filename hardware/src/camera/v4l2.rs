//! V4L2 capture backend (Linux).
//!
//! Negotiates YUYV at the requested resolution, streams via mmap buffers
//! and converts to RGB for JPEG encoding. YUYV was chosen because every
//! UVC camera we have fielded supports it, while RGB3 support is rare.

use tracing::debug;
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::backend::{CaptureBackend, FrameGrabber, RawFrame};
use super::device::{scan_video_devices, DeviceTarget};
use super::manager::CameraSettings;
use super::{CameraError, CameraResult};

const FOURCC_YUYV: &[u8; 4] = b"YUYV";

pub struct V4l2Backend;

impl V4l2Backend {
    fn open_device(target: &DeviceTarget) -> CameraResult<Device> {
        let result = match target {
            DeviceTarget::Index(index) => Device::new(*index as usize),
            DeviceTarget::Path(path) => Device::with_path(path),
        };
        result.map_err(|err| CameraError::OpenFailed {
            device: target.key(),
            reason: err.to_string(),
        })
    }
}

impl CaptureBackend for V4l2Backend {
    fn open(
        &self,
        target: &DeviceTarget,
        settings: &CameraSettings,
    ) -> CameraResult<Box<dyn FrameGrabber>> {
        let device = Self::open_device(target)?;

        let mut format = device.format().map_err(|err| CameraError::OpenFailed {
            device: target.key(),
            reason: format!("format query failed: {err}"),
        })?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = FourCC::new(FOURCC_YUYV);

        let actual = device
            .set_format(&format)
            .map_err(|err| CameraError::OpenFailed {
                device: target.key(),
                reason: format!("format negotiation failed: {err}"),
            })?;
        if &actual.fourcc.repr != FOURCC_YUYV {
            return Err(CameraError::UnsupportedFormat(actual.fourcc.to_string()));
        }
        if (actual.width, actual.height) != (settings.width, settings.height) {
            debug!(
                device = %target,
                requested = %format_args!("{}x{}", settings.width, settings.height),
                actual = %format_args!("{}x{}", actual.width, actual.height),
                "driver adjusted resolution"
            );
        }

        // Frame rate is best effort; many UVC drivers ignore it.
        if let Err(err) = device.set_params(&Parameters::with_fps(settings.fps)) {
            debug!(device = %target, %err, "frame rate not applied");
        }

        let stream =
            MmapStream::new(&device, Type::VideoCapture).map_err(|err| CameraError::OpenFailed {
                device: target.key(),
                reason: format!("stream setup failed: {err}"),
            })?;

        Ok(Box::new(V4l2Grabber {
            width: actual.width,
            height: actual.height,
            stream,
            _device: device,
        }))
    }

    fn candidates(&self) -> Vec<DeviceTarget> {
        scan_video_devices()
    }
}

struct V4l2Grabber {
    width: u32,
    height: u32,
    stream: MmapStream<'static>,
    /// Keeps the file descriptor alive for the mmap'd buffers.
    _device: Device,
}

impl FrameGrabber for V4l2Grabber {
    fn grab(&mut self) -> CameraResult<RawFrame> {
        let (buf, _meta) = self
            .stream
            .next()
            .map_err(|err| CameraError::ReadFailed(err.to_string()))?;

        let expected = self.width as usize * self.height as usize * 2;
        if buf.len() < expected {
            return Err(CameraError::ReadFailed(format!(
                "short frame: {} bytes, expected {expected}",
                buf.len()
            )));
        }

        Ok(RawFrame {
            width: self.width,
            height: self.height,
            pixels: yuyv_to_rgb(&buf[..expected]),
        })
    }
}

/// Convert packed YUYV 4:2:2 to packed RGB8 (BT.601 full range).
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
    for chunk in yuyv.chunks_exact(4) {
        let u = f32::from(chunk[1]) - 128.0;
        let v = f32::from(chunk[3]) - 128.0;
        for y in [f32::from(chunk[0]), f32::from(chunk[2])] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344_136 * u - 0.714_136 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }
    rgb
}
