//! Core traits and types for the capture device abstraction.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::ConfigError;

/// Pixel format representation (e.g., JPEG, MJPG, YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Build a `FourCC` from the kernel's little-endian `u32` encoding.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// The kernel's little-endian `u32` encoding of this code.
    #[must_use]
    pub const fn code(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// JFIF JPEG, the only format this driver negotiates.
    pub const JPEG: Self = Self::new(b"JPEG");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

/// Capture format requested from, or reported by, the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line as reported by the driver (0 for compressed formats).
    pub bytes_per_line: u32,
    /// Maximum image size in bytes as reported by the driver.
    pub size_image: u32,
}

impl CaptureFormat {
    /// A progressive JPEG request at the given resolution.
    #[must_use]
    pub const fn jpeg(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fourcc: FourCC::JPEG,
            bytes_per_line: 0,
            size_image: 0,
        }
    }
}

/// Location of a device buffer inside the device's memory, as reported by
/// the buffer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Buffer slot index.
    pub index: u32,
    /// Offset to pass to `mmap`.
    pub offset: u32,
    /// Length of the buffer in bytes.
    pub length: u32,
}

/// Driver flag marking a buffer whose contents may be corrupt
/// (`V4L2_BUF_FLAG_ERROR`).
pub const BUFFER_FLAG_ERROR: u32 = 0x0000_0040;

/// A buffer handed back by the device after capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Buffer slot index.
    pub index: u32,
    /// Bytes of the buffer holding the current image.
    pub bytes_used: u32,
    /// Driver buffer flags.
    pub flags: u32,
    /// Driver frame counter.
    pub sequence: u32,
    /// Driver capture timestamp.
    pub timestamp: Duration,
}

impl DequeuedBuffer {
    /// Whether the buffer carries an image worth serving: non-empty and not
    /// flagged as corrupt.
    #[must_use]
    pub const fn has_image(&self) -> bool {
        self.bytes_used > 0 && self.flags & BUFFER_FLAG_ERROR == 0
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameMetadata {
    /// Publish counter of the frame cache, starting at 1.
    pub sequence: u64,
    /// Driver frame counter.
    pub device_sequence: u32,
    /// Driver capture timestamp.
    pub timestamp: Duration,
    /// Bytes of the image as reported by the device.
    pub bytes_used: u32,
    /// When the frame was copied out of device memory.
    pub captured_at: Instant,
}

/// A captured JPEG frame, owned by the caller.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Encoded image bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of image bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the frame, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Time elapsed since the frame was captured.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.metadata.captured_at.elapsed()
    }
}

/// Lifecycle of a [`CaptureSession`](crate::session::CaptureSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device is held.
    Closed,
    /// Format negotiated, buffers being set up.
    Configured,
    /// The device is streaming and the frame pump is running.
    Streaming,
    /// Torn down; terminal.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Configured => "configured",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device node could not be opened.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        /// Device node path.
        path: PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// The device rejected the requested format.
    #[error("failed to set format: {0}")]
    Format(#[source] io::Error),
    /// The device could not allocate capture buffers.
    #[error("failed to request buffer: {0}")]
    BufferRequest(#[source] io::Error),
    /// The device did not report the buffer location.
    #[error("failed to query buffer: {0}")]
    BufferQuery(#[source] io::Error),
    /// The buffer could not be mapped into process memory.
    #[error("failed to map buffer: {0}")]
    Map(#[source] io::Error),
    /// The buffer could not be handed to the device.
    #[error("failed to enqueue buffer: {0}")]
    Enqueue(#[source] io::Error),
    /// No completed buffer could be taken from the device.
    #[error("failed to dequeue buffer: {0}")]
    Dequeue(#[source] io::Error),
    /// The device refused to start streaming.
    #[error("failed to start stream: {0}")]
    StreamOn(#[source] io::Error),
    /// The device refused to stop streaming.
    #[error("failed to stop stream: {0}")]
    StreamOff(#[source] io::Error),
    /// Waiting for device readiness failed.
    #[error("failed to wait for frame: {0}")]
    Poll(#[source] io::Error),
    /// No frame has been captured yet.
    #[error("no frame available yet")]
    NoFrameAvailable,
    /// The frame pump terminated on a device error; the cached frame is stale.
    #[error("capture died: {0}")]
    CaptureDied(String),
    /// The session was stopped.
    #[error("capture stopped")]
    CaptureStopped,
    /// The first frame did not arrive in time.
    #[error("no frame within {0:?}")]
    ReadinessTimeout(Duration),
    /// The session is not in the state the operation requires.
    #[error("session is {actual}, expected {expected}")]
    InvalidState {
        /// Required state.
        expected: SessionState,
        /// Current state.
        actual: SessionState,
    },
    /// The frame pump thread could not be started.
    #[error("failed to spawn frame pump: {0}")]
    Spawn(#[source] io::Error),
    /// The frame pump thread panicked.
    #[error("frame pump panicked")]
    PumpPanicked,
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// The device-control capability a capture session drives.
///
/// Implemented by [`V4l2Device`](crate::device::V4l2Device) for real
/// hardware. Closing the handle happens on drop; a mapped buffer must be
/// released with [`unmap_buffer`](Self::unmap_buffer) before that.
pub trait DeviceControl: Send {
    /// Negotiate a single-plane capture format. Returns the format the
    /// driver settled on.
    fn set_format(&mut self, format: &CaptureFormat) -> Result<CaptureFormat>;

    /// Ask for `count` memory-mapped capture buffers. Returns the number
    /// the driver allocated.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Retrieve the offset and length of buffer `index`.
    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor>;

    /// Map a queried buffer into process memory.
    fn map_buffer(&mut self, buffer: &BufferDescriptor) -> Result<()>;

    /// The mapped buffer, if any.
    fn mapped(&self) -> Option<&[u8]>;

    /// Release the mapped buffer. No-op when nothing is mapped.
    fn unmap_buffer(&mut self) -> Result<()>;

    /// Hand buffer `index` to the device for filling.
    fn queue_buffer(&mut self, index: u32) -> Result<()>;

    /// Take a completed buffer back from the device.
    fn dequeue_buffer(&mut self, index: u32) -> Result<DequeuedBuffer>;

    /// Start streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming. Every queued buffer is returned to userspace.
    fn stream_off(&mut self) -> Result<()>;

    /// Block until a buffer is ready or `timeout` elapses. Returns `false`
    /// on timeout.
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool>;
}

/// Anything that can hand out the latest captured frame.
pub trait FrameSource {
    /// An owned copy of the most recent frame.
    fn frame(&self) -> Result<Frame>;
}
