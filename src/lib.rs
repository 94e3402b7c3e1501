//! Frame-Daemon: a userspace V4L2 JPEG capture driver.
//!
//! Opens a capture device, negotiates a JPEG format, maps a single
//! device buffer, and runs a background frame pump that keeps a copy of the
//! most recent frame. Any number of threads can then take owned snapshots
//! of that frame while capture continues.
//!
//! Device control goes through the [`DeviceControl`] trait so sessions can
//! be driven by real hardware ([`V4l2Device`]) or by a mock in tests.

pub mod cache;
pub mod config;
pub mod device;
pub mod gate;
pub mod session;
pub mod sys;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use cache::{FrameCache, FrameHandle, PumpStatus};
pub use config::{CaptureConfig, ConfigError, FileConfig};
pub use device::V4l2Device;
pub use session::CaptureSession;
pub use traits::{
    CaptureError, CaptureFormat, DeviceControl, FourCC, Frame, FrameMetadata, FrameSource,
    SessionState,
};
