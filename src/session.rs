//! Capture session: device setup, the frame pump thread, and teardown.
//!
//! A session moves `Closed → Configured → Streaming → Stopped`. While
//! streaming, the device is owned by the frame pump thread; `stop()` raises
//! the stop flag, joins the pump to get the device back, and only then stops
//! the stream, unmaps the buffer and closes the handle.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cache::{FrameCache, FrameHandle, PumpStatus};
use crate::config::CaptureConfig;
use crate::device::V4l2Device;
use crate::gate::{readiness_gate, ReadySignal, WaitOutcome};
use crate::traits::{
    CaptureError, CaptureFormat, DeviceControl, FourCC, Frame, FrameSource, Result, SessionState,
};

/// The buffer slot used for every frame.
pub const BUFFER_SLOT: u32 = 0;

/// Buffers requested from the device.
const BUFFER_COUNT: u32 = 1;

/// One open binding to a capture device.
pub struct CaptureSession<D: DeviceControl + 'static> {
    config: CaptureConfig,
    state: SessionState,
    format: Option<CaptureFormat>,
    cache: Arc<FrameCache>,
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<PumpExit<D>>>,
}

impl CaptureSession<V4l2Device> {
    /// Open the configured device node and start capturing. Blocks until
    /// the first frame is available.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(SessionState::Closed)?;
        self.config.validate()?;
        let device = V4l2Device::open(&self.config.device)?;
        self.start_with(device)
    }

    /// Create a session for `config` and start it.
    pub fn launch(config: CaptureConfig) -> Result<Self> {
        let mut session = Self::new(config);
        session.start()?;
        Ok(session)
    }
}

impl<D: DeviceControl + 'static> CaptureSession<D> {
    /// A closed session for `config`.
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state: SessionState::Closed,
            format: None,
            cache: Arc::new(FrameCache::new()),
            stop: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// Run the setup sequence on an already-open device, launch the frame
    /// pump and wait for the first frame.
    ///
    /// On any failure the mapping is released and the device closed; the
    /// session stays `Closed`.
    pub fn start_with(&mut self, mut device: D) -> Result<()> {
        self.expect_state(SessionState::Closed)?;
        self.config.validate()?;

        if let Err(err) = self.configure(&mut device) {
            error!(error = %err, "device setup failed");
            release(device);
            self.abort_start();
            return Err(err);
        }

        let (ready, gate) = readiness_gate();
        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);
        self.cache.set_status(PumpStatus::Running);

        let pump = FramePump {
            device,
            cache: Arc::clone(&self.cache),
            stop,
            poll_interval: self.config.poll_interval(),
            ready,
        };
        let spawned = thread::Builder::new()
            .name("frame-pump".to_owned())
            .spawn(move || pump.run());
        match spawned {
            Ok(handle) => self.pump = Some(handle),
            Err(err) => {
                // The closure, and the device in it, is dropped on failure.
                self.abort_start();
                return Err(CaptureError::Spawn(err));
            }
        }
        self.state = SessionState::Streaming;

        let timeout = self.config.ready_timeout();
        match gate.wait(timeout) {
            WaitOutcome::Ready => {
                info!("first frame captured");
                Ok(())
            }
            WaitOutcome::TimedOut => {
                warn!(?timeout, "no frame arrived before the ready timeout");
                if let Err(err) = self.teardown() {
                    debug!(error = %err, "frame pump ended with an error");
                }
                self.abort_start();
                Err(CaptureError::ReadinessTimeout(timeout))
            }
            WaitOutcome::Abandoned => {
                let err = match self.teardown() {
                    Err(err) => err,
                    Ok(()) => CaptureError::CaptureStopped,
                };
                self.abort_start();
                Err(err)
            }
        }
    }

    /// Stop capturing and release the device. Failures during teardown are
    /// logged; resources are always released. No-op unless streaming.
    pub fn stop(&mut self) {
        if self.state != SessionState::Streaming {
            debug!(state = %self.state, "stop ignored");
            return;
        }
        if let Err(err) = self.teardown() {
            warn!(error = %err, "frame pump had terminated with an error");
        }
        self.cache.set_status(PumpStatus::Stopped);
        self.state = SessionState::Stopped;
        info!("capture session stopped");
    }

    /// An owned copy of the latest frame.
    pub fn get_frame(&self) -> Result<Frame> {
        self.cache.snapshot()
    }

    /// A cloneable accessor for request handlers.
    pub fn frames(&self) -> FrameHandle {
        FrameHandle::new(Arc::clone(&self.cache))
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// The format the driver accepted, once configured.
    pub const fn format(&self) -> Option<&CaptureFormat> {
        self.format.as_ref()
    }

    /// The session configuration.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Whether the frame pump is still delivering frames.
    pub fn is_capturing(&self) -> bool {
        self.state == SessionState::Streaming && self.cache.status() == PumpStatus::Running
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn configure(&mut self, device: &mut D) -> Result<()> {
        let requested = CaptureFormat::jpeg(self.config.width, self.config.height);
        let negotiated = device.set_format(&requested)?;
        if negotiated.fourcc == FourCC::MJPG {
            info!(fourcc = %negotiated.fourcc, "driver substituted Motion-JPEG");
        } else if negotiated.fourcc != FourCC::JPEG {
            return Err(CaptureError::Format(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "driver offers {} instead of {}",
                    negotiated.fourcc,
                    FourCC::JPEG
                ),
            )));
        }
        if (negotiated.width, negotiated.height) != (requested.width, requested.height) {
            info!(
                requested_width = requested.width,
                requested_height = requested.height,
                "driver adjusted resolution"
            );
        }
        info!(
            width = negotiated.width,
            height = negotiated.height,
            "set format successfully"
        );
        self.format = Some(negotiated);
        self.state = SessionState::Configured;

        let granted = device.request_buffers(BUFFER_COUNT)?;
        if granted == 0 {
            return Err(CaptureError::BufferRequest(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "device allocated no buffers",
            )));
        }
        if granted > BUFFER_COUNT {
            debug!(granted, "device allocated extra buffers, using slot 0 only");
        }
        info!("requested buffer successfully");

        let buffer = device.query_buffer(BUFFER_SLOT)?;
        info!(
            offset = buffer.offset,
            length = buffer.length,
            "query buffer successfully"
        );

        device.map_buffer(&buffer)?;
        let capacity = device
            .mapped()
            .map(<[u8]>::len)
            .ok_or_else(|| CaptureError::Map(io::Error::other("no mapping after map")))?;
        self.cache.allocate(capacity);
        info!(capacity, "map memory successfully");

        device.queue_buffer(BUFFER_SLOT)?;
        device.stream_on()?;
        info!("stream started");
        Ok(())
    }

    /// Stop and join the pump, then stop the stream, unmap and close.
    /// Returns how the pump ended.
    fn teardown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        let Some(handle) = self.pump.take() else {
            return Ok(());
        };

        let PumpExit { mut device, result } = handle.join().map_err(|_| {
            error!("frame pump panicked");
            CaptureError::PumpPanicked
        })?;

        match device.stream_off() {
            Ok(()) => debug!("stream stopped"),
            Err(err) => warn!(error = %err, "failed to stop stream"),
        }
        release(device);
        result
    }

    fn abort_start(&mut self) {
        self.state = SessionState::Closed;
        self.format = None;
        self.cache.allocate(0);
        self.cache.set_status(PumpStatus::Idle);
    }
}

impl<D: DeviceControl + 'static> FrameSource for CaptureSession<D> {
    fn frame(&self) -> Result<Frame> {
        self.get_frame()
    }
}

impl<D: DeviceControl + 'static> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Unmap, then close by dropping.
fn release<D: DeviceControl>(mut device: D) {
    if let Err(err) = device.unmap_buffer() {
        warn!(error = %err, "failed to unmap buffer");
    }
    drop(device);
}

/// What the pump thread hands back when it exits.
struct PumpExit<D> {
    device: D,
    result: Result<()>,
}

struct FramePump<D> {
    device: D,
    cache: Arc<FrameCache>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    ready: ReadySignal,
}

impl<D: DeviceControl> FramePump<D> {
    fn run(mut self) -> PumpExit<D> {
        debug!("frame pump running");
        let result = self.pump();
        match &result {
            Ok(()) => debug!("frame pump stopped"),
            Err(err) => {
                error!(error = %err, "frame pump terminated");
                self.cache.set_status(PumpStatus::Failed(err.to_string()));
            }
        }
        PumpExit {
            device: self.device,
            result,
        }
    }

    fn pump(&mut self) -> Result<()> {
        while !self.stop.load(Ordering::Acquire) {
            if !self.device.wait_readable(self.poll_interval)? {
                continue;
            }

            let buffer = match self.device.dequeue_buffer(BUFFER_SLOT) {
                Ok(buffer) => buffer,
                Err(CaptureError::Dequeue(err)) if err.kind() == io::ErrorKind::WouldBlock => {
                    continue;
                }
                Err(err) => return Err(err),
            };

            if !buffer.has_image() {
                debug!(
                    sequence = buffer.sequence,
                    bytes_used = buffer.bytes_used,
                    flags = buffer.flags,
                    "skipping buffer without a usable image"
                );
                self.device.queue_buffer(BUFFER_SLOT)?;
                continue;
            }

            let memory = self
                .device
                .mapped()
                .ok_or_else(|| CaptureError::Dequeue(io::Error::other("buffer is not mapped")))?;
            let sequence = self.cache.publish(memory, &buffer);
            debug!(sequence, bytes_used = buffer.bytes_used, "captured frame");

            if self.ready.fire() {
                debug!("readiness signalled");
            }

            self.device.queue_buffer(BUFFER_SLOT)?;
        }
        Ok(())
    }
}
