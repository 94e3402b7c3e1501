//! Mock device implementation for testing without hardware.
//!
//! [`MockDevice`] scripts a capture device: the frames it delivers, the
//! buffer size it reports, and the stage at which it starts failing. Every
//! call is recorded in a shared [`Journal`] so tests can check ordering
//! after the device has moved into the frame pump thread.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::traits::{
    BufferDescriptor, CaptureError, CaptureFormat, DequeuedBuffer, DeviceControl, FourCC, Result,
    BUFFER_FLAG_ERROR,
};

/// A recorded device call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// Format negotiation with the requested format.
    SetFormat(CaptureFormat),
    /// Buffer request with the requested count.
    RequestBuffers(u32),
    /// Buffer query for a slot.
    QueryBuffer(u32),
    /// Successful mapping.
    Map,
    /// Release of a held mapping.
    Unmap,
    /// Enqueue of a slot.
    Queue(u32),
    /// Dequeue of a slot.
    Dequeue(u32),
    /// Stream start.
    StreamOn,
    /// Stream stop.
    StreamOff,
    /// Handle closed.
    Close,
}

/// Device stages that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// `set_format`.
    SetFormat,
    /// `request_buffers`.
    RequestBuffers,
    /// `query_buffer`.
    QueryBuffer,
    /// `map_buffer`.
    Map,
    /// `queue_buffer`.
    Queue,
    /// `dequeue_buffer`.
    Dequeue,
    /// `stream_on`.
    StreamOn,
    /// `stream_off`.
    StreamOff,
}

#[derive(Debug, Default)]
struct JournalInner {
    calls: Vec<Call>,
    outstanding: usize,
    max_outstanding: usize,
}

/// Shared record of the calls made on a [`MockDevice`].
#[derive(Debug, Clone, Default)]
pub struct Journal {
    inner: Arc<Mutex<JournalInner>>,
}

impl Journal {
    fn record(&self, call: Call) {
        self.inner.lock().calls.push(call);
    }

    fn queued(&self) {
        let mut inner = self.inner.lock();
        inner.outstanding += 1;
        inner.max_outstanding = inner.max_outstanding.max(inner.outstanding);
    }

    fn dequeued(&self) {
        let mut inner = self.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
    }

    fn reclaimed(&self) {
        self.inner.lock().outstanding = 0;
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    /// Whether `call` was made.
    pub fn contains(&self, call: &Call) -> bool {
        self.inner.lock().calls.contains(call)
    }

    /// Index of the first occurrence of `call`.
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.inner.lock().calls.iter().position(|c| c == call)
    }

    /// Number of dequeue attempts.
    pub fn count_dequeues(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Dequeue(_)))
            .count()
    }

    /// Most buffers ever held by the device at once.
    pub fn max_outstanding(&self) -> usize {
        self.inner.lock().max_outstanding
    }
}

/// Parks one dequeue until the test releases it.
struct DequeueHold {
    after: usize,
    entered: SyncSender<()>,
    release: Receiver<()>,
}

/// Scripted capture device.
pub struct MockDevice {
    journal: Journal,
    frames: Vec<Vec<u8>>,
    delivered: usize,
    corrupt_frames: usize,
    hold: Option<DequeueHold>,
    frame_limit: Option<usize>,
    frame_interval: Duration,
    buffer_len: u32,
    granted_buffers: Option<u32>,
    offered_fourcc: Option<FourCC>,
    failures: HashMap<Stage, usize>,
    calls_per_stage: HashMap<Stage, usize>,
    memory: Option<Vec<u8>>,
    queued: bool,
    streaming: bool,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A device delivering 640x480 JPEG frames into an 8 KiB buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            journal: Journal::default(),
            frames: vec![jpeg_frame(640, 480, 1024, 0x11)],
            delivered: 0,
            corrupt_frames: 0,
            hold: None,
            frame_limit: None,
            frame_interval: Duration::from_millis(1),
            buffer_len: 8192,
            granted_buffers: None,
            offered_fourcc: None,
            failures: HashMap::new(),
            calls_per_stage: HashMap::new(),
            memory: None,
            queued: false,
            streaming: false,
        }
    }

    /// Handle on the call journal, valid after the device is moved.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Frames to deliver, cycled in order.
    #[must_use]
    pub fn with_frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.frames = frames;
        self
    }

    /// Flag the first `count` deliveries as corrupt.
    #[must_use]
    pub const fn with_corrupt_frames(mut self, count: usize) -> Self {
        self.corrupt_frames = count;
        self
    }

    /// Block the first dequeue after `after` deliveries: signal `entered`,
    /// then wait on `release` before completing the buffer.
    #[must_use]
    pub fn holding_dequeue_after(
        mut self,
        after: usize,
        entered: SyncSender<()>,
        release: Receiver<()>,
    ) -> Self {
        self.hold = Some(DequeueHold {
            after,
            entered,
            release,
        });
        self
    }

    /// Buffer length reported by the query.
    #[must_use]
    pub const fn with_buffer_len(mut self, len: u32) -> Self {
        self.buffer_len = len;
        self
    }

    /// Stop completing buffers after `limit` frames.
    #[must_use]
    pub const fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Report `count` buffers from the buffer request.
    #[must_use]
    pub const fn granting_buffers(mut self, count: u32) -> Self {
        self.granted_buffers = Some(count);
        self
    }

    /// Answer format negotiation with `fourcc` instead of the request.
    #[must_use]
    pub const fn offering(mut self, fourcc: FourCC) -> Self {
        self.offered_fourcc = Some(fourcc);
        self
    }

    /// Fail every call to `stage`.
    #[must_use]
    pub fn failing_at(self, stage: Stage) -> Self {
        self.failing_after(stage, 0)
    }

    /// Let the first `successes` calls to `stage` through, then fail.
    #[must_use]
    pub fn failing_after(mut self, stage: Stage, successes: usize) -> Self {
        self.failures.insert(stage, successes);
        self
    }

    /// Count a call to `stage`, failing with `EIO` wrapped by `error` once
    /// its successes are used up.
    fn check(&mut self, stage: Stage, error: fn(io::Error) -> CaptureError) -> Result<()> {
        let calls = self.calls_per_stage.entry(stage).or_insert(0);
        *calls += 1;
        match self.failures.get(&stage) {
            Some(&successes) if *calls > successes => Err(error(os_error(libc::EIO))),
            _ => Ok(()),
        }
    }

    fn wait_for_release(&mut self) {
        let due = self
            .hold
            .as_ref()
            .is_some_and(|hold| self.delivered >= hold.after);
        if let Some(hold) = self.hold.take().filter(|_| due) {
            let _ = hold.entered.send(());
            let _ = hold.release.recv();
        }
    }

    fn frame_ready(&self) -> bool {
        !self.frames.is_empty() && self.frame_limit.map_or(true, |limit| self.delivered < limit)
    }
}

impl DeviceControl for MockDevice {
    fn set_format(&mut self, format: &CaptureFormat) -> Result<CaptureFormat> {
        self.journal.record(Call::SetFormat(format.clone()));
        self.check(Stage::SetFormat, CaptureError::Format)?;
        Ok(CaptureFormat {
            fourcc: self.offered_fourcc.unwrap_or(format.fourcc),
            size_image: self.buffer_len,
            ..format.clone()
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        self.journal.record(Call::RequestBuffers(count));
        self.check(Stage::RequestBuffers, CaptureError::BufferRequest)?;
        Ok(self.granted_buffers.unwrap_or(count))
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor> {
        self.journal.record(Call::QueryBuffer(index));
        self.check(Stage::QueryBuffer, CaptureError::BufferQuery)?;
        Ok(BufferDescriptor {
            index,
            offset: 0,
            length: self.buffer_len,
        })
    }

    fn map_buffer(&mut self, buffer: &BufferDescriptor) -> Result<()> {
        self.check(Stage::Map, CaptureError::Map)?;
        let len = usize::try_from(buffer.length)
            .map_err(|_| CaptureError::Map(io::Error::from(io::ErrorKind::InvalidInput)))?;
        self.memory = Some(vec![0; len]);
        self.journal.record(Call::Map);
        Ok(())
    }

    fn mapped(&self) -> Option<&[u8]> {
        self.memory.as_deref()
    }

    fn unmap_buffer(&mut self) -> Result<()> {
        if self.memory.take().is_some() {
            self.journal.record(Call::Unmap);
        }
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        self.journal.record(Call::Queue(index));
        self.check(Stage::Queue, CaptureError::Enqueue)?;
        if self.queued {
            return Err(CaptureError::Enqueue(os_error(libc::EINVAL)));
        }
        self.queued = true;
        self.journal.queued();
        Ok(())
    }

    fn dequeue_buffer(&mut self, index: u32) -> Result<DequeuedBuffer> {
        self.journal.record(Call::Dequeue(index));
        self.check(Stage::Dequeue, CaptureError::Dequeue)?;
        if !self.streaming || !self.queued || !self.frame_ready() {
            return Err(CaptureError::Dequeue(os_error(libc::EAGAIN)));
        }
        self.wait_for_release();

        let frame = self
            .frames
            .get(self.delivered % self.frames.len())
            .ok_or_else(|| CaptureError::Dequeue(io::Error::other("no scripted frame")))?;
        let memory = self
            .memory
            .as_mut()
            .ok_or_else(|| CaptureError::Dequeue(io::Error::other("buffer not mapped")))?;
        let written = frame.len().min(memory.len());
        if let (Some(dst), Some(src)) = (memory.get_mut(..written), frame.get(..written)) {
            dst.copy_from_slice(src);
        }

        let sequence = u32::try_from(self.delivered).unwrap_or(u32::MAX);
        let flags = if self.delivered < self.corrupt_frames {
            BUFFER_FLAG_ERROR
        } else {
            0
        };
        self.delivered += 1;
        self.queued = false;
        self.journal.dequeued();

        Ok(DequeuedBuffer {
            index,
            bytes_used: u32::try_from(frame.len()).unwrap_or(u32::MAX),
            flags,
            sequence,
            timestamp: Duration::from_millis(33 * u64::from(sequence)),
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        self.journal.record(Call::StreamOn);
        self.check(Stage::StreamOn, CaptureError::StreamOn)?;
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.journal.record(Call::StreamOff);
        self.check(Stage::StreamOff, CaptureError::StreamOff)?;
        self.streaming = false;
        self.queued = false;
        self.journal.reclaimed();
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        if self.streaming && self.queued && self.frame_ready() {
            thread::sleep(self.frame_interval);
            Ok(true)
        } else {
            thread::sleep(timeout);
            Ok(false)
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.journal.record(Call::Close);
    }
}

fn os_error(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// A minimal baseline JPEG of exactly `len` bytes (or the smallest valid
/// size if `len` is shorter): SOI, SOF0 with the given dimensions, SOS,
/// `fill` as entropy data, EOI.
pub fn jpeg_frame(width: u16, height: u16, len: usize, fill: u8) -> Vec<u8> {
    let [h_hi, h_lo] = height.to_be_bytes();
    let [w_hi, w_lo] = width.to_be_bytes();
    let mut data = vec![
        0xFF, 0xD8, // SOI
        0xFF, 0xC0, 0x00, 0x11, 0x08, h_hi, h_lo, w_hi, w_lo, 0x03, // SOF0
        0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01, //
        0xFF, 0xDA, 0x00, 0x0C, 0x03, 0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F,
        0x00, // SOS
    ];
    let filler = len.saturating_sub(data.len() + 2);
    data.resize(data.len() + filler, fill);
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_device() -> MockDevice {
        let mut device = MockDevice::new();
        let buffer = device.query_buffer(0).expect("query");
        device.map_buffer(&buffer).expect("map");
        device.queue_buffer(0).expect("queue");
        device.stream_on().expect("stream on");
        device
    }

    #[test]
    fn test_jpeg_frame_layout() {
        let frame = jpeg_frame(320, 240, 100, 0x42);
        assert_eq!(frame.len(), 100);
        assert_eq!(frame.get(..2), Some(&[0xFF, 0xD8][..]));
        assert_eq!(frame.get(98..), Some(&[0xFF, 0xD9][..]));

        let short = jpeg_frame(1, 1, 0, 0);
        assert!(short.len() > 4);
        assert!(short.ends_with(&[0xFF, 0xD9]));
    }

    #[test]
    fn test_mock_dequeue_writes_frame() {
        let frame = jpeg_frame(640, 480, 300, 0x33);
        let mut device = streaming_device().with_frames(vec![frame.clone()]);

        assert!(device.wait_readable(Duration::from_millis(1)).expect("wait"));
        let buffer = device.dequeue_buffer(0).expect("dequeue");
        assert_eq!(buffer.bytes_used, 300);
        assert_eq!(device.mapped().and_then(|m| m.get(..300)), Some(frame.as_slice()));
    }

    #[test]
    fn test_mock_flags_corrupt_frames() {
        let mut device = streaming_device().with_corrupt_frames(1);

        let first = device.dequeue_buffer(0).expect("dequeue");
        assert_eq!(first.flags, BUFFER_FLAG_ERROR);
        assert!(!first.has_image());

        device.queue_buffer(0).expect("requeue");
        let second = device.dequeue_buffer(0).expect("dequeue");
        assert_eq!(second.flags, 0);
        assert!(second.has_image());
    }

    #[test]
    fn test_mock_empty_frame_has_no_image() {
        let mut device = streaming_device().with_frames(vec![Vec::new()]);
        let buffer = device.dequeue_buffer(0).expect("dequeue");
        assert_eq!(buffer.bytes_used, 0);
        assert!(!buffer.has_image());
    }

    #[test]
    fn test_mock_rejects_double_queue() {
        let mut device = streaming_device();
        assert!(matches!(
            device.queue_buffer(0),
            Err(CaptureError::Enqueue(_))
        ));
        assert_eq!(device.journal().max_outstanding(), 1);
    }

    #[test]
    fn test_mock_not_readable_without_queued_buffer() {
        let mut device = streaming_device();
        device.dequeue_buffer(0).expect("dequeue");
        assert!(!device.wait_readable(Duration::from_millis(1)).expect("wait"));
        assert!(matches!(
            device.dequeue_buffer(0),
            Err(CaptureError::Dequeue(err)) if err.kind() == io::ErrorKind::WouldBlock
        ));
    }

    #[test]
    fn test_failing_after_counts_calls() {
        let mut device = MockDevice::new().failing_after(Stage::RequestBuffers, 1);
        assert!(device.request_buffers(1).is_ok());
        assert!(matches!(
            device.request_buffers(1),
            Err(CaptureError::BufferRequest(_))
        ));
    }

    #[test]
    fn test_drop_records_close() {
        let device = MockDevice::new();
        let journal = device.journal();
        drop(device);
        assert_eq!(journal.calls(), vec![Call::Close]);
    }
}
