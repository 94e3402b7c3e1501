//! Latest-frame cache shared between the frame pump and readers.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::warn;

use crate::traits::{CaptureError, DequeuedBuffer, Frame, FrameMetadata, FrameSource, Result};

/// What the frame pump is doing, as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpStatus {
    /// No pump has been launched yet.
    Idle,
    /// The pump is capturing.
    Running,
    /// The session was stopped.
    Stopped,
    /// The pump terminated on a device error.
    Failed(String),
}

#[derive(Debug)]
struct Slot {
    buf: Vec<u8>,
    len: usize,
    metadata: Option<FrameMetadata>,
    status: PumpStatus,
}

/// Holder of the most recent frame.
///
/// One writer (the frame pump) and any number of readers. The length, bytes
/// and metadata change together under the write lock, so a reader never sees
/// a length from one frame paired with bytes from another.
#[derive(Debug)]
pub struct FrameCache {
    slot: RwLock<Slot>,
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCache {
    /// An empty cache with no storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Slot {
                buf: Vec::new(),
                len: 0,
                metadata: None,
                status: PumpStatus::Idle,
            }),
        }
    }

    /// Allocate storage for frames of up to `capacity` bytes, discarding any
    /// frame held.
    pub fn allocate(&self, capacity: usize) {
        let mut slot = self.slot.write();
        slot.buf = vec![0; capacity];
        slot.len = 0;
        slot.metadata = None;
    }

    /// Storage size in bytes.
    pub fn capacity(&self) -> usize {
        self.slot.read().buf.len()
    }

    /// Copy a completed device buffer into the cache. Returns the publish
    /// sequence number of the new frame.
    ///
    /// `memory` is the whole mapped region; `buffer.bytes_used` marks how
    /// much of it is image.
    pub fn publish(&self, memory: &[u8], buffer: &DequeuedBuffer) -> u64 {
        let captured_at = Instant::now();
        let mut slot = self.slot.write();

        let capacity = slot.buf.len();
        let copied = memory.len().min(capacity);
        if let (Some(dst), Some(src)) = (slot.buf.get_mut(..copied), memory.get(..copied)) {
            dst.copy_from_slice(src);
        }

        let bytes_used = usize::try_from(buffer.bytes_used).unwrap_or(usize::MAX);
        if bytes_used > copied {
            warn!(
                bytes_used = buffer.bytes_used,
                capacity = copied,
                "device reported more bytes than the buffer holds"
            );
        }
        slot.len = bytes_used.min(copied);

        let sequence = slot.metadata.map_or(1, |m| m.sequence + 1);
        slot.metadata = Some(FrameMetadata {
            sequence,
            device_sequence: buffer.sequence,
            timestamp: buffer.timestamp,
            bytes_used: buffer.bytes_used,
            captured_at,
        });
        sequence
    }

    /// Record the pump's status.
    pub fn set_status(&self, status: PumpStatus) {
        self.slot.write().status = status;
    }

    /// The pump's status.
    pub fn status(&self) -> PumpStatus {
        self.slot.read().status.clone()
    }

    /// Number of frames published since the last allocation.
    pub fn frames_published(&self) -> u64 {
        self.slot.read().metadata.map_or(0, |m| m.sequence)
    }

    /// An owned copy of the latest frame, failing when the capture is not
    /// live or nothing has been captured.
    pub fn snapshot(&self) -> Result<Frame> {
        let slot = self.slot.read();
        match &slot.status {
            PumpStatus::Failed(reason) => return Err(CaptureError::CaptureDied(reason.clone())),
            PumpStatus::Stopped => return Err(CaptureError::CaptureStopped),
            PumpStatus::Idle | PumpStatus::Running => {}
        }
        Self::copy_out(&slot).ok_or(CaptureError::NoFrameAvailable)
    }

    /// An owned copy of the latest frame regardless of pump status.
    pub fn last_frame(&self) -> Option<Frame> {
        Self::copy_out(&self.slot.read())
    }

    fn copy_out(slot: &Slot) -> Option<Frame> {
        let metadata = slot.metadata?;
        let data = slot.buf.get(..slot.len)?.to_vec();
        Some(Frame { data, metadata })
    }
}

impl FrameSource for FrameCache {
    fn frame(&self) -> Result<Frame> {
        self.snapshot()
    }
}

/// Cloneable read-only access to a session's frames, for request handlers.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    cache: Arc<FrameCache>,
}

impl FrameHandle {
    pub(crate) fn new(cache: Arc<FrameCache>) -> Self {
        Self { cache }
    }

    /// The latest frame; see [`FrameCache::snapshot`].
    pub fn frame(&self) -> Result<Frame> {
        self.cache.snapshot()
    }

    /// The latest frame regardless of pump status.
    pub fn last_frame(&self) -> Option<Frame> {
        self.cache.last_frame()
    }

    /// The pump's status.
    pub fn status(&self) -> PumpStatus {
        self.cache.status()
    }
}

impl FrameSource for FrameHandle {
    fn frame(&self) -> Result<Frame> {
        self.cache.snapshot()
    }
}
