//! V4L2 device implementation over the `v4l` device-control calls.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::v4l2_buffer;

use crate::sys;
use crate::traits::{
    BufferDescriptor, CaptureError, CaptureFormat, DequeuedBuffer, DeviceControl, Result,
};

/// An open V4L2 capture device node.
///
/// The node is opened read/write and non-blocking. Dropping the device
/// releases any mapping still held and closes the handle.
pub struct V4l2Device {
    file: File,
    path: PathBuf,
    mapping: Option<MmapRegion>,
}

impl V4l2Device {
    /// Open a device node such as `/dev/video0`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|source| CaptureError::Open {
                path: path.clone(),
                source,
            })?;

        info!(device = %path.display(), fd = file.as_raw_fd(), "opened device");

        Ok(Self {
            file,
            path,
            mapping: None,
        })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn buffer_call(&self, request: vidioc::_IOC_TYPE, index: u32) -> io::Result<v4l2_buffer> {
        let mut buf = sys::buffer_request(index);
        // SAFETY: QUERYBUF, QBUF and DQBUF take a `struct v4l2_buffer`.
        unsafe { xioctl(self.fd(), request, &mut buf)? };
        Ok(buf)
    }

    fn stream_call(&self, request: vidioc::_IOC_TYPE) -> io::Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        let mut buf_type = sys::BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        // SAFETY: STREAMON and STREAMOFF take a pointer to the buffer type.
        unsafe { xioctl(self.fd(), request, &mut buf_type) }
    }
}

impl DeviceControl for V4l2Device {
    fn set_format(&mut self, format: &CaptureFormat) -> Result<CaptureFormat> {
        let mut fmt = sys::format_request(format);
        // SAFETY: S_FMT takes a `struct v4l2_format`.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_S_FMT, &mut fmt) }
            .map_err(CaptureError::Format)?;
        Ok(sys::format_reply(&fmt))
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let mut req = sys::buffers_request(count);
        // SAFETY: REQBUFS takes a `struct v4l2_requestbuffers`.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_REQBUFS, &mut req) }
            .map_err(CaptureError::BufferRequest)?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferDescriptor> {
        let buf = self
            .buffer_call(vidioc::VIDIOC_QUERYBUF, index)
            .map_err(CaptureError::BufferQuery)?;
        Ok(BufferDescriptor {
            index: buf.index,
            offset: sys::buffer_offset(&buf),
            length: buf.length,
        })
    }

    fn map_buffer(&mut self, buffer: &BufferDescriptor) -> Result<()> {
        if self.mapping.is_some() {
            return Err(CaptureError::Map(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a buffer is already mapped",
            )));
        }
        let region =
            MmapRegion::map(self.fd(), buffer.offset, buffer.length).map_err(CaptureError::Map)?;
        debug!(offset = buffer.offset, length = buffer.length, "mapped buffer");
        self.mapping = Some(region);
        Ok(())
    }

    fn mapped(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(MmapRegion::as_slice)
    }

    fn unmap_buffer(&mut self) -> Result<()> {
        match self.mapping.take() {
            Some(region) => region.release().map_err(CaptureError::Map),
            None => Ok(()),
        }
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        self.buffer_call(vidioc::VIDIOC_QBUF, index)
            .map(|_| ())
            .map_err(CaptureError::Enqueue)
    }

    fn dequeue_buffer(&mut self, index: u32) -> Result<DequeuedBuffer> {
        let buf = self
            .buffer_call(vidioc::VIDIOC_DQBUF, index)
            .map_err(CaptureError::Dequeue)?;
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            flags: buf.flags,
            sequence: buf.sequence,
            timestamp: sys::buffer_timestamp(&buf),
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        self.stream_call(vidioc::VIDIOC_STREAMON)
            .map_err(CaptureError::StreamOn)
    }

    fn stream_off(&mut self) -> Result<()> {
        self.stream_call(vidioc::VIDIOC_STREAMOFF)
            .map_err(CaptureError::StreamOff)
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        loop {
            // SAFETY: `pfd` is a single valid `pollfd` that outlives the call.
            let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(CaptureError::Poll(err));
            }
            if ready == 0 {
                return Ok(false);
            }
            if pfd.revents & libc::POLLIN != 0 {
                return Ok(true);
            }
            return Err(CaptureError::Poll(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("device signalled poll events {:#x}", pfd.revents),
            )));
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if let Some(region) = self.mapping.take() {
            if let Err(err) = region.release() {
                warn!(error = %err, "failed to unmap buffer on close");
            }
        }
        info!(device = %self.path.display(), "closed device");
    }
}

/// Issue a device-control call, retrying on `EINTR`.
///
/// # Safety
///
/// `T` must be the structure `request` expects.
unsafe fn xioctl<T>(fd: RawFd, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    let arg = ptr::from_mut(arg).cast();
    loop {
        // SAFETY: upheld by the caller; `arg` is exclusively borrowed for
        // the duration of the call.
        match unsafe { v4l2::ioctl(fd, request, arg) } {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            result => return result,
        }
    }
}

/// A shared read/write mapping of device memory.
struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain memory owned by this value; access goes
// through `&self`/`self`, so the usual borrow rules apply across threads.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    fn map(fd: RawFd, offset: u32, length: u32) -> io::Result<Self> {
        let len = usize::try_from(length)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer too large"))?;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "device reported an empty buffer",
            ));
        }
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;

        // SAFETY: a fresh mapping chosen by the kernel; no existing memory is
        // affected.
        let addr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )?
        };

        NonNull::new(addr.cast::<u8>())
            .map(|ptr| Self { ptr, len })
            .ok_or_else(|| io::Error::other("mmap returned null"))
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes until the region is
        // released, which needs `self` by value.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Unmap, reporting failure instead of logging it.
    fn release(self) -> io::Result<()> {
        let region = std::mem::ManuallyDrop::new(self);
        // SAFETY: `region` was created by `mmap` with this length and is not
        // used after this point.
        unsafe { munmap(region.ptr, region.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: see `release`; `drop` runs at most once.
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            warn!(error = %err, "failed to unmap buffer");
        }
    }
}

unsafe fn munmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: upheld by the caller.
    unsafe { v4l2::munmap(ptr.as_ptr().cast(), len) }
}
