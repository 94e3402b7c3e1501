//! Kernel video-capture request structures and command codes.
//!
//! Structures come from `v4l::v4l_sys` and command codes from
//! `v4l::v4l2::vidioc`, both sized for the build target. On 32-bit targets
//! the codes are:
//!
//! | Command | Code |
//! |---|---|
//! | `VIDIOC_S_FMT` | `0xc0cc5605` |
//! | `VIDIOC_REQBUFS` | `0xc0145608` |
//! | `VIDIOC_QUERYBUF` | `0xc0445609` |
//! | `VIDIOC_QBUF` | `0xc044560f` |
//! | `VIDIOC_DQBUF` | `0xc0445611` |
//! | `VIDIOC_STREAMON` | `0x40045612` |
//! | `VIDIOC_STREAMOFF` | `0x40045613` |

#![allow(unsafe_code)]

use std::mem;
use std::time::Duration;

use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_field_V4L2_FIELD_NONE,
    v4l2_format, v4l2_memory_V4L2_MEMORY_MMAP, v4l2_pix_format, v4l2_requestbuffers,
};

use crate::traits::{CaptureFormat, FourCC};

/// Command codes on 32-bit targets, in setup order.
pub const COMMANDS_32BIT: [(&str, u32); 7] = [
    ("VIDIOC_S_FMT", 0xc0cc_5605),
    ("VIDIOC_REQBUFS", 0xc014_5608),
    ("VIDIOC_QUERYBUF", 0xc044_5609),
    ("VIDIOC_QBUF", 0xc044_560f),
    ("VIDIOC_DQBUF", 0xc044_5611),
    ("VIDIOC_STREAMON", 0x4004_5612),
    ("VIDIOC_STREAMOFF", 0x4004_5613),
];

/// Single-plane video capture buffer type.
pub const BUF_TYPE_VIDEO_CAPTURE: u32 = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;

/// Memory-mapped streaming I/O.
pub const MEMORY_MMAP: u32 = v4l2_memory_V4L2_MEMORY_MMAP;

/// The command number, the low byte of a code.
#[allow(clippy::cast_possible_truncation)]
pub const fn command_nr(code: u32) -> u8 {
    (code & 0xff) as u8
}

/// The argument size encoded in a code.
pub const fn command_size(code: u32) -> usize {
    ((code >> 16) & 0x3fff) as usize
}

/// A progressive single-plane capture format request.
pub fn format_request(format: &CaptureFormat) -> v4l2_format {
    // SAFETY: `v4l2_pix_format` is plain integer data; all-zero is valid.
    let mut pix: v4l2_pix_format = unsafe { mem::zeroed() };
    pix.width = format.width;
    pix.height = format.height;
    pix.pixelformat = format.fourcc.code();
    pix.field = v4l2_field_V4L2_FIELD_NONE;

    // SAFETY: as above; the union's other members are also plain data or
    // pointers, for which all-zero is null.
    let mut request: v4l2_format = unsafe { mem::zeroed() };
    request.type_ = BUF_TYPE_VIDEO_CAPTURE;
    request.fmt.pix = pix;
    request
}

/// The format a driver answered with.
pub fn format_reply(reply: &v4l2_format) -> CaptureFormat {
    // SAFETY: capture requests use the `pix` member, which is plain integer
    // data valid for any bit pattern.
    let pix = unsafe { reply.fmt.pix };
    CaptureFormat {
        width: pix.width,
        height: pix.height,
        fourcc: FourCC::from_code(pix.pixelformat),
        bytes_per_line: pix.bytesperline,
        size_image: pix.sizeimage,
    }
}

/// A request for `count` memory-mapped capture buffers.
pub fn buffers_request(count: u32) -> v4l2_requestbuffers {
    // SAFETY: plain integer data.
    let mut request: v4l2_requestbuffers = unsafe { mem::zeroed() };
    request.count = count;
    request.type_ = BUF_TYPE_VIDEO_CAPTURE;
    request.memory = MEMORY_MMAP;
    request
}

/// A memory-mapped capture buffer descriptor for slot `index`.
pub fn buffer_request(index: u32) -> v4l2_buffer {
    // SAFETY: integer data, a `timeval`, and a union of an offset, a
    // pointer and a descriptor; all-zero is valid for each.
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = BUF_TYPE_VIDEO_CAPTURE;
    buf.memory = MEMORY_MMAP;
    buf
}

/// Offset of a memory-mapped buffer in device memory.
pub fn buffer_offset(buf: &v4l2_buffer) -> u32 {
    // SAFETY: every member of the union is plain data; for `MEMORY_MMAP`
    // buffers the kernel writes `offset`.
    unsafe { buf.m.offset }
}

/// Capture timestamp as a duration since the driver's clock origin.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn buffer_timestamp(buf: &v4l2_buffer) -> Duration {
    // Driver timestamps are never negative in practice
    let secs = buf.timestamp.tv_sec.max(0) as u64;
    let micros = buf.timestamp.tv_usec.max(0) as u32;
    Duration::new(secs, micros.saturating_mul(1000))
}
