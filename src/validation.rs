//! Frame validation utilities for captured JPEG frames.
//!
//! Structural checks only: marker framing, the frame header's dimensions,
//! and sequence ordering. Nothing here decodes entropy data. Useful for
//! integration testing with virtual cameras and for the capture CLI.

use thiserror::Error;

use crate::traits::Frame;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Reasons a frame fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Too short to hold SOI and EOI.
    #[error("frame too short for a JPEG image ({0} bytes)")]
    TooShort(usize),
    /// The frame does not begin with a start-of-image marker.
    #[error("missing JPEG start-of-image marker")]
    MissingStartOfImage,
    /// The frame does not end with an end-of-image marker.
    #[error("missing JPEG end-of-image marker")]
    MissingEndOfImage,
    /// No frame header could be found before the scan data.
    #[error("no JPEG frame header found")]
    MissingFrameHeader,
    /// The frame header disagrees with the negotiated resolution.
    #[error("frame is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    DimensionMismatch {
        /// Negotiated width.
        expected_width: u32,
        /// Negotiated height.
        expected_height: u32,
        /// Width in the frame header.
        actual_width: u32,
        /// Height in the frame header.
        actual_height: u32,
    },
    /// No frames were given.
    #[error("cannot validate empty frame sequence")]
    EmptySequence,
    /// Sequence numbers did not increase.
    #[error("frame sequence not increasing at index {index}: {previous} then {current}")]
    SequenceNotIncreasing {
        /// Index of the offending frame.
        index: usize,
        /// Sequence number of the frame before it.
        previous: u64,
        /// Its sequence number.
        current: u64,
    },
}

/// Checks the JPEG framing of `data`: a start-of-image marker first and an
/// end-of-image marker last. Drivers may pad the buffer after EOI with
/// zeros, so trailing zero bytes are ignored.
pub fn validate_jpeg(data: &[u8]) -> Result<(), ValidationError> {
    if data.len() < SOI.len() + EOI.len() {
        return Err(ValidationError::TooShort(data.len()));
    }
    if !data.starts_with(&SOI) {
        return Err(ValidationError::MissingStartOfImage);
    }

    let end = data.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
    let trimmed = data.get(..end).unwrap_or_default();
    if trimmed.len() < SOI.len() + EOI.len() || !trimmed.ends_with(&EOI) {
        return Err(ValidationError::MissingEndOfImage);
    }
    Ok(())
}

/// Reads `(width, height)` from the first start-of-frame header.
///
/// Returns `None` if the marker stream is malformed or the scan starts
/// before any frame header.
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if !data.starts_with(&SOI) {
        return None;
    }

    let mut pos = SOI.len();
    loop {
        if *data.get(pos)? != 0xFF {
            return None;
        }
        // Any number of 0xFF fill bytes may precede a marker.
        while *data.get(pos + 1)? == 0xFF {
            pos += 1;
        }
        let marker = *data.get(pos + 1)?;

        match marker {
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            0xD9 | 0xDA => return None,
            _ => {}
        }

        let length = usize::from(read_u16(data, pos + 2)?);
        if is_start_of_frame(marker) {
            let height = read_u16(data, pos + 5)?;
            let width = read_u16(data, pos + 7)?;
            return Some((width, height));
        }
        pos += 2 + length;
    }
}

/// Checks that `frame` is a well-formed JPEG at `width`x`height`.
pub fn validate_dimensions(frame: &Frame, width: u32, height: u32) -> Result<(), ValidationError> {
    validate_jpeg(frame.as_bytes())?;
    let (actual_width, actual_height) =
        jpeg_dimensions(frame.as_bytes()).ok_or(ValidationError::MissingFrameHeader)?;
    let (actual_width, actual_height) = (u32::from(actual_width), u32::from(actual_height));
    if (actual_width, actual_height) != (width, height) {
        return Err(ValidationError::DimensionMismatch {
            expected_width: width,
            expected_height: height,
            actual_width,
            actual_height,
        });
    }
    Ok(())
}

/// Validates that frame sequence numbers strictly increase.
///
/// Gaps are allowed: a reader sampling the cache slower than the device
/// produces frames skips some.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<(), ValidationError> {
    if frames.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let previous = prev.metadata.sequence;
            let current = curr.metadata.sequence;
            if current <= previous {
                return Err(ValidationError::SequenceNotIncreasing {
                    index: index + 1,
                    previous,
                    current,
                });
            }
        }
    }

    Ok(())
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([*bytes.first()?, *bytes.get(1)?]))
}

/// SOF0 through SOF15, minus DHT (C4), JPG (C8) and DAC (CC).
const fn is_start_of_frame(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}
