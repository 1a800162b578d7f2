//! CRC32 over a frame's payload.
//!
//! The header is skipped; the checksum runs from `frame_offset + HEADER_LENGTH`
//! to `frame_offset + frame_length`, where `frame_length` is already aligned.

use thiserror::Error;

use super::descriptor::HEADER_LENGTH;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("frame length {0} is shorter than the 32 byte header")]
    FrameTooShort(usize),
    #[error("frame {offset}+{length} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        length: usize,
        capacity: usize,
    },
}

/// Reusable CRC32 state. Each call starts from a fresh state.
#[derive(Default)]
pub struct FrameChecksum {
    hasher: crc32fast::Hasher,
}

impl FrameChecksum {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum of the payload of the frame at `frame_offset`.
    ///
    /// # Errors
    ///
    /// The frame is shorter than a header or runs past the buffer.
    pub fn compute(
        &mut self,
        buffer: &[u8],
        frame_offset: usize,
        frame_length: usize,
    ) -> Result<u32, ChecksumError> {
        let payload = payload(buffer, frame_offset, frame_length)?;
        self.hasher.reset();
        self.hasher.update(payload);
        Ok(self.hasher.clone().finalize())
    }
}

fn payload(buffer: &[u8], frame_offset: usize, frame_length: usize) -> Result<&[u8], ChecksumError> {
    let out_of_bounds = || ChecksumError::OutOfBounds {
        offset: frame_offset,
        length: frame_length,
        capacity: buffer.len(),
    };
    let end = frame_offset
        .checked_add(frame_length)
        .ok_or_else(out_of_bounds)?;
    if end > buffer.len() {
        return Err(out_of_bounds());
    }
    if frame_length < HEADER_LENGTH {
        return Err(ChecksumError::FrameTooShort(frame_length));
    }
    Ok(&buffer[frame_offset + HEADER_LENGTH..end])
}

/// One-shot form of [`FrameChecksum::compute`].
///
/// # Errors
///
/// See [`FrameChecksum::compute`].
pub fn frame_crc32(
    buffer: &[u8],
    frame_offset: usize,
    frame_length: usize,
) -> Result<u32, ChecksumError> {
    payload(buffer, frame_offset, frame_length).map(crc32fast::hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_frame_past_buffer_end() {
        let buffer = [0u8; 32];
        assert_eq!(
            frame_crc32(&buffer, 1, 32),
            Err(ChecksumError::OutOfBounds {
                offset: 1,
                length: 32,
                capacity: 32
            })
        );
        assert!(frame_crc32(&buffer, usize::MAX, 2).is_err());
    }

    #[test]
    fn rejects_frame_shorter_than_header() {
        assert_eq!(
            frame_crc32(&[0u8; 32], 0, 5),
            Err(ChecksumError::FrameTooShort(5))
        );
    }

    #[test]
    fn covers_payload_and_alignment_padding() {
        let mut buffer = [0u8; 64];
        buffer[HEADER_LENGTH..HEADER_LENGTH + 20].fill(3);
        let mut expected = [0u8; 32];
        expected[..20].fill(3);
        assert_eq!(frame_crc32(&buffer, 0, 64), Ok(crc32fast::hash(&expected)));
    }

    #[test]
    fn honours_frame_offset() {
        let mut buffer = [0u8; 68];
        buffer[4 + HEADER_LENGTH..].fill(0xFF);
        assert_eq!(frame_crc32(&buffer, 4, 64), Ok(crc32fast::hash(&[0xFF; 32])));
    }

    #[test]
    fn state_is_reset_between_calls() {
        let mut checksum = FrameChecksum::new();
        let mut buffer = [0u8; 64];
        buffer[HEADER_LENGTH..].fill(0xFF);
        assert_eq!(checksum.compute(&buffer, 0, 64), Ok(crc32fast::hash(&[0xFF; 32])));
        buffer[HEADER_LENGTH..].fill(5);
        assert_eq!(checksum.compute(&buffer, 0, 64), Ok(crc32fast::hash(&[5; 32])));
    }
}
