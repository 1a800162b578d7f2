//! Log buffer geometry and position arithmetic.
//!
//! A stream position is a byte offset from the start of the stream:
//! `((term_id - initial_term_id) << log2(term_length)) + term_offset`.

use super::log::LogError;

/// Terms rotated through per log.
pub const PARTITION_COUNT: usize = 3;
/// Length of a data frame header.
pub const HEADER_LENGTH: usize = 32;
/// Every frame starts on this alignment.
pub const FRAME_ALIGNMENT: usize = 32;
/// Largest UDP payload the driver will put on the wire.
pub const MAX_UDP_PAYLOAD_LENGTH: usize = 65_504;
pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

/// Frame type of data frames in the default header.
pub const HDR_TYPE_DATA: u16 = 0x01;
/// Begin and end fragment flags.
pub const UNFRAGMENTED: u8 = 0xC0;

/// Checks that `term_length` is a power of two within bounds.
///
/// # Errors
///
/// [`LogError::InvalidTermLength`] otherwise.
pub fn check_term_length(term_length: usize) -> Result<(), LogError> {
    if term_length < TERM_MIN_LENGTH
        || term_length > TERM_MAX_LENGTH
        || !term_length.is_power_of_two()
    {
        return Err(LogError::InvalidTermLength(term_length));
    }
    Ok(())
}

#[inline]
#[must_use]
pub const fn position_bits_to_shift(term_length: usize) -> u32 {
    term_length.trailing_zeros()
}

#[inline]
#[must_use]
pub const fn compute_position(
    active_term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = active_term_id.wrapping_sub(initial_term_id) as i64;
    (term_count << position_bits_to_shift) + term_offset as i64
}

#[inline]
#[must_use]
pub const fn compute_term_id(position: i64, position_bits_to_shift: u32, initial_term_id: i32) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

#[inline]
#[must_use]
pub const fn compute_term_offset(position: i64, position_bits_to_shift: u32) -> usize {
    let mask = (1i64 << position_bits_to_shift) - 1;
    (position & mask) as usize
}

/// Which of the [`PARTITION_COUNT`] terms holds `position`.
#[inline]
#[must_use]
pub const fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift) as u64 % PARTITION_COUNT as u64) as usize
}

#[inline]
#[must_use]
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Default data frame header written into a new log's metadata.
#[must_use]
pub fn default_frame_header(session_id: i32, stream_id: i32, term_id: i32) -> [u8; HEADER_LENGTH] {
    let mut header = [0u8; HEADER_LENGTH];
    header[1] = UNFRAGMENTED;
    header[2..4].copy_from_slice(&HDR_TYPE_DATA.to_le_bytes());
    header[12..16].copy_from_slice(&session_id.to_le_bytes());
    header[16..20].copy_from_slice(&stream_id.to_le_bytes());
    header[20..24].copy_from_slice(&term_id.to_le_bytes());
    header
}
