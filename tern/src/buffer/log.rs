//! Term-buffer storage for publications and connections.
//!
//! A [`RawLog`] is three terms plus metadata. Clients, the Sender/Receiver and
//! the conductor all hold it through an `Arc`; bytes are atomics so any thread
//! may write the region it owns without locks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use thiserror::Error;

use super::descriptor::{
    HEADER_LENGTH, PARTITION_COUNT, check_term_length, compute_term_offset, default_frame_header,
    index_by_position, position_bits_to_shift,
};
use crate::control::types::{CorrelationId, SessionId, StreamId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("term length {0} must be a power of two between 64 KiB and 1 GiB")]
    InvalidTermLength(usize),
    #[error("range {position}+{length} crosses the end of a term")]
    OutOfRange { position: i64, length: usize },
}

/// Who a log belongs to.
#[derive(Debug, Clone, Copy)]
pub struct LogIdentity<'a> {
    pub canonical_channel: &'a str,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub correlation_id: CorrelationId,
}

impl LogIdentity<'_> {
    fn log_id(&self) -> String {
        format!(
            "{}/{:x}-{:x}-{:x}",
            self.canonical_channel, self.session_id.0, self.stream_id.0, self.correlation_id.0
        )
    }
}

/// Three terms and their metadata.
pub struct RawLog {
    log_id: String,
    terms: [Box<[AtomicU8]>; PARTITION_COUNT],
    term_length: usize,
    initial_term_id: i32,
    mtu_length: usize,
    default_header: [u8; HEADER_LENGTH],
    /// Highest position written by the publisher. Single writer.
    tail_position: AtomicI64,
}

impl RawLog {
    /// Allocates zeroed terms.
    ///
    /// # Errors
    ///
    /// Rejects term lengths that are not a power of two in range.
    pub fn allocate(
        identity: LogIdentity<'_>,
        term_length: usize,
        initial_term_id: i32,
        mtu_length: usize,
    ) -> Result<Self, LogError> {
        check_term_length(term_length)?;
        let term = || -> Box<[AtomicU8]> { (0..term_length).map(|_| AtomicU8::new(0)).collect() };
        Ok(Self {
            log_id: identity.log_id(),
            terms: [term(), term(), term()],
            term_length,
            initial_term_id,
            mtu_length,
            default_header: default_frame_header(
                identity.session_id.0,
                identity.stream_id.0,
                initial_term_id,
            ),
            tail_position: AtomicI64::new(0),
        })
    }

    #[must_use]
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    #[must_use]
    pub const fn term_length(&self) -> usize {
        self.term_length
    }

    #[must_use]
    pub const fn position_bits_to_shift(&self) -> u32 {
        position_bits_to_shift(self.term_length)
    }

    #[must_use]
    pub const fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    #[must_use]
    pub const fn mtu_length(&self) -> usize {
        self.mtu_length
    }

    #[must_use]
    pub const fn default_frame_header(&self) -> &[u8; HEADER_LENGTH] {
        &self.default_header
    }

    #[must_use]
    pub fn tail_position(&self) -> i64 {
        self.tail_position.load(Ordering::Acquire)
    }

    /// Publisher side: records how far the log has been written.
    pub fn set_tail_position(&self, position: i64) {
        self.tail_position.store(position, Ordering::Release);
    }

    fn locate(&self, position: i64, length: usize) -> Result<(usize, usize), LogError> {
        let bits = self.position_bits_to_shift();
        let offset = compute_term_offset(position, bits);
        if position < 0 || offset + length > self.term_length {
            return Err(LogError::OutOfRange { position, length });
        }
        Ok((index_by_position(position, bits), offset))
    }

    /// Copies `bytes` into the log at `position`. The range must stay in one term.
    ///
    /// # Errors
    ///
    /// [`LogError::OutOfRange`] if it would cross a term boundary.
    pub fn write(&self, position: i64, bytes: &[u8]) -> Result<(), LogError> {
        let (index, offset) = self.locate(position, bytes.len())?;
        for (cell, b) in self.terms[index][offset..].iter().zip(bytes) {
            cell.store(*b, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);
        Ok(())
    }

    /// Reads `length` bytes at `position`. The range must stay in one term.
    ///
    /// # Errors
    ///
    /// [`LogError::OutOfRange`] if it would cross a term boundary.
    pub fn read(&self, position: i64, length: usize) -> Result<Vec<u8>, LogError> {
        let (index, offset) = self.locate(position, length)?;
        std::sync::atomic::fence(Ordering::Acquire);
        Ok(self.terms[index][offset..offset + length]
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect())
    }

    /// Zeroes `[from, to)` so the terms can be reused. Returns bytes cleaned.
    pub fn clean(&self, from: i64, to: i64) -> usize {
        let bits = self.position_bits_to_shift();
        let mut position = from.max(0);
        let mut cleaned = 0;
        while position < to {
            let offset = compute_term_offset(position, bits);
            let run = (self.term_length - offset).min((to - position) as usize);
            let term = &self.terms[index_by_position(position, bits)];
            for cell in &term[offset..offset + run] {
                cell.store(0, Ordering::Relaxed);
            }
            cleaned += run;
            position += run as i64;
        }
        if cleaned > 0 {
            std::sync::atomic::fence(Ordering::Release);
        }
        cleaned
    }
}

impl fmt::Debug for RawLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawLog")
            .field("log_id", &self.log_id)
            .field("term_length", &self.term_length)
            .field("initial_term_id", &self.initial_term_id)
            .field("mtu_length", &self.mtu_length)
            .finish_non_exhaustive()
    }
}

/// Allocates the logs backing publications and connections.
pub trait LogFactory: Send {
    /// Log for a new publication, sized by the driver's term length.
    ///
    /// # Errors
    ///
    /// Storage could not be allocated.
    fn new_publication(
        &mut self,
        identity: LogIdentity<'_>,
        initial_term_id: i32,
        mtu_length: usize,
    ) -> Result<Arc<RawLog>, LogError>;

    /// Log for a new connection, sized by the sender's term length.
    ///
    /// # Errors
    ///
    /// Storage could not be allocated.
    fn new_connection(
        &mut self,
        identity: LogIdentity<'_>,
        initial_term_id: i32,
        term_length: usize,
        mtu_length: usize,
    ) -> Result<Arc<RawLog>, LogError>;

    /// Releases any backing resources at driver shutdown.
    fn close(&mut self) {}
}

/// In-process heap logs.
#[derive(Debug)]
pub struct HeapLogFactory {
    publication_term_length: usize,
}

impl HeapLogFactory {
    #[must_use]
    pub const fn new(publication_term_length: usize) -> Self {
        Self {
            publication_term_length,
        }
    }
}

impl LogFactory for HeapLogFactory {
    fn new_publication(
        &mut self,
        identity: LogIdentity<'_>,
        initial_term_id: i32,
        mtu_length: usize,
    ) -> Result<Arc<RawLog>, LogError> {
        RawLog::allocate(identity, self.publication_term_length, initial_term_id, mtu_length)
            .map(Arc::new)
    }

    fn new_connection(
        &mut self,
        identity: LogIdentity<'_>,
        initial_term_id: i32,
        term_length: usize,
        mtu_length: usize,
    ) -> Result<Arc<RawLog>, LogError> {
        RawLog::allocate(identity, term_length, initial_term_id, mtu_length).map(Arc::new)
    }
}
