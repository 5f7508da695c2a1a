//! Asynchronous I/O facilities.
//!
//! The engine only talks to a completion context through
//! [`CompletionContext`]; how requests are executed is up to the
//! implementation. Three are provided:
//!
//! - [`uring::UringFacility`] on Linux `io_uring`,
//! - [`aio::AioFacility`] on the Linux native AIO syscalls,
//! - [`threaded::ThreadedFacility`], a portable worker-thread emulation.

use std::{io, os::fd::RawFd, time::Duration};

use crate::error::Result;

pub mod aio;
#[cfg(test)]
pub(crate) mod scripted;
pub mod threaded;
pub mod uring;

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// One positional I/O request over a slot buffer.
///
/// Requests are only built by [`Batch`](crate::io::batch::Batch) from a
/// [`SlotPool`](crate::io::allocator::SlotPool), so the buffer pointer is
/// valid for `len` bytes for as long as the pool lives. Keeping the pool
/// alive while a request is in flight is the submitter's obligation; see
/// [`CompletionContext::submit`].
#[derive(Debug, Clone, Copy)]
pub struct Request {
    fd: RawFd,
    buf: *mut u8,
    len: usize,
    offset: u64,
    kind: OpKind,
    slot: usize,
}

// Only the facility touches the buffer while the request is in flight.
unsafe impl Send for Request {}

impl Request {
    pub(crate) fn new(
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
        kind: OpKind,
        slot: usize,
    ) -> Self {
        Request {
            fd,
            buf,
            len,
            offset,
            kind,
            slot,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Slot index, carried through the facility as user data.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// A resolved request as reported by a facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub slot: usize,
    /// Bytes transferred, or a negated errno.
    pub result: i64,
}

impl CompletionEvent {
    pub fn new(slot: usize, result: i64) -> Self {
        CompletionEvent { slot, result }
    }

    pub fn bytes(&self) -> io::Result<usize> {
        if self.result < 0 {
            Err(io::Error::from_raw_os_error((-self.result) as i32))
        } else {
            Ok(self.result as usize)
        }
    }
}

/// Factory for completion contexts.
pub trait Facility {
    type Context: CompletionContext;

    /// Short backend name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Open a context able to hold `capacity` outstanding requests.
    /// Fails with [`CopyError::Setup`](crate::error::CopyError::Setup).
    fn create(&self, capacity: u32) -> Result<Self::Context>;
}

/// A bounded-capacity completion context.
pub trait CompletionContext {
    /// Declared capacity.
    fn capacity(&self) -> u32;

    /// Requests accepted but not yet returned by [`wait`](Self::wait).
    fn outstanding(&self) -> usize;

    /// Enqueue `batch` and return how many requests were accepted. Accepted
    /// requests are always a prefix of `batch`.
    ///
    /// # Safety
    ///
    /// The facility reads or writes each accepted request's buffer until
    /// the request is returned by [`wait`](Self::wait) or the context is
    /// destroyed. Until then the buffer must stay allocated and must not be
    /// used by any other request or accessed by the caller.
    unsafe fn submit(&mut self, batch: &[Request]) -> Result<usize>;

    /// Block until at least `min` completions are available, then return up
    /// to `max` of them. Fewer than `min` are returned only when `timeout`
    /// expires. `min` must not exceed [`outstanding`](Self::outstanding).
    fn wait(
        &mut self,
        min: usize,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<CompletionEvent>>;

    /// Reconcile every outstanding request and release the context.
    fn destroy(self) -> Result<()>;
}
