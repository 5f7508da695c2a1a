//! Batch building and submission.

use std::os::fd::RawFd;

use crate::{
    engine::builder::ProgressPolicy,
    error::{CopyError, Result},
    facility::{CompletionContext, OpKind, Request},
    io::allocator::SlotPool,
};

/// Requests submitted together, one per slot of the pool.
///
/// A batch holds the pool mutably for as long as it lives, so the slots
/// cannot be freed or handed to a second batch underneath it:
///
/// ```compile_fail
/// # use std::rc::Rc;
/// # use aiocopy::{CopyStat, io::{allocator::SlotPool, batch::Batch}};
/// let mut pool = SlotPool::allocate(4, 512, Rc::new(CopyStat::new())).unwrap();
/// let batch = Batch::reads(&mut pool, 0, 0);
/// drop(pool);
/// batch.len();
/// ```
///
/// ```compile_fail
/// # use std::rc::Rc;
/// # use aiocopy::{CopyStat, io::{allocator::SlotPool, batch::Batch}};
/// let mut pool = SlotPool::allocate(4, 512, Rc::new(CopyStat::new())).unwrap();
/// let reads = Batch::reads(&mut pool, 0, 0);
/// let writes = Batch::writes(&mut pool, 1, 0);
/// reads.len() + writes.len();
/// ```
pub struct Batch<'pool> {
    requests: Vec<Request>,
    pool: &'pool mut SlotPool,
    base: u64,
}

impl<'pool> Batch<'pool> {
    /// One read per slot from `fd`, slot `i` covering `base + i * block_size`.
    pub fn reads(pool: &'pool mut SlotPool, fd: RawFd, base: u64) -> Self {
        Self::build(pool, fd, base, OpKind::Read)
    }

    /// One write per slot to `fd`, slot `i` covering `base + i * block_size`.
    pub fn writes(pool: &'pool mut SlotPool, fd: RawFd, base: u64) -> Self {
        Self::build(pool, fd, base, OpKind::Write)
    }

    fn build(pool: &'pool mut SlotPool, fd: RawFd, base: u64, kind: OpKind) -> Self {
        let block_size = pool.block_size() as u64;
        let requests: Vec<Request> = pool
            .slots_mut()
            .map(|slot| {
                let index = slot.index();
                let buf = slot.as_mut_slice();
                Request::new(
                    fd,
                    buf.as_mut_ptr(),
                    buf.len(),
                    base + index as u64 * block_size,
                    kind,
                    index,
                )
            })
            .collect();
        pool.stat().add_requests_built(requests.len());
        Batch {
            requests,
            pool,
            base,
        }
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// The slots this batch points into.
    pub fn pool(&self) -> &SlotPool {
        self.pool
    }

    /// File offset of slot 0.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        self.pool.stat().add_requests_released(self.requests.len());
    }
}

/// Submit the whole batch and return the number of requests in flight.
///
/// Under [`ProgressPolicy::Abort`] anything short of the full batch is a
/// [`CopyError::PartialSubmit`]; the accepted prefix stays in flight and is
/// reconciled when the context is destroyed. Under
/// [`ProgressPolicy::Resume`] the unaccepted suffix is resubmitted until a
/// submit call makes no progress.
///
/// # Safety
///
/// `context` must be destroyed, or every accepted request waited for,
/// before the batch's pool is dropped or batched again. See
/// [`CompletionContext::submit`].
#[tracing::instrument(level = "trace", skip(context, batch), fields(requested = batch.len()))]
pub unsafe fn submit_batch<C>(
    context: &mut C,
    batch: &Batch<'_>,
    policy: ProgressPolicy,
) -> Result<usize>
where
    C: CompletionContext,
{
    let requested = batch.len();
    let mut accepted = 0;
    loop {
        let n = context.submit(&batch.requests()[accepted..])?;
        accepted += n;
        batch.pool().stat().add_submitted(n);
        if accepted == requested {
            tracing::debug!(submitted = accepted, "Batch submitted");
            return Ok(accepted);
        }
        match policy {
            ProgressPolicy::Resume if n > 0 => {
                tracing::debug!(
                    accepted = accepted,
                    requested = requested,
                    "Partial submit, resubmitting the remainder"
                );
            }
            _ => return Err(CopyError::PartialSubmit { accepted, requested }),
        }
    }
}
