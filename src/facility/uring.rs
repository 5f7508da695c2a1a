//! Completion context on Linux `io_uring`.

use std::{
    io,
    time::{Duration, Instant},
};

use io_uring::{opcode, squeue, types, IoUring};

use crate::{
    error::{CopyError, Result},
    facility::{CompletionContext, CompletionEvent, Facility, OpKind, Request},
};

/// `user_data` of cancellation entries. Slot ids never reach it.
const CANCEL_USER_DATA: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, Default)]
pub struct UringFacility;

impl UringFacility {
    pub fn new() -> Self {
        UringFacility
    }
}

impl Facility for UringFacility {
    type Context = UringContext;

    fn name(&self) -> &'static str {
        "io_uring"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn create(&self, capacity: u32) -> Result<UringContext> {
        let ring = IoUring::builder()
            .build(capacity)
            .map_err(|source| CopyError::Setup {
                backend: "io_uring",
                capacity,
                source,
            })?;
        if ring.params().is_feature_nodrop() {
            tracing::trace!("io_uring supports IORING_FEAT_NODROP");
        } else {
            tracing::trace!("io_uring does not support IORING_FEAT_NODROP");
        }
        Ok(UringContext {
            ring,
            capacity,
            outstanding: 0,
            queued: 0,
            in_flight: Vec::with_capacity(capacity as usize),
            reap_timeout: None,
            destroyed: false,
        })
    }
}

/// Context owning one ring.
///
/// Entries the kernel does not consume on a submit stay in the submission
/// ring (`queued`) and are flushed by the next kernel entry. A following
/// submit treats them as the head of the batch it is given, which holds as
/// long as callers resubmit the unaccepted suffix.
///
/// Teardown cancels whatever is still in flight and reaps for at most the
/// timeout of the last [`wait`](CompletionContext::wait).
pub struct UringContext {
    ring: IoUring,
    capacity: u32,
    outstanding: usize,
    queued: usize,
    /// `user_data` of every pushed request not yet reaped.
    in_flight: Vec<u64>,
    reap_timeout: Option<Duration>,
    destroyed: bool,
}

fn build_sqe(request: &Request) -> squeue::Entry {
    let fd = types::Fd(request.fd());
    let sqe = match request.kind() {
        OpKind::Read => {
            opcode::Read::new(fd, request.as_mut_ptr(), request.len() as u32)
                .offset(request.offset())
                .build()
        }
        OpKind::Write => {
            opcode::Write::new(fd, request.as_mut_ptr() as *const u8, request.len() as u32)
                .offset(request.offset())
                .build()
        }
    };
    sqe.user_data(request.slot() as u64)
}

fn interrupted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINTR)
}

impl UringContext {
    /// Push one request into the submission ring without entering the
    /// kernel. Returns `false` when the ring is full.
    ///
    /// # Safety
    ///
    /// Same contract as [`CompletionContext::submit`].
    unsafe fn push(&mut self, request: &Request) -> bool {
        let sqe = build_sqe(request);
        if self.ring.submission().push(&sqe).is_err() {
            return false;
        }
        self.queued += 1;
        self.in_flight.push(request.slot() as u64);
        true
    }

    /// Move entries the kernel consumed since the last check from `queued`
    /// to `outstanding`; returns how many moved.
    fn account_consumed(&mut self) -> usize {
        let still_queued = self.ring.submission().len();
        let consumed = self.queued.saturating_sub(still_queued);
        self.queued = still_queued;
        self.outstanding += consumed;
        consumed
    }

    fn forget(&mut self, user_data: u64) {
        if let Some(pos) = self.in_flight.iter().position(|&ud| ud == user_data) {
            self.in_flight.swap_remove(pos);
        }
    }

    fn enter_and_wait(&mut self, want: usize, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            let entered = match timeout {
                None => self.ring.submit_and_wait(want),
                Some(timeout) => {
                    let ts = types::Timespec::from(timeout);
                    let args = types::SubmitArgs::new().timespec(&ts);
                    match self.ring.submitter().submit_with_args(want, &args) {
                        Err(err) if err.raw_os_error() == Some(libc::ETIME) => Ok(0),
                        other => other,
                    }
                }
            };
            match entered {
                Ok(_) => return Ok(()),
                Err(err) if interrupted(&err) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Enter the kernel until the submission ring is empty.
    fn flush(&mut self) -> io::Result<()> {
        while !self.ring.submission().is_empty() {
            match self.ring.submit() {
                Ok(0) => {
                    return Err(io::Error::other(
                        "io_uring consumed no submission entries",
                    ))
                }
                Ok(_) => {}
                Err(err) if interrupted(&err) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Ask the kernel to cancel every request still in flight. The
    /// cancellations complete with [`CANCEL_USER_DATA`].
    fn cancel_in_flight(&mut self) -> io::Result<()> {
        let targets = self.in_flight.clone();
        for chunk in targets.chunks(self.capacity.max(1) as usize) {
            {
                let mut sq = self.ring.submission();
                for &user_data in chunk {
                    let sqe = opcode::AsyncCancel::new(user_data)
                        .build()
                        .user_data(CANCEL_USER_DATA);
                    // Cancellation entries reference no buffer.
                    if unsafe { sq.push(&sqe) }.is_err() {
                        break;
                    }
                }
            }
            self.flush()?;
        }
        tracing::trace!(cancelled = targets.len(), "io_uring cancel");
        Ok(())
    }

    /// Drop every available completion, keeping the counters in step.
    fn reap_discarding(&mut self) {
        let reaped: Vec<u64> = self
            .ring
            .completion()
            .map(|cqe| cqe.user_data())
            .filter(|&user_data| user_data != CANCEL_USER_DATA)
            .collect();
        for &user_data in &reaped {
            self.forget(user_data);
        }
        self.outstanding = self.outstanding.saturating_sub(reaped.len());
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.destroyed = true;
        if self.outstanding == 0 && self.queued == 0 {
            return Ok(());
        }
        let deadline = self.reap_timeout.map(|timeout| Instant::now() + timeout);

        // Queued entries go to the kernel first so they can be cancelled
        // with the rest.
        self.flush()?;
        self.account_consumed();
        self.reap_discarding();
        if self.outstanding > 0 {
            self.cancel_in_flight()?;
        }

        while self.outstanding > 0 {
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "{} io_uring requests still outstanding after cancellation",
                                self.outstanding
                            ),
                        ));
                    }
                    Some(left)
                }
            };
            self.enter_and_wait(1, remaining)?;
            self.reap_discarding();
        }
        Ok(())
    }
}

impl CompletionContext for UringContext {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[tracing::instrument(level = "trace", skip(self, batch), fields(len = batch.len()))]
    unsafe fn submit(&mut self, batch: &[Request]) -> Result<usize> {
        let already_queued = self.queued.min(batch.len());
        let room = (self.capacity as usize).saturating_sub(self.outstanding + self.queued);
        for request in batch[already_queued..].iter().take(room) {
            if !self.push(request) {
                break;
            }
        }

        loop {
            match self.ring.submit() {
                Ok(_) => break,
                Err(err) if interrupted(&err) => continue,
                Err(err) if err.raw_os_error() == Some(libc::EAGAIN)
                    || err.raw_os_error() == Some(libc::EBUSY) =>
                {
                    // Nothing consumed this time; the caller sees a partial accept.
                    break;
                }
                Err(source) => return Err(CopyError::Submit { source }),
            }
        }
        let accepted = self.account_consumed();
        tracing::trace!(accepted = accepted, queued = self.queued, "io_uring submit");
        Ok(accepted)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn wait(
        &mut self,
        min: usize,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<CompletionEvent>> {
        if min > self.outstanding {
            return Err(CopyError::invalid_wait(min, self.outstanding));
        }
        self.reap_timeout = timeout;
        if self.ring.completion().len() < min {
            self.enter_and_wait(min, timeout).map_err(CopyError::wait)?;
            self.account_consumed();
        }

        let events: Vec<CompletionEvent> = self
            .ring
            .completion()
            .take(max)
            .map(|cqe| CompletionEvent::new(cqe.user_data() as usize, cqe.result() as i64))
            .collect();
        for event in &events {
            self.forget(event.slot as u64);
        }
        self.outstanding -= events.len();
        Ok(events)
    }

    fn destroy(mut self) -> Result<()> {
        self.shutdown().map_err(|source| CopyError::Destroy { source })
    }
}

impl Drop for UringContext {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!(
                outstanding = self.outstanding,
                "io_uring context dropped without destroy"
            );
            if let Err(err) = self.shutdown() {
                tracing::warn!(error = %err, "Implicit io_uring teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Write,
        os::fd::{AsRawFd, FromRawFd, OwnedFd},
    };

    const B: usize = 16;

    fn context(capacity: u32) -> Option<UringContext> {
        match UringFacility::new().create(capacity) {
            Ok(context) => Some(context),
            Err(CopyError::Setup { source, .. }) => {
                eprintln!("skipping: io_uring unavailable ({source})");
                None
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    fn source(blocks: usize) -> (std::fs::File, Vec<u8>) {
        let data: Vec<u8> = (0..blocks * B).map(|i| (i * 13 + 1) as u8).collect();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&data).unwrap();
        (file, data)
    }

    fn reads(fd: i32, buffers: &mut [Vec<u8>]) -> Vec<Request> {
        buffers
            .iter_mut()
            .enumerate()
            .map(|(slot, buf)| {
                Request::new(fd, buf.as_mut_ptr(), B, (slot * B) as u64, OpKind::Read, slot)
            })
            .collect()
    }

    #[test]
    fn queued_entries_are_taken_as_the_head_of_the_next_batch() {
        let Some(mut context) = context(4) else {
            return;
        };
        let (file, data) = source(4);
        let mut buffers = vec![vec![0u8; B]; 4];
        let batch = reads(file.as_raw_fd(), &mut buffers);

        // As if an earlier submit left two entries unconsumed.
        unsafe {
            assert!(context.push(&batch[0]));
            assert!(context.push(&batch[1]));
        }
        assert_eq!(context.queued, 2);
        assert_eq!(unsafe { context.submit(&batch) }.unwrap(), 4);
        assert_eq!(context.queued, 0);
        assert_eq!(context.outstanding(), 4);

        let events = context.wait(4, 4, None).unwrap();
        let mut slots: Vec<usize> = events.iter().map(|e| e.slot).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert!(events.iter().all(|e| e.result == B as i64));
        assert_eq!(context.ring.completion().len(), 0);
        context.destroy().unwrap();

        assert_eq!(buffers.concat(), data);
    }

    #[test]
    fn small_ring_takes_a_batch_in_turns() {
        let Some(mut context) = context(2) else {
            return;
        };
        let (file, data) = source(4);
        let mut buffers = vec![vec![0u8; B]; 4];
        let batch = reads(file.as_raw_fd(), &mut buffers);

        let mut accepted = unsafe { context.submit(&batch) }.unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(unsafe { context.submit(&batch[accepted..]) }.unwrap(), 0);
        assert_eq!(context.wait(2, 2, None).unwrap().len(), 2);

        accepted += unsafe { context.submit(&batch[accepted..]) }.unwrap();
        assert_eq!(accepted, 4);
        assert_eq!(context.wait(2, 2, None).unwrap().len(), 2);
        context.destroy().unwrap();

        assert_eq!(buffers.concat(), data);
    }

    #[test]
    fn waiting_beyond_outstanding_is_refused() {
        let Some(mut context) = context(4) else {
            return;
        };
        let err = context.wait(1, 4, None).unwrap_err();
        match err {
            CopyError::Wait { source } => assert_eq!(source.kind(), io::ErrorKind::InvalidInput),
            other => panic!("unexpected error: {other}"),
        }
        context.destroy().unwrap();
    }

    #[test]
    fn teardown_cancels_a_read_that_never_completes() {
        let Some(mut context) = context(1) else {
            return;
        };
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (reader, _writer) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        let mut buffer = vec![0u8; B];
        let request = Request::new(
            reader.as_raw_fd(),
            buffer.as_mut_ptr(),
            B,
            0,
            OpKind::Read,
            0,
        );

        assert_eq!(unsafe { context.submit(&[request]) }.unwrap(), 1);
        let events = context
            .wait(1, 1, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(context.outstanding(), 1);

        let started = Instant::now();
        context.destroy().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(buffer);
    }
}
