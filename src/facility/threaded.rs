//! Portable completion context backed by a fixed pool of worker threads.
//!
//! Workers pull requests from a job channel, perform a blocking `pread` or
//! `pwrite`, and push the result on a completion channel.

use std::{
    io,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::{
    error::{CopyError, Result},
    facility::{CompletionContext, CompletionEvent, Facility, OpKind, Request},
};

pub const DEFAULT_WORKERS: usize = 4;

/// Worker-thread emulation of a completion facility.
#[derive(Debug, Clone)]
pub struct ThreadedFacility {
    workers: usize,
}

impl Default for ThreadedFacility {
    fn default() -> Self {
        ThreadedFacility {
            workers: DEFAULT_WORKERS,
        }
    }
}

impl ThreadedFacility {
    pub fn new(workers: usize) -> Self {
        ThreadedFacility {
            workers: workers.max(1),
        }
    }
}

impl Facility for ThreadedFacility {
    type Context = ThreadedContext;

    fn name(&self) -> &'static str {
        "threads"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn create(&self, capacity: u32) -> Result<ThreadedContext> {
        let setup_error = |source| CopyError::Setup {
            backend: "threads",
            capacity,
            source,
        };
        if capacity == 0 {
            return Err(setup_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "capacity must be at least 1",
            )));
        }

        let (job_tx, job_rx) = unbounded::<Request>();
        let (done_tx, done_rx) = unbounded();
        let mut context = ThreadedContext {
            capacity,
            outstanding: 0,
            jobs: Some(job_tx),
            done: done_rx,
            workers: Vec::with_capacity(self.workers),
            destroyed: false,
        };
        for id in 0..self.workers.min(capacity as usize) {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("aiocopy-worker-{id}"))
                .spawn(move || worker_loop(jobs, done))
                .map_err(setup_error)?;
            context.workers.push(handle);
        }
        Ok(context)
    }
}

fn worker_loop(jobs: Receiver<Request>, done: Sender<CompletionEvent>) {
    while let Ok(request) = jobs.recv() {
        let result = execute(&request);
        if done.send(CompletionEvent::new(request.slot(), result)).is_err() {
            break;
        }
    }
}

fn execute(request: &Request) -> i64 {
    let ret = unsafe {
        match request.kind() {
            OpKind::Read => libc::pread(
                request.fd(),
                request.as_mut_ptr() as *mut libc::c_void,
                request.len(),
                request.offset() as libc::off_t,
            ),
            OpKind::Write => libc::pwrite(
                request.fd(),
                request.as_mut_ptr() as *const libc::c_void,
                request.len(),
                request.offset() as libc::off_t,
            ),
        }
    };
    if ret < 0 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        -(errno as i64)
    } else {
        ret as i64
    }
}

pub struct ThreadedContext {
    capacity: u32,
    outstanding: usize,
    jobs: Option<Sender<Request>>,
    done: Receiver<CompletionEvent>,
    workers: Vec<JoinHandle<()>>,
    destroyed: bool,
}

impl ThreadedContext {
    fn shutdown(&mut self) -> io::Result<()> {
        self.destroyed = true;
        // Closing the job channel lets workers finish queued requests and exit.
        self.jobs.take();
        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        while self.done.try_recv().is_ok() {
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        if panicked > 0 {
            return Err(io::Error::other(format!("{panicked} worker threads panicked")));
        }
        if self.outstanding > 0 {
            return Err(io::Error::other(format!(
                "{} requests never completed",
                self.outstanding
            )));
        }
        Ok(())
    }
}

impl CompletionContext for ThreadedContext {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[tracing::instrument(level = "trace", skip(self, batch), fields(len = batch.len()))]
    unsafe fn submit(&mut self, batch: &[Request]) -> Result<usize> {
        let jobs = self.jobs.as_ref().ok_or_else(|| CopyError::Submit {
            source: io::Error::other("context is shut down"),
        })?;
        let room = self.capacity as usize - self.outstanding;
        let mut accepted = 0;
        for request in batch.iter().take(room) {
            if jobs.send(*request).is_err() {
                break;
            }
            accepted += 1;
        }
        self.outstanding += accepted;
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
        let max = max.min(self.outstanding);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = Vec::with_capacity(max);

        while events.len() < min {
            let event = match deadline {
                None => self.done.recv().map_err(|_| {
                    CopyError::wait(io::Error::other("all workers exited"))
                })?,
                Some(deadline) => match self.done.recv_deadline(deadline) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(CopyError::wait(io::Error::other("all workers exited")))
                    }
                },
            };
            events.push(event);
        }
        while events.len() < max {
            match self.done.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        self.outstanding -= events.len();
        Ok(events)
    }

    fn destroy(mut self) -> Result<()> {
        self.shutdown().map_err(|source| CopyError::Destroy { source })
    }
}

impl Drop for ThreadedContext {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!(
                outstanding = self.outstanding,
                "Threaded context dropped without destroy"
            );
            if let Err(err) = self.shutdown() {
                tracing::warn!(error = %err, "Implicit threaded context teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn submit_is_bounded_by_capacity() {
        let file = tempfile::tempfile().unwrap();
        let mut buffers = vec![vec![0u8; 16]; 3];
        let batch: Vec<Request> = buffers
            .iter_mut()
            .enumerate()
            .map(|(slot, buf)| {
                Request::new(file.as_raw_fd(), buf.as_mut_ptr(), 16, 0, OpKind::Read, slot)
            })
            .collect();

        let mut context = ThreadedFacility::new(2).create(2).unwrap();
        assert_eq!(unsafe { context.submit(&batch) }.unwrap(), 2);
        assert_eq!(context.outstanding(), 2);

        let events = context.wait(2, 2, None).unwrap();
        assert_eq!(events.len(), 2);
        // Empty file: every read reports zero bytes.
        assert!(events.iter().all(|e| e.result == 0));
        assert_eq!(context.outstanding(), 0);
        context.destroy().unwrap();
    }

    #[test]
    fn wait_gives_up_at_the_deadline() {
        // No workers: submitted requests are never picked up.
        let (job_tx, _job_rx) = unbounded::<Request>();
        let (_done_tx, done_rx) = unbounded::<CompletionEvent>();
        let mut context = ThreadedContext {
            capacity: 2,
            outstanding: 0,
            jobs: Some(job_tx),
            done: done_rx,
            workers: Vec::new(),
            destroyed: false,
        };
        let mut buffer = vec![0u8; 16];
        let request = Request::new(-1, buffer.as_mut_ptr(), 16, 0, OpKind::Read, 0);
        assert_eq!(unsafe { context.submit(&[request]) }.unwrap(), 1);

        let started = Instant::now();
        let events = context.wait(1, 1, Some(Duration::from_millis(20))).unwrap();
        assert!(events.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(context.outstanding(), 1);

        let err = context.destroy().unwrap_err();
        assert!(matches!(err, CopyError::Destroy { .. }));
    }

    #[test]
    fn waiting_beyond_outstanding_is_refused() {
        let mut context = ThreadedFacility::default().create(4).unwrap();
        let err = context.wait(1, 4, None).unwrap_err();
        assert!(matches!(err, CopyError::Wait { .. }));
        context.destroy().unwrap();
    }
}
