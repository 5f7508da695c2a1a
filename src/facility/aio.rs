//! Completion context on the Linux native AIO syscalls.
//!
//! `io_setup`, `io_submit`, `io_getevents` and `io_destroy` are reached
//! through `libc::syscall`; the control block and event layouts follow
//! `linux/aio_abi.h`.

use std::{io, ptr, time::Duration};

use crate::{
    error::{CopyError, Result},
    facility::{CompletionContext, CompletionEvent, Facility, OpKind, Request},
};

type AioContextId = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// `struct iocb`. `aio_key` and `aio_rw_flags` swap places on big-endian
/// hosts; both are always zero here.
#[repr(C)]
#[derive(Default)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// `struct io_event`.
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

fn io_setup(nr: libc::c_uint, ctx: &mut AioContextId) -> io::Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_io_setup, nr, ctx as *mut AioContextId) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn io_destroy(ctx: AioContextId) -> io::Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn io_submit(ctx: AioContextId, iocbs: &mut [*mut Iocb]) -> io::Result<usize> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_submit,
            ctx,
            iocbs.len() as libc::c_long,
            iocbs.as_mut_ptr(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn io_getevents(
    ctx: AioContextId,
    min: usize,
    events: &mut [IoEvent],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |ts| ts as *const libc::timespec);
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            min as libc::c_long,
            events.len() as libc::c_long,
            events.as_mut_ptr(),
            ts_ptr,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AioFacility;

impl AioFacility {
    pub fn new() -> Self {
        AioFacility
    }
}

impl Facility for AioFacility {
    type Context = AioContext;

    fn name(&self) -> &'static str {
        "aio"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn create(&self, capacity: u32) -> Result<AioContext> {
        let mut id: AioContextId = 0;
        io_setup(capacity, &mut id).map_err(|source| CopyError::Setup {
            backend: "aio",
            capacity,
            source,
        })?;
        Ok(AioContext {
            id,
            capacity,
            outstanding: 0,
            destroyed: false,
        })
    }
}

pub struct AioContext {
    id: AioContextId,
    capacity: u32,
    outstanding: usize,
    destroyed: bool,
}

impl AioContext {
    fn shutdown(&mut self) -> io::Result<()> {
        self.destroyed = true;
        // io_destroy cancels what it can and blocks until the rest completes.
        io_destroy(self.id)?;
        self.outstanding = 0;
        Ok(())
    }
}

impl CompletionContext for AioContext {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[tracing::instrument(level = "trace", skip(self, batch), fields(len = batch.len()))]
    unsafe fn submit(&mut self, batch: &[Request]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        // The kernel copies each control block during io_submit.
        let mut iocbs: Vec<Iocb> = batch
            .iter()
            .map(|request| Iocb {
                aio_data: request.slot() as u64,
                aio_lio_opcode: match request.kind() {
                    OpKind::Read => IOCB_CMD_PREAD,
                    OpKind::Write => IOCB_CMD_PWRITE,
                },
                aio_fildes: request.fd() as u32,
                aio_buf: request.as_mut_ptr() as u64,
                aio_nbytes: request.len() as u64,
                aio_offset: request.offset() as i64,
                ..Default::default()
            })
            .collect();
        let mut pointers: Vec<*mut Iocb> = iocbs.iter_mut().map(|cb| cb as *mut Iocb).collect();

        let accepted = match io_submit(self.id, &mut pointers) {
            Ok(n) => n,
            // Nothing could be queued right now.
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => 0,
            Err(source) => return Err(CopyError::Submit { source }),
        };
        self.outstanding += accepted;
        tracing::trace!(accepted = accepted, "io_submit");
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
        let mut raw = vec![IoEvent::default(); max.min(self.outstanding)];
        let n = loop {
            match io_getevents(self.id, min, &mut raw, timeout) {
                Ok(n) => break n,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(CopyError::wait(err)),
            }
        };
        self.outstanding -= n;
        Ok(raw[..n]
            .iter()
            .map(|ev| CompletionEvent::new(ev.data as usize, ev.res))
            .collect())
    }

    fn destroy(mut self) -> Result<()> {
        self.shutdown().map_err(|source| CopyError::Destroy { source })
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!(
                outstanding = self.outstanding,
                "AIO context dropped without destroy"
            );
            if let Err(err) = self.shutdown() {
                tracing::warn!(error = %err, "Implicit AIO teardown failed");
            }
        }
    }
}
