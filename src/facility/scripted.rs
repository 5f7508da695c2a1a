//! In-memory facility with injectable faults, used by unit tests.

use std::{cell::RefCell, io, rc::Rc, time::Duration};

use crate::{
    error::{CopyError, Result},
    facility::{CompletionContext, CompletionEvent, Facility, OpKind, Request},
};

#[derive(Default)]
pub(crate) struct Script {
    /// Bytes served to read requests, by absolute offset.
    pub source: Vec<u8>,
    /// Upper bound on requests accepted by each submit call.
    pub accept_limit: Option<usize>,
    /// Upper bound on events returned by each wait, never below `min`.
    pub max_per_wait: Option<usize>,
    /// Deliver the newest accepted requests first.
    pub reverse: bool,
    /// Every wait returns no events, as if its timeout expired.
    pub stall: bool,
    /// Report the first event of every wait twice.
    pub repeat_first: bool,
    pub fail_setup: bool,
    pub fail_wait: bool,
    pub fail_destroy: bool,
}

#[derive(Default, Debug)]
pub(crate) struct ScriptLog {
    pub created: usize,
    pub destroyed: usize,
    /// `(min, max, returned)` for every wait.
    pub waits: Vec<(usize, usize, usize)>,
    /// `(offered, accepted)` for every submit.
    pub submits: Vec<(usize, usize)>,
    /// Outstanding requests found at destroy time.
    pub reconciled: usize,
}

pub(crate) struct ScriptedFacility {
    pub script: Rc<Script>,
    pub log: Rc<RefCell<ScriptLog>>,
}

impl ScriptedFacility {
    pub fn new(script: Script) -> Self {
        ScriptedFacility {
            script: Rc::new(script),
            log: Rc::new(RefCell::new(ScriptLog::default())),
        }
    }
}

impl Facility for ScriptedFacility {
    type Context = ScriptedContext;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn create(&self, capacity: u32) -> Result<ScriptedContext> {
        if self.script.fail_setup {
            return Err(CopyError::Setup {
                backend: "scripted",
                capacity,
                source: io::Error::from_raw_os_error(libc::EAGAIN),
            });
        }
        self.log.borrow_mut().created += 1;
        Ok(ScriptedContext {
            capacity,
            pending: Vec::new(),
            script: self.script.clone(),
            log: self.log.clone(),
        })
    }
}

pub(crate) struct ScriptedContext {
    capacity: u32,
    pending: Vec<Request>,
    script: Rc<Script>,
    log: Rc<RefCell<ScriptLog>>,
}

impl ScriptedContext {
    fn complete(&self, request: &Request) -> i64 {
        match request.kind() {
            OpKind::Write => request.len() as i64,
            OpKind::Read => {
                let start = (request.offset() as usize).min(self.script.source.len());
                let end = (start + request.len()).min(self.script.source.len());
                let data = &self.script.source[start..end];
                let buf =
                    unsafe { std::slice::from_raw_parts_mut(request.as_mut_ptr(), request.len()) };
                buf[..data.len()].copy_from_slice(data);
                data.len() as i64
            }
        }
    }
}

impl CompletionContext for ScriptedContext {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn outstanding(&self) -> usize {
        self.pending.len()
    }

    unsafe fn submit(&mut self, batch: &[Request]) -> Result<usize> {
        let room = self.capacity as usize - self.pending.len();
        let limit = self.script.accept_limit.unwrap_or(usize::MAX).min(room);
        let accepted = batch.len().min(limit);
        self.pending.extend_from_slice(&batch[..accepted]);
        self.log.borrow_mut().submits.push((batch.len(), accepted));
        Ok(accepted)
    }

    fn wait(
        &mut self,
        min: usize,
        max: usize,
        _timeout: Option<Duration>,
    ) -> Result<Vec<CompletionEvent>> {
        if self.script.fail_wait {
            return Err(CopyError::wait(io::Error::from_raw_os_error(libc::EINVAL)));
        }
        if min > self.pending.len() {
            return Err(CopyError::invalid_wait(min, self.pending.len()));
        }
        if self.script.stall {
            self.log.borrow_mut().waits.push((min, max, 0));
            return Ok(Vec::new());
        }
        let count = max
            .min(self.pending.len())
            .min(self.script.max_per_wait.unwrap_or(usize::MAX))
            .max(min);
        let picked: Vec<Request> = if self.script.reverse {
            let keep = self.pending.len() - count;
            let mut tail = self.pending.split_off(keep);
            tail.reverse();
            tail
        } else {
            self.pending.drain(..count).collect()
        };
        let mut events = picked
            .iter()
            .map(|request| CompletionEvent::new(request.slot(), self.complete(request)))
            .collect::<Vec<_>>();
        if self.script.repeat_first {
            if let Some(&first) = events.first() {
                events.insert(1, first);
            }
        }
        self.log.borrow_mut().waits.push((min, max, events.len()));
        Ok(events)
    }

    fn destroy(self) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.destroyed += 1;
        log.reconciled += self.pending.len();
        if self.script.fail_destroy {
            return Err(CopyError::Destroy {
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        Ok(())
    }
}
