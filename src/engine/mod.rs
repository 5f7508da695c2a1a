//! The copy engine: drives rounds of batched reads through a completion
//! context and writes every completed block back synchronously.

use std::{
    os::fd::{AsFd, AsRawFd, BorrowedFd},
    path::Path,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{
    error::{CopyError, Result},
    facility::Facility,
    io::{
        batch::{submit_batch, Batch},
        drain::{drain, DrainOptions},
        file::{create_destination, open_source, BlockSink},
    },
};

use builder::CopyConfig;
use session::CopySession;
use stat::CopyStat;

pub mod builder;
pub mod session;
pub mod stat;

/// Summary of a successful copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    pub bytes_copied: u64,
    pub rounds: u64,
    pub completions: u64,
    pub wait_calls: u64,
    pub elapsed: Duration,
}

pub struct CopyEngine<F: Facility> {
    config: CopyConfig,
    facility: F,
    stat: Rc<CopyStat>,
}

impl<F: Facility> CopyEngine<F> {
    pub fn new(config: CopyConfig, facility: F) -> Result<Self> {
        config.validate()?;
        Ok(CopyEngine {
            config,
            facility,
            stat: Rc::new(CopyStat::new()),
        })
    }

    pub fn facility(&self) -> &F {
        &self.facility
    }

    /// Counters accumulated over every copy run by this engine.
    pub fn stat(&self) -> &Rc<CopyStat> {
        &self.stat
    }

    /// Number of rounds needed for a source of `len` bytes; never zero.
    pub fn rounds_for(&self, len: u64) -> u64 {
        len.div_ceil(self.config.round_bytes()).max(1)
    }

    /// Open `source` and `destination`, then copy. Open failures are
    /// reported before any context is created.
    pub fn copy_path(&self, source: &Path, destination: &Path) -> Result<CopyReport> {
        let src = open_source(source)?;
        let mut dst = create_destination(destination)?;
        let len = src
            .metadata()
            .map_err(|err| CopyError::Open {
                path: source.to_path_buf(),
                source: err,
            })?
            .len();
        self.copy_from(src.as_fd(), len, &mut dst)
    }

    /// Copy `len` bytes of `source` into `sink`.
    #[tracing::instrument(level = "trace", skip(self, source, sink))]
    pub fn copy_from<S>(&self, source: BorrowedFd<'_>, len: u64, sink: &mut S) -> Result<CopyReport>
    where
        S: BlockSink + ?Sized,
    {
        let started = Instant::now();
        let rounds = self.rounds_for(len);
        let mut session = CopySession::open(&self.facility, &self.config, self.stat.clone())?;
        let outcome = self.run_rounds(&mut session, source, rounds, sink);
        let mut report = session.close_with(outcome)?;
        report.elapsed = started.elapsed();
        tracing::debug!(
            bytes = report.bytes_copied,
            rounds = report.rounds,
            wait_calls = report.wait_calls,
            "Copy finished"
        );
        Ok(report)
    }

    fn run_rounds<S>(
        &self,
        session: &mut CopySession<F::Context>,
        source: BorrowedFd<'_>,
        rounds: u64,
        sink: &mut S,
    ) -> Result<CopyReport>
    where
        S: BlockSink + ?Sized,
    {
        let options = DrainOptions {
            min_events: self.config.min_drain_threshold,
            timeout: self.config.wait_timeout,
            write_policy: self.config.write_policy,
        };
        let mut report = CopyReport {
            bytes_copied: 0,
            rounds: 0,
            completions: 0,
            wait_calls: 0,
            elapsed: Duration::ZERO,
        };

        let (context, pool) = session.parts_mut();
        for round in 0..rounds {
            let base = round * self.config.round_bytes();
            let batch = Batch::reads(pool, source.as_raw_fd(), base);
            // SAFETY: every accepted request is drained before the batch is
            // dropped, and on error the session destroys the context before
            // it frees the pool.
            let submitted =
                unsafe { submit_batch(context, &batch, self.config.submit_policy) }?;
            let drained = drain(context, &batch, sink, submitted, &options)?;

            report.rounds += 1;
            report.completions += drained.drained as u64;
            report.wait_calls += drained.wait_calls as u64;
            report.bytes_copied += drained.bytes_written;
        }
        Ok(report)
    }
}
