//! Completion drain loop.
//!
//! Waits for completions in `[min, max]` bounded batches and writes every
//! completed read straight to the destination at its slot offset.

use std::time::Duration;

use crate::{
    engine::builder::ProgressPolicy,
    error::{CopyError, Result},
    facility::{CompletionContext, CompletionEvent},
    io::{allocator::SlotPool, batch::Batch, file::BlockSink},
};

/// Tunables of one drain.
#[derive(Debug, Clone, Copy)]
pub struct DrainOptions {
    /// Low-water mark. Clamped to the number of requests still outstanding.
    pub min_events: usize,
    pub timeout: Option<Duration>,
    pub write_policy: ProgressPolicy,
}

/// Outcome of one successful drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub drained: usize,
    pub wait_calls: usize,
    pub bytes_written: u64,
}

/// Drain the first `submitted` reads of `batch`.
///
/// Delivery order is whatever the facility reports; every event is written
/// at its own slot offset. The first fatal condition returns immediately
/// and leaves the remaining requests to the context teardown.
#[tracing::instrument(
    level = "trace",
    skip(context, batch, sink, options),
    fields(base = batch.base())
)]
pub fn drain<C, S>(
    context: &mut C,
    batch: &Batch<'_>,
    sink: &mut S,
    submitted: usize,
    options: &DrainOptions,
) -> Result<DrainReport>
where
    C: CompletionContext,
    S: BlockSink + ?Sized,
{
    let pool = batch.pool();
    let base = batch.base();
    let stat = pool.stat().clone();
    let mut in_flight = vec![false; pool.capacity()];
    for flag in in_flight.iter_mut().take(submitted) {
        *flag = true;
    }

    let mut report = DrainReport::default();
    while report.drained < submitted {
        let remaining = submitted - report.drained;
        let min = options.min_events.clamp(1, remaining);

        let events = context.wait(min, remaining, options.timeout)?;
        report.wait_calls += 1;
        stat.add_wait_call();
        if events.is_empty() {
            return Err(CopyError::wait(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no completion within {:?}", options.timeout),
            )));
        }
        tracing::debug!(
            events = events.len(),
            min = min,
            max = remaining,
            drained = report.drained,
            "Completions received"
        );

        for event in &events {
            let written =
                write_back(pool, sink, base, event, &mut in_flight, options.write_policy)?;
            report.bytes_written += written as u64;
            stat.add_bytes_written(written);
        }

        report.drained += events.len();
        stat.add_completed(events.len());
    }
    Ok(report)
}

fn write_back<S>(
    pool: &SlotPool,
    sink: &mut S,
    base: u64,
    event: &CompletionEvent,
    in_flight: &mut [bool],
    policy: ProgressPolicy,
) -> Result<usize>
where
    S: BlockSink + ?Sized,
{
    let slot = event.slot;
    match in_flight.get_mut(slot) {
        Some(flag) if *flag => *flag = false,
        _ => return Err(CopyError::UnknownCompletion { slot }),
    }

    let offset = base + pool.offset(slot);
    let expected = pool.block_size();
    let actual = event
        .bytes()
        .map_err(|source| CopyError::Read { slot, offset, source })?;
    if actual < expected {
        return Err(CopyError::ShortRead {
            slot,
            offset,
            expected,
            actual,
        });
    }
    tracing::trace!(slot = slot, offset = offset, "Writing back slot");

    let buffer = pool.buffer(slot);
    let mut written = 0;
    while written < expected {
        let n = sink
            .write_block_at(&buffer[written..], offset + written as u64)
            .map_err(|source| CopyError::Write {
                offset: offset + written as u64,
                source,
            })?;
        written += n;
        if written < expected && (n == 0 || policy == ProgressPolicy::Abort) {
            return Err(CopyError::ShortWrite {
                offset,
                expected,
                actual: written,
            });
        }
    }
    Ok(written)
}
