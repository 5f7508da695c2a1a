//! Ownership of the completion context and the slot pool for the duration
//! of one copy.

use std::rc::Rc;

use crate::{
    engine::{builder::CopyConfig, stat::CopyStat},
    error::Result,
    facility::{CompletionContext, Facility},
    io::allocator::SlotPool,
};

/// A context together with the slots its requests point into.
///
/// Field order matters: when a session is dropped without [`close`], the
/// context reconciles its outstanding requests before the pool is freed.
///
/// [`close`]: CopySession::close
pub struct CopySession<C: CompletionContext> {
    context: C,
    pool: SlotPool,
}

impl<C: CompletionContext> CopySession<C> {
    /// Allocate the slot pool, then create the context. If the context
    /// cannot be created the pool is released before returning.
    #[tracing::instrument(level = "trace", skip_all, fields(backend = facility.name()))]
    pub fn open<F>(facility: &F, config: &CopyConfig, stat: Rc<CopyStat>) -> Result<Self>
    where
        F: Facility<Context = C>,
    {
        let pool = SlotPool::allocate(config.batch_capacity as usize, config.block_size, stat)?;
        let context = facility.create(config.batch_capacity)?;
        tracing::debug!(
            backend = facility.name(),
            capacity = context.capacity(),
            block_size = config.block_size,
            "Copy session opened"
        );
        Ok(CopySession { context, pool })
    }

    pub fn parts_mut(&mut self) -> (&mut C, &mut SlotPool) {
        (&mut self.context, &mut self.pool)
    }

    /// Destroy the context, then release every slot.
    pub fn close(self) -> Result<()> {
        let CopySession { context, pool } = self;
        let destroyed = context.destroy();
        drop(pool);
        destroyed
    }

    /// Close the session after `outcome`. A teardown failure is reported
    /// only when the copy itself succeeded; otherwise the earlier error wins.
    pub fn close_with<T>(self, outcome: Result<T>) -> Result<T> {
        let teardown = self.close();
        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(teardown_err)) => {
                tracing::warn!(
                    error = %teardown_err,
                    "Context teardown failed after an earlier error"
                );
                Err(err)
            }
        }
    }
}
