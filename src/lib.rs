//! Streaming, batched file copy over an asynchronous I/O completion
//! facility.
//!
//! A copy opens a bounded-capacity completion context, submits one read per
//! slot of a fixed [`SlotPool`](io::allocator::SlotPool), drains completions
//! in threshold-bounded batches and writes every completed block straight to
//! the destination, so outstanding reads overlap with synchronous writes.
//!
//! ```no_run
//! use aiocopy::{CopyConfig, CopyEngine, facility::uring::UringFacility};
//! use std::path::Path;
//!
//! let config = CopyConfig::builder()
//!     .block_size(4096)
//!     .batch_capacity(64)
//!     .min_drain_threshold(16)
//!     .build()?;
//! let engine = CopyEngine::new(config, UringFacility::new())?;
//! engine.copy_path(Path::new("in.bin"), Path::new("out.bin"))?;
//! # Ok::<(), aiocopy::CopyError>(())
//! ```

/// Copy engine, configuration, session lifecycle and statistics.
pub mod engine;
/// Error taxonomy.
pub mod error;
/// Completion facility interface and its backends.
pub mod facility;
/// Slot pool, batch submission, drain loop and file helpers.
pub mod io;

pub use engine::{
    builder::{CopyConfig, CopyConfigBuilder, ProgressPolicy},
    stat::CopyStat,
    CopyEngine, CopyReport,
};
pub use error::{CopyError, Phase, Result};
