//! Data path of a copy: the slot pool, batch submission, the completion
//! drain loop and the destination writer.

pub mod allocator;
pub mod batch;
pub mod drain;
pub mod file;
