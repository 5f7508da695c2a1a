//! Error types for the copy engine.
//!
//! Every failure is fatal to the copy. Each variant belongs to exactly one
//! [`Phase`] so the operator diagnostic can name where the copy stopped.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Crate wide result alias.
pub type Result<T> = std::result::Result<T, CopyError>;

/// Stage of the copy in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Open,
    Setup,
    Submit,
    DrainWait,
    WriteBack,
    Destroy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Config => "config",
            Phase::Open => "open",
            Phase::Setup => "setup",
            Phase::Submit => "submit",
            Phase::DrainWait => "drain-wait",
            Phase::WriteBack => "write-back",
            Phase::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum CopyError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Slot buffers could not be obtained. Nothing is retained.
    #[error("cannot allocate {capacity} slots of {block_size} bytes: {reason}")]
    Resource {
        capacity: usize,
        block_size: usize,
        reason: String,
    },

    #[error("{backend} context with capacity {capacity} could not be created: {source}")]
    Setup {
        backend: &'static str,
        capacity: u32,
        #[source]
        source: io::Error,
    },

    #[error("request submission failed: {source}")]
    Submit {
        #[source]
        source: io::Error,
    },

    #[error("only {accepted} of {requested} requests were accepted")]
    PartialSubmit { accepted: usize, requested: usize },

    #[error("waiting for completions failed: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },

    #[error("completion for slot {slot} which is not in flight")]
    UnknownCompletion { slot: usize },

    #[error("read of slot {slot} at offset {offset} failed: {source}")]
    Read {
        slot: usize,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("short read on slot {slot} at offset {offset}: {actual} of {expected} bytes")]
    ShortRead {
        slot: usize,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("write at offset {offset} failed: {source}")]
    Write {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("short write at offset {offset}: {actual} of {expected} bytes")]
    ShortWrite {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("context teardown failed: {source}")]
    Destroy {
        #[source]
        source: io::Error,
    },
}

impl CopyError {
    pub fn phase(&self) -> Phase {
        match self {
            CopyError::Config(_) => Phase::Config,
            CopyError::Open { .. } => Phase::Open,
            CopyError::Resource { .. } | CopyError::Setup { .. } => Phase::Setup,
            CopyError::Submit { .. } | CopyError::PartialSubmit { .. } => Phase::Submit,
            CopyError::Wait { .. }
            | CopyError::UnknownCompletion { .. }
            | CopyError::Read { .. }
            | CopyError::ShortRead { .. } => Phase::DrainWait,
            CopyError::Write { .. } | CopyError::ShortWrite { .. } => Phase::WriteBack,
            CopyError::Destroy { .. } => Phase::Destroy,
        }
    }

    pub(crate) fn wait(source: io::Error) -> Self {
        CopyError::Wait { source }
    }

    pub(crate) fn invalid_wait(min: usize, outstanding: usize) -> Self {
        CopyError::Wait {
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("asked for {min} completions with only {outstanding} outstanding"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_phase_is_named_in_the_diagnostic_style() {
        let err = CopyError::ShortWrite {
            offset: 8192,
            expected: 4096,
            actual: 100,
        };
        assert_eq!(err.phase(), Phase::WriteBack);
        assert_eq!(err.phase().to_string(), "write-back");
        assert_eq!(
            err.to_string(),
            "short write at offset 8192: 100 of 4096 bytes"
        );

        let err = CopyError::PartialSubmit {
            accepted: 3,
            requested: 64,
        };
        assert_eq!(err.phase().to_string(), "submit");

        let err = CopyError::invalid_wait(4, 2);
        assert_eq!(err.phase(), Phase::DrainWait);
    }
}
