use thiserror::Error;

/// Errors produced internally by `executor-internals` components.
///
/// This is the vocabulary components use to talk to each other; it is never
/// handed back to the supervisor directly. Every public entry point that can
/// fail converts an `Error` into a call to one of the fatal
/// [`Diagnostics`](crate::diagnostics) operations, which is what actually
/// determines the process's [`ExitClass`](crate::diagnostics::ExitClass).
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall failed in a way the caller treats as fatal to setup.
    #[error("syscall failed: {0}")]
    Sys(#[from] nix::Error),

    /// A filesystem operation failed in a way the caller treats as fatal to setup.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A capability-set operation failed.
    #[error("capability error: {0}")]
    Caps(String),

    /// A working directory could not be reclaimed after exhausting the retry budget.
    #[error("could not reclaim {path}: {reason}")]
    ReclaimFailed { path: String, reason: String },

    /// A catch-all for internal errors that don't warrant their own variant.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<caps::errors::CapsError> for Error {
    fn from(e: caps::errors::CapsError) -> Error {
        Error::Caps(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
