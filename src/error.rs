//! Errors reported by thread and thread-local storage operations.

use rustix::io;

/// The error type for every fallible operation in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The system could not create another thread, or no more identities or
    /// keys are available. The caller may retry or reduce concurrency.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(io::Errno),

    /// The thread handle was detached, already reclaimed, or never issued.
    #[error("invalid thread handle")]
    InvalidHandle,

    /// The thread handle was already consumed by a successful join.
    #[error("thread handle was already joined")]
    DoubleJoin,

    /// A thread tried to join itself.
    #[error("a thread cannot join itself")]
    Deadlock,

    /// The thread-specific storage key was deleted or never created.
    #[error("invalid thread-specific storage key")]
    InvalidKey,
}

impl Error {
    /// Is this a misuse of a thread handle?
    ///
    /// [`Error::DoubleJoin`] and [`Error::Deadlock`] are refinements of
    /// [`Error::InvalidHandle`].
    #[inline]
    #[must_use]
    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, Self::InvalidHandle | Self::DoubleJoin | Self::Deadlock)
    }

    /// The error used when a fixed-size table has no free entries.
    #[inline]
    pub(crate) fn exhausted() -> Self {
        Self::ResourceExhausted(io::Errno::AGAIN)
    }
}

/// A `Result` whose error type defaults to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_join_is_an_invalid_handle() {
        assert!(Error::DoubleJoin.is_invalid_handle());
        assert!(Error::Deadlock.is_invalid_handle());
        assert!(Error::InvalidHandle.is_invalid_handle());
        assert!(!Error::InvalidKey.is_invalid_handle());
        assert!(!Error::exhausted().is_invalid_handle());
    }

    #[test]
    fn display_mentions_the_errno() {
        let msg = Error::ResourceExhausted(io::Errno::AGAIN).to_string();
        assert!(msg.starts_with("resource exhausted: "), "{msg}");
    }
}
