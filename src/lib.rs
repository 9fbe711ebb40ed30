//! Thread lifecycle and thread-local storage.
//!
//! - [`thread`] creates threads, joins and detaches them, and tracks every
//!   thread it creates in a [`registry::Registry`] of generation-counted
//!   identities.
//! - [`tss`] provides run-time keyed thread-specific storage with
//!   destructors.
//! - [`local`] provides declaration-time thread-local bindings, through the
//!   [`thread_static!`] macro.
//!
//! Data moves into a new thread by value; there is no way to hand a thread a
//! reference to the creator's stack. Per-thread state lives in [`tss`] keys
//! or [`local`] bindings rather than in shared globals.

#![deny(missing_docs)]

mod error;
pub mod local;
pub mod registry;
pub mod thread;
pub mod tss;

pub use error::{Error, Result};
pub use registry::{ExitCode, ThreadHandle, ThreadState};
