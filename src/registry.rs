//! Thread identities.
//!
//! A [`Registry`] is an arena of identity slots. Each slot carries a
//! generation counter which is bumped whenever the slot is reclaimed, so a
//! [`ThreadHandle`] that outlives its thread never aliases the slot's next
//! occupant.
//!
//! The registry knows nothing about how threads are actually run. The
//! launcher in [`crate::thread`] stores an opaque native token `T` alongside
//! each identity, and gets it back exactly once: from [`Registry::join`],
//! from [`Registry::detach`], or from [`Registry::attach`] when the identity
//! was already given up before the token arrived.

use crate::error::{Error, Result};
use core::fmt;
use rustix_futex_sync::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// The value a thread's entry function returns.
pub type ExitCode = i32;

/// An opaque identifier for one thread instance.
///
/// Handles are plain values. Copying one does not extend the life of the
/// thread it names; operations on a handle whose thread has been joined or
/// reclaimed fail instead.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ThreadHandle {
    index: u32,
    generation: u32,
}

impl ThreadHandle {
    /// The slot index of this handle. Indices are reused; generations are
    /// not (until they wrap).
    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// The generation of the slot at the time this handle was issued.
    #[inline]
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Pack this handle into a single integer.
    #[inline]
    #[must_use]
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpack a handle produced by [`ThreadHandle::to_raw`].
    #[inline]
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// The lifecycle state of a thread, as seen through its handle.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// The thread's entry function has not returned yet.
    Running,
    /// The thread has exited and is waiting to be joined.
    Completed,
    /// The thread was detached and is still running.
    Detached,
    /// The identity has been given up; the handle is stale.
    Reclaimed,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Occupant {
    Running,
    Completed(ExitCode),
    Detached,
    Vacant,
}

/// How an occupant of a slot gave it up.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Retired {
    Joined,
    Detached,
    Abandoned,
}

struct Slot<T> {
    generation: u32,
    occupant: Occupant,
    native: Option<T>,
    /// Past generations that were not retired by a join, in ascending order.
    unjoined: Vec<u32>,
}

struct Table<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
    live: usize,
    limit: usize,
}

impl<T> Table<T> {
    const fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            live: 0,
            limit,
        }
    }

    /// Find the slot `handle` refers to, if `handle` is still current.
    ///
    /// A stale handle whose generation was retired by a join reports
    /// [`Error::DoubleJoin`], however many times the slot has been reused
    /// since.
    fn lookup(&mut self, handle: ThreadHandle) -> Result<&mut Slot<T>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation == handle.generation && slot.occupant != Occupant::Vacant {
            Ok(slot)
        } else if handle.generation < slot.generation
            && slot.unjoined.binary_search(&handle.generation).is_err()
        {
            Err(Error::DoubleJoin)
        } else {
            Err(Error::InvalidHandle)
        }
    }

    fn slot_mut(&mut self, index: u32) -> &mut Slot<T> {
        &mut self.slots[index as usize]
    }

    /// Give up the identity in slot `index` and queue the slot for reuse.
    fn reclaim(&mut self, index: u32, retired: Retired) -> Option<T> {
        let slot = self.slot_mut(index);
        slot.occupant = Occupant::Vacant;
        if retired != Retired::Joined {
            slot.unjoined.push(slot.generation);
        }
        let native = slot.native.take();
        // A slot whose generations are used up is never handed out again.
        if let Some(next) = slot.generation.checked_add(1) {
            slot.generation = next;
            self.free.push_back(index);
        }
        self.live -= 1;
        native
    }
}

/// A process-wide table of thread identities.
pub struct Registry<T> {
    table: Mutex<Table<T>>,
    completed: Condvar,
    hooks: Mutex<SmallVec<[fn(); 4]>>,
}

impl<T> Registry<T> {
    /// Create an empty registry with no practical limit on live identities.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(u32::MAX as usize)
    }

    /// Create an empty registry which holds at most `limit` slots.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            table: Mutex::new(Table::new(limit)),
            completed: Condvar::new(),
            hooks: Mutex::new(SmallVec::new_const()),
        }
    }

    /// Produce a fresh identity in the [`ThreadState::Running`] state.
    ///
    /// Vacant slots are reused oldest-first.
    pub fn allocate(&self) -> Result<ThreadHandle> {
        let mut table = self.table.lock();
        let index = match table.free.pop_front() {
            Some(index) => index,
            None if table.slots.len() < table.limit => {
                table.slots.push(Slot {
                    generation: 0,
                    occupant: Occupant::Vacant,
                    native: None,
                    unjoined: Vec::new(),
                });
                (table.slots.len() - 1) as u32
            }
            None => return Err(Error::exhausted()),
        };
        table.live += 1;
        let slot = table.slot_mut(index);
        debug_assert_eq!(slot.occupant, Occupant::Vacant);
        slot.occupant = Occupant::Running;
        Ok(ThreadHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Record the native token for `handle`.
    ///
    /// If the identity was already detached or reclaimed, nobody will ever
    /// ask for the token, so it is handed straight back to the caller.
    pub fn attach(&self, handle: ThreadHandle, native: T) -> Option<T> {
        let mut table = self.table.lock();
        match table.lookup(handle) {
            Ok(slot) if slot.occupant != Occupant::Detached => {
                debug_assert!(slot.native.is_none());
                slot.native = Some(native);
                None
            }
            _ => Some(native),
        }
    }

    /// Give up an identity whose thread never started.
    pub fn release(&self, handle: ThreadHandle) {
        let mut table = self.table.lock();
        if table.lookup(handle).is_ok() {
            table.reclaim(handle.index, Retired::Abandoned);
        }
    }

    /// Record that the thread behind `handle` has exited with `code`.
    ///
    /// This is called exactly once, on the exiting thread. The exit hooks run
    /// first, so anything they do happens before a joiner can observe the
    /// completion. A detached thread's identity is reclaimed here.
    pub fn finish(&self, handle: ThreadHandle, code: ExitCode) {
        self.run_exit_hooks();

        let mut table = self.table.lock();
        let occupant = match table.lookup(handle) {
            Ok(slot) => slot.occupant,
            Err(_) => {
                debug_assert!(false, "Thread[{handle}] finished twice");
                return;
            }
        };
        let native = match occupant {
            Occupant::Running => {
                table.slot_mut(handle.index).occupant = Occupant::Completed(code);
                None
            }
            Occupant::Detached => table.reclaim(handle.index, Retired::Detached),
            Occupant::Completed(_) | Occupant::Vacant => {
                debug_assert!(false, "Thread[{handle}] finished twice");
                None
            }
        };
        drop(table);
        drop(native);

        self.completed.notify_all();
    }

    /// Block until the thread behind `handle` has finished, then reclaim its
    /// identity and return its exit code and native token.
    pub fn join(&self, handle: ThreadHandle) -> Result<(ExitCode, Option<T>)> {
        let mut table = self.table.lock();
        loop {
            let occupant = table.lookup(handle)?.occupant;
            match occupant {
                Occupant::Running => table = self.completed.wait(table),
                Occupant::Completed(code) => {
                    let native = table.reclaim(handle.index, Retired::Joined);
                    return Ok((code, native));
                }
                Occupant::Detached | Occupant::Vacant => return Err(Error::InvalidHandle),
            }
        }
    }

    /// Give up the right to join `handle`.
    ///
    /// A running thread reclaims its own identity when it finishes; a
    /// finished one is reclaimed immediately. The native token, if it has
    /// been attached, is returned so the caller can release it.
    pub fn detach(&self, handle: ThreadHandle) -> Result<Option<T>> {
        let mut table = self.table.lock();
        let occupant = table
            .lookup(handle)
            .map_err(|_| Error::InvalidHandle)?
            .occupant;
        let native = match occupant {
            Occupant::Running => {
                let slot = table.slot_mut(handle.index);
                slot.occupant = Occupant::Detached;
                slot.native.take()
            }
            Occupant::Completed(_) => table.reclaim(handle.index, Retired::Detached),
            Occupant::Detached | Occupant::Vacant => return Err(Error::InvalidHandle),
        };
        drop(table);

        // Joiners blocked on this handle must now fail.
        self.completed.notify_all();
        Ok(native)
    }

    /// The current state of `handle`.
    #[must_use]
    pub fn state(&self, handle: ThreadHandle) -> ThreadState {
        let mut table = self.table.lock();
        match table.lookup(handle).map(|slot| slot.occupant) {
            Ok(Occupant::Running) => ThreadState::Running,
            Ok(Occupant::Completed(_)) => ThreadState::Completed,
            Ok(Occupant::Detached) => ThreadState::Detached,
            Ok(Occupant::Vacant) | Err(_) => ThreadState::Reclaimed,
        }
    }

    /// The number of identities which have not been reclaimed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.table.lock().live
    }

    /// Register `hook` to run on every exiting thread, just before the
    /// thread is marked completed.
    pub fn register_exit_hook(&self, hook: fn()) {
        self.hooks.lock().push(hook);
    }

    fn run_exit_hooks(&self) {
        // Copy the list out so that hooks may register further hooks.
        let hooks = self.hooks.lock().clone();
        for hook in hooks {
            hook();
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
