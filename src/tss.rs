//! Thread-specific storage.
//!
//! A [`Key`] is created at run time and names one slot in a process-wide key
//! table. Every thread sees its own value in that slot, and an optional
//! destructor finalizes values:
//!
//! - when a value is replaced by [`Key::set`],
//! - when the thread that set it exits,
//! - when the key is deleted with [`Key::delete`].
//!
//! Deleting a key finalizes *every* thread's value for it, synchronously, on
//! the thread that calls `delete`. That is why values must be `Send`.
//!
//! Exit-time destructors run through a [`crate::registry::Registry`] exit
//! hook on threads launched by [`crate::thread::spawn`], so they have run by
//! the time `join` returns. On any other thread they run when the native
//! thread-local storage is torn down.

use crate::error::{Error, Result};
use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};
use rustix_futex_sync::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Once};

/// Maximum number of live keys.
pub const KEYS_MAX: usize = 1024;

/// Maximum number of destructor passes on thread exit.
pub const DTOR_ITERATIONS: usize = 4;

type Value = Box<dyn Any + Send>;
type Dtor = Arc<dyn Fn(Value) + Send + Sync>;

struct Slot {
    generation: u32,
    live: bool,
    dtor: Option<Dtor>,
    values: HashMap<u64, Value>,
}

/// The bookkeeping behind every key. All methods run with the table lock
/// held, so none of them call destructors.
struct KeyTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    limit: usize,
}

impl KeyTable {
    const fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            limit,
        }
    }

    /// Claim the most recently freed slot, or a new one.
    fn create(&mut self, dtor: Option<Dtor>) -> Result<(u32, u32)> {
        if self.live >= self.limit {
            return Err(Error::exhausted());
        }
        let index = match self.free.pop() {
            Some(index) => index as usize,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    live: false,
                    dtor: None,
                    values: HashMap::new(),
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        debug_assert!(slot.values.is_empty());
        slot.live = true;
        slot.dtor = dtor;
        self.live += 1;
        Ok((index as u32, slot.generation))
    }

    fn slot_mut(&mut self, index: u32, generation: u32) -> Result<&mut Slot> {
        match self.slots.get_mut(index as usize) {
            Some(slot) if slot.live && slot.generation == generation => Ok(slot),
            _ => Err(Error::InvalidKey),
        }
    }

    /// Invalidate a key, returning its destructor and every thread's value.
    fn delete(&mut self, index: u32, generation: u32) -> Result<(Option<Dtor>, Vec<Value>)> {
        let slot = self.slot_mut(index, generation)?;
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        let dtor = slot.dtor.take();
        let values = slot.values.drain().map(|(_, value)| value).collect();
        self.free.push(index);
        self.live -= 1;
        Ok((dtor, values))
    }

    /// Remove every value `thread` holds, paired with its key's destructor.
    fn drain_thread(&mut self, thread: u64) -> Vec<(Option<Dtor>, Value)> {
        self.slots
            .iter_mut()
            .filter(|slot| slot.live)
            .filter_map(|slot| {
                let value = slot.values.remove(&thread)?;
                Some((slot.dtor.clone(), value))
            })
            .collect()
    }
}

static TABLE: Mutex<KeyTable> = Mutex::new(KeyTable::new(KEYS_MAX));

static EXIT_HOOK: Once = Once::new();

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

/// A value taken out of the table by [`Key::with`], returned on drop.
struct PutBack {
    thread: u64,
    index: u32,
    generation: u32,
    dtor: Option<Dtor>,
    value: Option<Value>,
}

impl Drop for PutBack {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        // Whatever the closure stored meanwhile is finalized, and so is the
        // value itself if the key is gone.
        let rejected = {
            let mut table = TABLE.lock();
            match table.slot_mut(self.index, self.generation) {
                Ok(slot) => slot.values.insert(self.thread, value),
                Err(_) => Some(value),
            }
        };
        if let Some(rejected) = rejected {
            finalize(self.dtor.as_ref(), rejected);
        }
    }
}

/// This thread's identity in the key table. Dropping it at native
/// thread-local teardown finalizes anything the exit hook did not.
struct LocalThread {
    id: u64,
}

impl Drop for LocalThread {
    fn drop(&mut self) {
        run_thread_exit(self.id);
    }
}

thread_local! {
    static LOCAL: LocalThread = LocalThread {
        id: NEXT_THREAD.fetch_add(1, Relaxed),
    };
}

fn local_id() -> Result<u64> {
    // Once the thread is tearing down its native thread-local storage there
    // is nowhere left to keep a value.
    LOCAL.try_with(|local| local.id).map_err(|_| Error::exhausted())
}

fn exit_hook() {
    if let Ok(id) = LOCAL.try_with(|local| local.id) {
        run_thread_exit(id);
    }
}

fn finalize(dtor: Option<&Dtor>, value: Value) {
    match dtor {
        Some(dtor) => dtor(value),
        None => drop(value),
    }
}

/// Run the destructors for everything `thread` holds.
///
/// Destructors may store new values; those are finalized in a further pass,
/// up to [`DTOR_ITERATIONS`] passes in all.
fn run_thread_exit(thread: u64) {
    for _ in 0..DTOR_ITERATIONS {
        let pending = TABLE.lock().drain_thread(thread);
        if pending.is_empty() {
            return;
        }

        #[cfg(feature = "log")]
        log::trace!(
            "Thread[{:?}] finalizing {} thread-specific values",
            rustix::thread::gettid().as_raw_nonzero(),
            pending.len()
        );

        for (dtor, value) in pending {
            finalize(dtor.as_ref(), value);
        }
    }

    let leftover = TABLE.lock().drain_thread(thread);
    if !leftover.is_empty() {
        #[cfg(feature = "log")]
        log::warn!(
            "Thread[{:?}] still held {} thread-specific values after {} destructor passes",
            rustix::thread::gettid().as_raw_nonzero(),
            leftover.len(),
            DTOR_ITERATIONS
        );
    }
    drop(leftover);
}

/// A key into thread-specific storage holding values of type `T`.
///
/// Keys are plain values; copies name the same slot. Once any copy is
/// deleted, every copy fails with [`Error::InvalidKey`], even after the slot
/// has been reused by a new key.
pub struct Key<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T: Send + 'static> Key<T> {
    /// Create a key without a destructor. Values are simply dropped.
    pub fn new() -> Result<Self> {
        Self::create(None)
    }

    /// Create a key whose values are finalized by `dtor`.
    pub fn with_destructor<F>(dtor: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::create(Some(Arc::new(move |value: Value| {
            if let Ok(value) = value.downcast::<T>() {
                dtor(*value);
            }
        })))
    }

    fn create(dtor: Option<Dtor>) -> Result<Self> {
        EXIT_HOOK.call_once(|| crate::thread::registry().register_exit_hook(exit_hook));

        let (index, generation) = TABLE.lock().create(dtor)?;

        #[cfg(feature = "log")]
        log::trace!("Created thread-specific key {}.{}", index, generation);

        Ok(Self {
            index,
            generation,
            _marker: PhantomData,
        })
    }

    /// Store `value` for the calling thread.
    ///
    /// A value already stored by this thread is passed to the destructor.
    pub fn set(&self, value: T) -> Result<()> {
        let thread = local_id()?;
        let (dtor, old) = {
            let mut table = TABLE.lock();
            let slot = table.slot_mut(self.index, self.generation)?;
            (slot.dtor.clone(), slot.values.insert(thread, Box::new(value)))
        };
        if let Some(old) = old {
            finalize(dtor.as_ref(), old);
        }
        Ok(())
    }

    /// Store `value` for the calling thread and return the previous value,
    /// without running the destructor on it.
    pub fn replace(&self, value: T) -> Result<Option<T>> {
        let thread = local_id()?;
        let old = TABLE
            .lock()
            .slot_mut(self.index, self.generation)?
            .values
            .insert(thread, Box::new(value));
        Ok(old.and_then(downcast::<T>))
    }

    /// Remove the calling thread's value and return it, without running the
    /// destructor on it.
    pub fn take(&self) -> Result<Option<T>> {
        let thread = local_id()?;
        let old = TABLE
            .lock()
            .slot_mut(self.index, self.generation)?
            .values
            .remove(&thread);
        Ok(old.and_then(downcast::<T>))
    }

    /// Return a copy of the calling thread's value. An unset key yields
    /// `Ok(None)`.
    pub fn get(&self) -> Result<Option<T>>
    where
        T: Clone,
    {
        let thread = local_id()?;
        let mut table = TABLE.lock();
        let slot = table.slot_mut(self.index, self.generation)?;
        Ok(slot
            .values
            .get(&thread)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned())
    }

    /// Does the calling thread have a value for this key?
    pub fn is_set(&self) -> Result<bool> {
        let thread = local_id()?;
        let mut table = TABLE.lock();
        let slot = table.slot_mut(self.index, self.generation)?;
        Ok(slot.values.contains_key(&thread))
    }

    /// Call `f` with mutable access to the calling thread's value.
    ///
    /// The value is taken out of the table for the duration of the call, so
    /// `f` may use this and other keys freely, but reading this key inside
    /// `f` sees it unset. If the key is deleted while `f` runs, the value is
    /// finalized as if it had been stored when the key was deleted. The
    /// value is put back even if `f` panics.
    pub fn with<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> Result<R> {
        let thread = local_id()?;
        let mut taken = {
            let mut table = TABLE.lock();
            let slot = table.slot_mut(self.index, self.generation)?;
            PutBack {
                thread,
                index: self.index,
                generation: self.generation,
                dtor: slot.dtor.clone(),
                value: slot.values.remove(&thread),
            }
        };
        Ok(f(taken
            .value
            .as_mut()
            .and_then(|value| value.downcast_mut::<T>())))
    }

    /// Delete this key.
    ///
    /// The destructor runs once for every thread that still holds a value,
    /// on the calling thread. Returns the number of values finalized.
    /// Afterwards every copy of this key fails with [`Error::InvalidKey`].
    pub fn delete(self) -> Result<usize> {
        let (dtor, values) = TABLE.lock().delete(self.index, self.generation)?;
        let count = values.len();

        #[cfg(feature = "log")]
        log::trace!(
            "Thread[{:?}] deleting thread-specific key {}.{} with {} live values",
            rustix::thread::gettid().as_raw_nonzero(),
            self.index,
            self.generation,
            count
        );

        for value in values {
            finalize(dtor.as_ref(), value);
        }
        Ok(count)
    }
}

fn downcast<T: 'static>(value: Value) -> Option<T> {
    value.downcast::<T>().ok().map(|value| *value)
}

/// Return the number of live keys.
#[must_use]
pub fn live_keys() -> usize {
    TABLE.lock().live
}
