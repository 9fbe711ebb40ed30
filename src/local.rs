//! Static thread-local bindings.
//!
//! A [`StaticLocal`] is declared once with [`thread_static!`] and exists
//! automatically on every thread that touches it, initialized on that thread
//! to the declared value. It is the declaration-time counterpart of the
//! run-time keys in [`crate::tss`].
//!
//! ```
//! threadkit::thread_static! {
//!     static COUNTER: u32 = 0;
//! }
//!
//! COUNTER.set(5);
//! let other = threadkit::thread::spawn(|()| COUNTER.get() as i32, ()).unwrap();
//! assert_eq!(threadkit::thread::join(other).unwrap(), 0);
//! assert_eq!(COUNTER.get(), 5);
//! ```

use core::cell::RefCell;
use std::thread::LocalKey;

/// Declare one or more [`StaticLocal`] bindings.
///
/// ```
/// threadkit::thread_static! {
///     /// Scratch space, one per thread.
///     pub static SCRATCH: Vec<u8> = Vec::new();
///     static DEPTH: usize = 0;
/// }
/// # SCRATCH.with_mut(|v| v.push(1));
/// # assert_eq!(DEPTH.get(), 0);
/// ```
#[macro_export]
macro_rules! thread_static {
    () => {};

    ($(#[$attr:meta])* $vis:vis static $name:ident: $t:ty = $init:expr; $($rest:tt)*) => {
        $(#[$attr])*
        $vis static $name: $crate::local::StaticLocal<$t> = {
            ::std::thread_local! {
                static INNER: ::core::cell::RefCell<$t> = ::core::cell::RefCell::new($init);
            }
            $crate::local::StaticLocal::new(&INNER)
        };

        $crate::thread_static!($($rest)*);
    };
}

/// A variable with an independent instance on every thread.
pub struct StaticLocal<T: 'static> {
    inner: &'static LocalKey<RefCell<T>>,
}

impl<T: 'static> StaticLocal<T> {
    #[doc(hidden)]
    pub const fn new(inner: &'static LocalKey<RefCell<T>>) -> Self {
        Self { inner }
    }

    /// Return a copy of this thread's value.
    pub fn get(&'static self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Overwrite this thread's value.
    pub fn set(&'static self, value: T) {
        drop(self.replace(value));
    }

    /// Overwrite this thread's value and return the old one.
    pub fn replace(&'static self, value: T) -> T {
        self.inner.with(|cell| cell.replace(value))
    }

    /// Reset this thread's value to `T::default()` and return the old one.
    pub fn take(&'static self) -> T
    where
        T: Default,
    {
        self.inner.with(|cell| cell.take())
    }

    /// Call `f` with a shared reference to this thread's value.
    ///
    /// # Panics
    ///
    /// Panics if `f` is called while [`StaticLocal::with_mut`] is active on
    /// the same binding, or after the thread's storage has been torn down.
    pub fn with<R>(&'static self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.with(|cell| f(&cell.borrow()))
    }

    /// Call `f` with a mutable reference to this thread's value.
    ///
    /// # Panics
    ///
    /// Panics on reentrant access to the same binding, or after the thread's
    /// storage has been torn down.
    pub fn with_mut<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> R {
        self.inner.with(|cell| f(&mut cell.borrow_mut()))
    }
}
