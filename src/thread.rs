//! Thread startup and shutdown.
//!
//! Threads are created with `pthread_create` and tracked by a process-wide
//! [`Registry`]. The entry function and its argument are moved into the new
//! thread, so the creator cannot keep mutating data the thread is about to
//! read:
//!
//! ```
//! use threadkit::thread;
//!
//! let handles: Vec<_> = (0..5)
//!     .map(|i| thread::spawn(|n: Box<i32>| *n, Box::new(i)).unwrap())
//!     .collect();
//! let mut codes: Vec<_> = handles.into_iter().map(|h| thread::join(h).unwrap()).collect();
//! codes.sort();
//! assert_eq!(codes, [0, 1, 2, 3, 4]);
//! ```
//!
//! When a thread's entry function returns, the thread runs its [`at_exit`]
//! callbacks, then the registry's exit hooks (which finalize keyed
//! thread-specific storage), and only then is it marked completed.

use crate::error::{Error, Result};
use crate::registry::{ExitCode, Registry, ThreadHandle, ThreadState};
use core::cell::{Cell, RefCell};
use core::cmp::max;
use core::ffi::c_void;
use core::mem::zeroed;
use core::ptr::null_mut;
use core::time::Duration;
use rustix::io;
use rustix::param::page_size;
use smallvec::SmallVec;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// The exit code recorded for a thread whose entry function panicked.
///
/// An entry function which returns `i32::MIN` itself is indistinguishable
/// from one which panicked.
pub const PANIC_EXIT_CODE: ExitCode = i32::MIN;

/// A `pthread_t` which has been neither joined nor detached yet.
pub(crate) struct Native(libc::pthread_t);

// SAFETY: A `pthread_t` is an identifier which any thread may join or detach.
unsafe impl Send for Native {}

impl Native {
    fn join(self) {
        // SAFETY: `Native` values are only created from successful
        // `pthread_create` calls, and are consumed by value.
        let r = unsafe { libc::pthread_join(self.0, null_mut()) };
        debug_assert_eq!(r, 0);
    }

    fn detach(self) {
        // SAFETY: As for `join`.
        let r = unsafe { libc::pthread_detach(self.0) };
        debug_assert_eq!(r, 0);
    }
}

static REGISTRY: Registry<Native> = Registry::new();

/// The registry behind every thread this module launches.
pub(crate) fn registry() -> &'static Registry<Native> {
    &REGISTRY
}

thread_local! {
    static CURRENT: Cell<Option<ThreadHandle>> = const { Cell::new(None) };
    static DTORS: Dtors = const { Dtors(RefCell::new(SmallVec::new_const())) };
}

/// Functions registered with [`at_exit`].
///
/// Threads launched here drain the list explicitly before they are marked
/// completed. On any other thread, whatever is left runs when the native
/// thread-local storage is torn down.
struct Dtors(RefCell<SmallVec<[Box<dyn FnOnce()>; 4]>>);

impl Drop for Dtors {
    fn drop(&mut self) {
        while let Some(func) = self.0.get_mut().pop() {
            func();
        }
    }
}

/// Thread configuration.
///
/// ```
/// let handle = threadkit::thread::Builder::new()
///     .stack_size(256 * 1024)
///     .spawn(|x: u8| i32::from(x) + 1, 41)
///     .unwrap();
/// assert_eq!(threadkit::thread::join(handle).unwrap(), 42);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Builder {
    stack_size: Option<usize>,
    guard_size: Option<usize>,
}

impl Builder {
    /// Start from the platform defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stack size for the new thread, in bytes.
    ///
    /// The size is raised to `PTHREAD_STACK_MIN` and rounded up to a whole
    /// number of pages. A size too large to round fails the spawn with
    /// [`Error::ResourceExhausted`].
    #[must_use]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the size of the guard region below the new thread's stack.
    #[must_use]
    pub fn guard_size(mut self, size: usize) -> Self {
        self.guard_size = Some(size);
        self
    }

    /// Start a thread running `entry(arg)`.
    ///
    /// `arg` is moved into the new thread. The value `entry` returns becomes
    /// the thread's exit code.
    pub fn spawn<F, A>(self, entry: F, arg: A) -> Result<ThreadHandle>
    where
        F: FnOnce(A) -> ExitCode + Send + 'static,
        A: Send + 'static,
    {
        let stack_size = round_up(
            max(
                self.stack_size.unwrap_or_else(default_stack_size),
                libc::PTHREAD_STACK_MIN,
            ),
            page_size(),
        )
        .ok_or(Error::ResourceExhausted(io::Errno::NOMEM))?;
        let guard_size = round_up(
            self.guard_size.unwrap_or_else(default_guard_size),
            page_size(),
        )
        .ok_or(Error::ResourceExhausted(io::Errno::NOMEM))?;

        let handle = REGISTRY.allocate()?;
        let main: Box<dyn FnOnce() + Send> = Box::new(move || run(handle, entry, arg));

        // SAFETY: `main` is `Send + 'static`, and the sizes are page-rounded
        // and at least the platform minimum.
        match unsafe { create_native(main, stack_size, guard_size) } {
            Ok(native) => {
                #[cfg(feature = "log")]
                log::trace!(
                    "Thread[{:?}] launched Thread[{}] with stack_size={} and guard_size={}",
                    rustix::thread::gettid().as_raw_nonzero(),
                    handle,
                    stack_size,
                    guard_size
                );

                if let Some(orphan) = REGISTRY.attach(handle, Native(native)) {
                    orphan.detach();
                }
                Ok(handle)
            }
            Err(errno) => {
                REGISTRY.release(handle);
                Err(Error::ResourceExhausted(errno))
            }
        }
    }
}

/// Start a thread running `entry(arg)` with the default configuration.
///
/// See [`Builder::spawn`].
pub fn spawn<F, A>(entry: F, arg: A) -> Result<ThreadHandle>
where
    F: FnOnce(A) -> ExitCode + Send + 'static,
    A: Send + 'static,
{
    Builder::new().spawn(entry, arg)
}

/// Create a native thread which calls `main`.
///
/// # Safety
///
/// `stack_size` and `guard_size` must be acceptable to
/// `pthread_attr_setstacksize` and `pthread_attr_setguardsize`.
unsafe fn create_native(
    main: Box<dyn FnOnce() + Send>,
    stack_size: usize,
    guard_size: usize,
) -> io::Result<libc::pthread_t> {
    extern "C" fn start(arg: *mut c_void) -> *mut c_void {
        // SAFETY: `arg` is the pointer `create_native` leaked below, and
        // ownership of it passes to this thread exactly once.
        let main = unsafe { Box::from_raw(arg.cast::<Box<dyn FnOnce() + Send>>()) };
        main();
        null_mut()
    }

    unsafe {
        let mut attr: libc::pthread_attr_t = zeroed();
        match libc::pthread_attr_init(&mut attr) {
            0 => (),
            err => return Err(io::Errno::from_raw_os_error(err)),
        }
        let configured = match libc::pthread_attr_setstacksize(&mut attr, stack_size) {
            0 => libc::pthread_attr_setguardsize(&mut attr, guard_size),
            err => err,
        };
        if configured != 0 {
            libc::pthread_attr_destroy(&mut attr);
            return Err(io::Errno::from_raw_os_error(configured));
        }

        let arg = Box::into_raw(Box::new(main));
        let mut native: libc::pthread_t = zeroed();
        let created = libc::pthread_create(&mut native, &attr, start, arg.cast());
        libc::pthread_attr_destroy(&mut attr);

        match created {
            0 => Ok(native),
            err => {
                // The thread never started, so the closure is still ours.
                drop(Box::from_raw(arg));
                Err(io::Errno::from_raw_os_error(err))
            }
        }
    }
}

/// The body of every thread launched by this module.
fn run<F, A>(handle: ThreadHandle, entry: F, arg: A)
where
    F: FnOnce(A) -> ExitCode,
{
    CURRENT.with(|current| current.set(Some(handle)));

    #[cfg(feature = "log")]
    log::trace!(
        "Thread[{:?}] running as Thread[{}]",
        rustix::thread::gettid().as_raw_nonzero(),
        handle
    );

    let code = match catch_unwind(AssertUnwindSafe(move || entry(arg))) {
        Ok(code) => code,
        Err(_) => {
            #[cfg(feature = "log")]
            log::warn!("Thread[{}] panicked", handle);
            PANIC_EXIT_CODE
        }
    };

    #[cfg(feature = "log")]
    log::trace!("Thread[{}] returned {}", handle, code);

    call_dtors();
    REGISTRY.finish(handle, code);
}

/// Call the functions registered with [`at_exit`], most recent first.
fn call_dtors() {
    // Leave the list unborrowed while calling, so that functions can
    // register more functions.
    while let Some(func) = DTORS.with(|dtors| dtors.0.borrow_mut().pop()) {
        #[cfg(feature = "log")]
        log::trace!(
            "Thread[{:?}] calling `thread::at_exit`-registered function",
            rustix::thread::gettid().as_raw_nonzero()
        );

        func();
    }
}

/// Waits for a thread to finish and returns its exit code.
///
/// When this returns, the thread's [`at_exit`] callbacks and thread-specific
/// storage destructors have all run.
pub fn join(handle: ThreadHandle) -> Result<ExitCode> {
    if current() == Some(handle) {
        return Err(Error::Deadlock);
    }

    #[cfg(feature = "log")]
    log::trace!(
        "Thread[{}] is being joined by Thread[{:?}]",
        handle,
        rustix::thread::gettid().as_raw_nonzero()
    );

    let (code, native) = REGISTRY.join(handle)?;
    if let Some(native) = native {
        native.join();
    }
    Ok(code)
}

/// Marks a thread as “detached”.
///
/// Detached threads reclaim their identity automatically when they exit,
/// rather than when they are joined. A thread may detach itself.
pub fn detach(handle: ThreadHandle) -> Result<()> {
    #[cfg(feature = "log")]
    log::trace!(
        "Thread[{}] marked as detached by Thread[{:?}]",
        handle,
        rustix::thread::gettid().as_raw_nonzero()
    );

    if let Some(native) = REGISTRY.detach(handle)? {
        native.detach();
    }
    Ok(())
}

/// Return the handle of the calling thread, if it was launched by
/// [`spawn`].
#[inline]
#[must_use]
pub fn current() -> Option<ThreadHandle> {
    CURRENT.try_with(Cell::get).ok().flatten()
}

/// Return the lifecycle state of `handle`.
#[must_use]
pub fn state(handle: ThreadHandle) -> ThreadState {
    REGISTRY.state(handle)
}

/// Return the number of thread identities not yet reclaimed.
///
/// This counts running threads, detached threads still running, and
/// finished threads nobody has joined.
#[must_use]
pub fn live_count() -> usize {
    REGISTRY.live_count()
}

/// Registers a function to call when the current thread exits.
///
/// Functions run in reverse order of registration and may register more
/// functions. If the thread is already tearing down its thread-local storage,
/// `func` is called immediately.
pub fn at_exit(func: Box<dyn FnOnce()>) {
    let mut func = Some(func);
    let _ = DTORS.try_with(|dtors| {
        if let Some(func) = func.take() {
            dtors.0.borrow_mut().push(func);
        }
    });
    if let Some(func) = func {
        func();
    }
}

/// The outcome of [`sleep_for`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Sleep {
    /// The whole duration elapsed.
    Elapsed,
    /// A signal handler interrupted the sleep.
    Interrupted {
        /// The part of the duration that was not slept.
        remaining: Duration,
    },
}

/// Suspend the calling thread for `duration`.
///
/// This only ever suspends the caller; there is no way to put another thread
/// to sleep or to interrupt one.
pub fn sleep_for(duration: Duration) -> Sleep {
    use rustix::thread::{NanosleepRelativeResult, Timespec, nanosleep};

    let request = Timespec {
        tv_sec: duration.as_secs().try_into().unwrap_or(i64::MAX as _),
        tv_nsec: duration.subsec_nanos() as _,
    };
    match nanosleep(&request) {
        NanosleepRelativeResult::Ok => Sleep::Elapsed,
        NanosleepRelativeResult::Interrupted(remaining) => Sleep::Interrupted {
            remaining: Duration::new(remaining.tv_sec as u64, remaining.tv_nsec as u32),
        },
        NanosleepRelativeResult::Err(err) => {
            debug_assert!(false, "nanosleep failed: {err}");
            Sleep::Elapsed
        }
    }
}

/// Yield the current thread, encouraging other threads to run.
#[inline]
pub fn yield_now() {
    rustix::thread::sched_yield()
}

/// Return the default stack size for new threads.
#[must_use]
pub fn default_stack_size() -> usize {
    unsafe {
        let mut attr: libc::pthread_attr_t = zeroed();
        if libc::pthread_attr_init(&mut attr) != 0 {
            return 0x20000;
        }
        let mut stack_size = 0;
        let r = libc::pthread_attr_getstacksize(&attr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if r != 0 {
            stack_size = 0;
        }

        // Never smaller than 128 KiB.
        max(0x20000, stack_size)
    }
}

/// Return the default guard size for new threads.
#[inline]
#[must_use]
pub fn default_guard_size() -> usize {
    page_size() * 4
}

const fn round_up(addr: usize, boundary: usize) -> Option<usize> {
    match addr.checked_add(boundary - 1) {
        Some(sum) => Some(sum & boundary.wrapping_neg()),
        None => None,
    }
}
