//! Create, join and detach threads.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Barrier, mpsc};
use std::time::Duration;
use threadkit::thread::{self, Builder, PANIC_EXIT_CODE, Sleep};
use threadkit::{Error, ThreadState};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn each_join_returns_its_own_exit_code() {
    init_logger();

    let handles: Vec<_> = (0..16)
        .map(|i| (i, thread::spawn(|n: i32| n * 10 + 1, i).unwrap()))
        .collect();

    let mut seen = BTreeSet::new();
    for (i, handle) in handles {
        let code = thread::join(handle).unwrap();
        assert_eq!(code, i * 10 + 1);
        assert!(seen.insert(code));
    }
    assert_eq!(seen.len(), 16);
}

#[test]
fn boxed_ordinals_arrive_exactly_once() {
    init_logger();

    // Each thread owns its ordinal; there is no shared loop variable to race
    // on.
    let handles: Vec<_> = (0..5)
        .map(|i| thread::spawn(|ordinal: Box<i32>| *ordinal, Box::new(i)).unwrap())
        .collect();

    let mut codes: Vec<_> = handles
        .into_iter()
        .map(|handle| thread::join(handle).unwrap())
        .collect();
    codes.sort_unstable();
    assert_eq!(codes, [0, 1, 2, 3, 4]);
}

#[test]
fn closure_captures_are_moved_in() {
    let data = vec![1, 2, 3, 4];
    let handle = thread::spawn(move |scale: i32| data.iter().sum::<i32>() * scale, 2).unwrap();
    assert_eq!(thread::join(handle), Ok(20));
}

#[test]
fn join_twice_is_double_join() {
    let handle = thread::spawn(|()| 0, ()).unwrap();
    assert_eq!(thread::join(handle), Ok(0));
    assert_eq!(thread::join(handle), Err(Error::DoubleJoin));
    assert_eq!(thread::state(handle), ThreadState::Reclaimed);
}

#[test]
fn join_twice_is_double_join_after_other_threads_come_and_go() {
    let handle = thread::spawn(|()| 1, ()).unwrap();
    assert_eq!(thread::join(handle), Ok(1));

    for code in 2..6 {
        let other = thread::spawn(move |()| code, ()).unwrap();
        assert_eq!(thread::join(other), Ok(code));
    }
    assert_eq!(thread::join(handle), Err(Error::DoubleJoin));
}

#[test]
fn detach_then_join_is_invalid() {
    let (release, wait) = mpsc::channel::<()>();
    let handle = thread::spawn(
        move |wait: mpsc::Receiver<()>| {
            let _ = wait.recv();
            0
        },
        wait,
    )
    .unwrap();

    thread::detach(handle).unwrap();
    assert_eq!(thread::state(handle), ThreadState::Detached);
    assert_eq!(thread::join(handle), Err(Error::InvalidHandle));
    assert_eq!(thread::detach(handle), Err(Error::InvalidHandle));

    release.send(()).unwrap();
}

#[test]
fn detach_after_completion() {
    let handle = thread::spawn(|()| 0, ()).unwrap();
    while thread::state(handle) == ThreadState::Running {
        thread::yield_now();
    }
    assert_eq!(thread::state(handle), ThreadState::Completed);
    thread::detach(handle).unwrap();
    assert_eq!(thread::state(handle), ThreadState::Reclaimed);
    assert_eq!(thread::join(handle), Err(Error::InvalidHandle));
}

#[test]
fn thread_can_detach_itself() {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(
        move |tx: mpsc::Sender<_>| {
            let me = thread::current().unwrap();
            tx.send((me, thread::detach(me))).unwrap();
            0
        },
        tx,
    )
    .unwrap();

    let (me, detached) = rx.recv().unwrap();
    assert_eq!(me, handle);
    assert_eq!(detached, Ok(()));
    assert!(thread::join(handle).unwrap_err().is_invalid_handle());
}

#[test]
fn joining_yourself_is_a_deadlock() {
    let handle = thread::spawn(
        |()| match thread::join(thread::current().unwrap()) {
            Err(Error::Deadlock) => 1,
            _ => 0,
        },
        (),
    )
    .unwrap();
    assert_eq!(thread::join(handle), Ok(1));
}

#[test]
fn at_exit_runs_before_join_returns() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = Arc::clone(&order);
    let handle = thread::spawn(
        move |log: Arc<std::sync::Mutex<Vec<&'static str>>>| {
            let first = Arc::clone(&log);
            thread::at_exit(Box::new(move || first.lock().unwrap().push("first")));
            let second = Arc::clone(&log);
            thread::at_exit(Box::new(move || {
                second.lock().unwrap().push("second");
                let nested = Arc::clone(&second);
                thread::at_exit(Box::new(move || nested.lock().unwrap().push("nested")));
            }));
            log.lock().unwrap().push("body");
            0
        },
        log,
    )
    .unwrap();

    thread::join(handle).unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        ["body", "second", "nested", "first"]
    );
}

#[test]
fn panicking_entry_completes_with_panic_code() {
    init_logger();

    let handle = thread::spawn(
        |()| -> i32 {
            panic!("entry function failed");
        },
        (),
    )
    .unwrap();
    assert_eq!(thread::join(handle), Ok(PANIC_EXIT_CODE));
}

#[test]
fn threads_run_concurrently() {
    // Every thread waits for all the others, so this only finishes if they
    // are all running at once.
    const N: usize = 4;
    let barrier = Arc::new(Barrier::new(N));
    let handles: Vec<_> = (0..N)
        .map(|_| {
            thread::spawn(
                |barrier: Arc<Barrier>| {
                    barrier.wait();
                    0
                },
                Arc::clone(&barrier),
            )
            .unwrap()
        })
        .collect();
    for handle in handles {
        assert_eq!(thread::join(handle), Ok(0));
    }
}

#[test]
fn current_inside_spawned_thread() {
    assert_eq!(thread::current(), None);

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(
        move |tx: mpsc::Sender<_>| {
            tx.send(thread::current()).unwrap();
            0
        },
        tx,
    )
    .unwrap();
    assert_eq!(rx.recv().unwrap(), Some(handle));
    thread::join(handle).unwrap();
}

#[test]
fn builder_configures_stack() {
    let handle = Builder::new()
        .stack_size(1)
        .guard_size(1)
        .spawn(
            |depth: u32| {
                fn recurse(n: u32) -> u32 {
                    if n == 0 { 0 } else { 1 + recurse(n - 1) }
                }
                recurse(depth) as i32
            },
            64,
        )
        .unwrap();
    assert_eq!(thread::join(handle), Ok(64));

    let handle = Builder::new()
        .stack_size(4 * 1024 * 1024)
        .spawn(
            |()| {
                let big = [7_u8; 1024 * 1024];
                i32::from(big[big.len() - 1])
            },
            (),
        )
        .unwrap();
    assert_eq!(thread::join(handle), Ok(7));
}

#[test]
fn joiner_observes_writes_made_before_exit() {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = thread::spawn(
        |flag: Arc<AtomicBool>| {
            flag.store(true, SeqCst);
            0
        },
        Arc::clone(&flag),
    )
    .unwrap();
    thread::join(handle).unwrap();
    assert!(flag.load(SeqCst));
}

#[test]
fn argument_is_dropped_by_the_thread() {
    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    let handle = thread::spawn(|_tracked: Tracked| 0, Tracked(Arc::clone(&drops))).unwrap();
    thread::join(handle).unwrap();
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn sleep_for_elapses() {
    let start = std::time::Instant::now();
    assert_eq!(thread::sleep_for(Duration::from_millis(20)), Sleep::Elapsed);
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert_eq!(thread::sleep_for(Duration::ZERO), Sleep::Elapsed);
}
