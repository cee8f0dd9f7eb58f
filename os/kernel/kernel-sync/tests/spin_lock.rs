use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn guard_releases_on_drop() {
    let lock = SpinLock::new(0_u32);
    {
        let mut g = lock.lock();
        *g = 41;
        assert!(lock.try_lock().is_none());
    }

    let mut g = lock.try_lock().expect("released");
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn with_lock_returns_the_closure_result() {
    let lock = SpinLock::new(vec![1, 2]);
    let len = lock.with_lock(|v| {
        v.push(3);
        v.len()
    });
    assert_eq!(len, 3);
    assert!(lock.try_lock().is_some());
}

#[test]
fn get_mut_needs_no_locking() {
    let mut lock = SpinLock::new(String::from("a"));
    lock.get_mut().push('b');
    assert_eq!(lock.lock().as_str(), "ab");
}

#[test]
fn contended_updates_are_exclusive() {
    const THREADS: usize = 4;
    const ITERS: usize = 2_000;

    let lock = Arc::new(SpinLock::new(0_usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..ITERS {
                    lock.with_lock(|n| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *n += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*lock.lock(), THREADS * ITERS);
}
