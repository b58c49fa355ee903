//! Threading library similar to `std::thread` but supporting the remote
//! park operation ([`Thread::park_remote`]).
//!
//! Parking is a counted-token protocol over a socketpair: `unpark`
//! deposits a token, each park consumes one, and order does not matter.
//! Remote park forces the *target* thread to park by delivering a signal
//! whose handler parks in place; only socketpair system calls are used
//! on the parking path, which keeps it async-signal-safe.
use std::cell::Cell;
use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::ptr::null;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;

thread_local! {
    /// The current thread's `ThreadData`, published by [`spawn`].
    ///
    /// Const-initialized and `Drop`-free so that the access from the
    /// signal handler does not go through lazy initialization.
    static THREAD_DATA: Cell<*const ThreadData> = const { Cell::new(null()) };
}

/// A handle to a thread created by [`spawn`].
#[derive(Debug, Clone)]
pub(crate) struct Thread {
    data: Arc<ThreadData>,
}

#[derive(Debug)]
struct ThreadData {
    /// `[0]` is the token source (read by the parking thread), `[1]` the
    /// token sink (written by `unpark`).
    park_sock: [c_int; 2],
    /// The number of outstanding remote-park requests.
    park_count: AtomicUsize,
    pthread_id: AtomicUsize,
}

impl ThreadData {
    fn new() -> Self {
        let park_sock = unsafe {
            let mut sock = MaybeUninit::<[c_int; 2]>::uninit();
            let r = libc::socketpair(
                libc::PF_LOCAL,
                libc::SOCK_STREAM,
                0,
                sock.as_mut_ptr() as *mut c_int,
            );
            assert_eq!(r, 0, "socketpair failed: {}", errno::errno());
            sock.assume_init()
        };
        Self {
            park_sock,
            park_count: AtomicUsize::new(0),
            pthread_id: AtomicUsize::new(0),
        }
    }

    /// Record the calling thread's identity for `pthread_kill`.
    fn set_self(&self) {
        self.pthread_id
            .store(unsafe { libc::pthread_self() } as usize, Ordering::Release);
    }

    fn token_source(&self) -> c_int {
        self.park_sock[0]
    }

    fn token_sink(&self) -> c_int {
        self.park_sock[1]
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.park_sock[0]);
            libc::close(self.park_sock[1]);
        }
    }
}

/// Spawn a thread and return its handle. The thread is detached; it runs
/// `f` to completion and then exits.
pub(crate) fn spawn(f: impl FnOnce() + Send + 'static) -> Thread {
    let data = Arc::new(ThreadData::new());
    let data2 = Arc::clone(&data);

    thread::spawn(move || {
        data2.set_self();
        THREAD_DATA.with(|c| c.set(Arc::as_ptr(&data2)));

        f();

        // `data2` stays owned by this closure until here, keeping the
        // pointer in `THREAD_DATA` valid for the thread's whole life.
        THREAD_DATA.with(|c| c.set(null()));
    });

    // Wait until the child has recorded its identity; `park_remote`
    // relies on `pthread_id` being valid.
    while data.pthread_id.load(Ordering::Acquire) == 0 {
        thread::yield_now();
    }

    Thread { data }
}

/// Park the calling thread until a token is available, consuming it.
pub(crate) fn park_current() {
    let data_ptr = THREAD_DATA.with(|c| c.get());
    assert!(!data_ptr.is_null(), "not a thread created by `spawn`");
    // Safety: published by `spawn` and kept alive until the thread ends.
    park_inner(unsafe { &*data_ptr });
}

fn park_inner(data: &ThreadData) {
    loop {
        let mut token = 0u8;
        let n = unsafe {
            libc::recv(
                data.token_source(),
                &mut token as *mut u8 as *mut libc::c_void,
                1,
                0,
            )
        };
        match n {
            1 => break,
            0 => continue,
            _ => {
                let err = errno::errno();
                match err.0 {
                    // Interrupted (e.g. by the remote-park signal) or a
                    // spurious wakeup; take the token again.
                    libc::EINTR | libc::EAGAIN => continue,
                    _ => panic!("failed to take a park token: {err}"),
                }
            }
        }
    }
}

impl Thread {
    /// Make a new park token available for the thread. A thread can hold
    /// several tokens; each park consumes one.
    pub(crate) fn unpark(&self) {
        let n = unsafe {
            libc::send(
                self.data.token_sink(),
                &0u8 as *const u8 as *const libc::c_void,
                1,
                0,
            )
        };
        assert_eq!(n, 1, "failed to deposit a park token: {}", errno::errno());
    }

    /// Force the thread to park, as if it had called [`park_current`]
    /// itself. Returns once the target has stopped running.
    ///
    /// Must not be called for the calling thread.
    pub(crate) fn park_remote(&self) {
        static SIGNAL_HANDLER_ONCE: Once = Once::new();
        SIGNAL_HANDLER_ONCE.call_once(register_remote_park_signal_handler);

        let pthread_id = self.data.pthread_id.load(Ordering::Relaxed) as libc::pthread_t;

        self.data.park_count.fetch_add(1, Ordering::SeqCst);

        // Force the target to execute `remote_park_signal_handler`.
        let r = unsafe { libc::pthread_kill(pthread_id, SIGNAL_REMOTE_PARK) };
        assert_eq!(r, 0, "pthread_kill failed: {}", errno::Errno(r));

        // Wait until the signal is delivered and the target has parked.
        while self.data.park_count.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }
}

const SIGNAL_REMOTE_PARK: c_int = libc::SIGUSR1;

#[cold]
fn register_remote_park_signal_handler() {
    let handler: extern "C" fn(c_int) = remote_park_signal_handler;
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        // No SA_RESTART: a target blocked in a system call must still
        // enter the handler.
        let r = libc::sigaction(SIGNAL_REMOTE_PARK, &action, std::ptr::null_mut());
        assert_eq!(
            r,
            0,
            "failed to register the remote-park handler: {}",
            errno::errno()
        );
    }
}

extern "C" fn remote_park_signal_handler(_signo: c_int) {
    let data_ptr = THREAD_DATA.with(|c| c.get());
    assert!(!data_ptr.is_null());
    // Safety: the signal is only ever directed at threads created by
    // `spawn`, whose `ThreadData` outlives them.
    let data = unsafe { &*data_ptr };

    while data.park_count.load(Ordering::SeqCst) != 0 {
        data.park_count.fetch_sub(1, Ordering::SeqCst);

        // Park right here, inside the handler. The preempted thread
        // resumes (returns from the handler) when a token arrives.
        park_inner(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let thread = spawn(move || {
            park_current();
            ran2.store(true, Ordering::SeqCst);
        });
        thread.unpark();
        thread::sleep(Duration::from_millis(100));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn remote_park_stops_a_spinning_thread() {
        static PROGRESS: AtomicUsize = AtomicUsize::new(0);
        let thread = spawn(|| loop {
            PROGRESS.fetch_add(1, Ordering::SeqCst);
        });
        // Let it spin, then force it off the processor.
        thread::sleep(Duration::from_millis(50));
        thread.park_remote();
        let frozen = PROGRESS.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(PROGRESS.load(Ordering::SeqCst), frozen);
        // And let it continue.
        thread.unpark();
        thread::sleep(Duration::from_millis(50));
        assert!(PROGRESS.load(Ordering::SeqCst) > frozen);
    }
}
