use crate::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Shared stop flag for the pipeline threads and the step loop.
///
/// Any holder may request a stop; the first error attached to a stop request
/// is kept as the cause.
#[derive(Clone, Default)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stop: AtomicBool,
    cause: Mutex<Option<Error>>,
}

impl Coordinator {
    pub fn new() -> Coordinator {
        Coordinator::default()
    }

    pub fn should_stop(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
    }

    /// Stop with an error. Later errors are dropped.
    pub fn request_stop_with(&self, err: Error) {
        {
            let mut cause = self.inner.cause.lock().unwrap_or_else(|p| p.into_inner());
            if cause.is_none() {
                *cause = Some(err);
            }
        }
        self.request_stop();
    }

    /// Take the recorded cause, if the stop came from an error.
    pub fn take_cause(&self) -> Option<Error> {
        self.inner
            .cause
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Request a stop and wait up to `grace` for the threads to exit.
    ///
    /// Threads still running at the deadline are detached and reported in the
    /// returned count.
    pub fn join(&self, threads: Vec<JoinHandle<()>>, grace: Duration) -> usize {
        self.request_stop();
        let deadline = Instant::now() + grace;
        let mut pending = threads;
        loop {
            let (done, still_running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|h| h.is_finished());
            for handle in done {
                if handle.join().is_err() {
                    tracing::error!("pipeline thread panicked");
                }
            }
            pending = still_running;
            if pending.is_empty() {
                return 0;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    "{} pipeline thread(s) did not stop within {:?}, abandoning them",
                    pending.len(),
                    grace
                );
                return pending.len();
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}
