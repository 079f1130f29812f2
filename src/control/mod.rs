//! The cooperative scheduler. One worker thread runs every posted task and
//! timer in order, so torrent state it owns never needs a lock. Other
//! threads (disk, network) hand their results back with `post`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time;

use crate::errors::{ErrorKind, Result};
use crate::util::panic_msg;

pub mod job;

type Task = Box<dyn FnOnce() + Send>;

enum Msg {
    Task(Task),
    Timer(time::Duration, job::Job),
    Shutdown,
}

/// Handle to a scheduler worker. Clones share the worker, which exits once
/// the last handle is dropped or `shutdown` is called.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    tx: Mutex<mpsc::Sender<Msg>>,
    tid: thread::ThreadId,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Worker {
    rx: mpsc::Receiver<Msg>,
    jobs: job::JobManager,
}

impl Scheduler {
    pub fn new() -> Result<Scheduler> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("scheduler".to_owned())
            .spawn(move || {
                Worker {
                    rx,
                    jobs: job::JobManager::new(),
                }
                .run()
            })?;
        let tid = handle.thread().id();
        Ok(Scheduler {
            inner: Arc::new(Inner {
                tx: Mutex::new(tx),
                tid,
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    /// True when called from a task or timer running on this scheduler.
    pub fn on_worker(&self) -> bool {
        thread::current().id() == self.inner.tid
    }

    /// Queues a task behind everything posted before it.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Msg::Task(Box::new(f)))
    }

    /// Runs a task on the worker and waits for its result. When already on
    /// the worker the task runs inline. A panic in the task is returned to
    /// the caller as `TaskPanicked`.
    pub fn post_and_wait<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.on_worker() {
            return panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|e| ErrorKind::TaskPanicked(panic_msg(&e)).into());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.post(move || {
            let res = panic::catch_unwind(AssertUnwindSafe(f)).map_err(|e| panic_msg(&e));
            tx.send(res).ok();
        })?;
        match rx.recv() {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(msg)) => Err(ErrorKind::TaskPanicked(msg).into()),
            Err(_) => Err(ErrorKind::SchedulerClosed.into()),
        }
    }

    /// Registers a timer which fires after `interval`, and again after each
    /// further `interval` for as long as it returns true.
    pub fn post_timer<F>(&self, interval: time::Duration, f: F) -> Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.send(Msg::Timer(interval, Box::new(f)))
    }

    /// Stops the worker after the tasks already queued. Waits for it to exit
    /// unless called from the worker itself.
    pub fn shutdown(&self) {
        self.inner.shutdown(!self.on_worker());
    }

    fn send(&self, msg: Msg) -> Result<()> {
        let tx = self
            .inner
            .tx
            .lock()
            .map_err(|_| ErrorKind::SchedulerClosed)?;
        tx.send(msg).map_err(|_| ErrorKind::SchedulerClosed.into())
    }
}

impl Inner {
    fn shutdown(&self, join: bool) {
        if let Ok(tx) = self.tx.lock() {
            tx.send(Msg::Shutdown).ok();
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(h) = handle {
            if join && h.join().is_err() {
                error!("Scheduler worker exited abnormally");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let join = thread::current().id() != self.tid;
        self.shutdown(join);
    }
}

impl Worker {
    fn run(mut self) {
        debug!("Scheduler started");
        loop {
            let msg = match self.jobs.next_timeout() {
                Some(t) => match self.rx.recv_timeout(t) {
                    Ok(m) => Some(m),
                    Err(mpsc::RecvTimeoutError::Timeout) => None,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(m) => Some(m),
                    Err(_) => break,
                },
            };
            match msg {
                Some(Msg::Task(t)) => {
                    if let Err(e) = panic::catch_unwind(AssertUnwindSafe(t)) {
                        error!("Scheduled task panicked: {}", panic_msg(&e));
                    }
                }
                Some(Msg::Timer(interval, job)) => self.jobs.add_job(job, interval),
                Some(Msg::Shutdown) => break,
                None => {}
            }
            self.jobs.update();
        }
        debug!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fifo() {
        let s = Scheduler::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let o = order.clone();
            s.post(move || o.lock().unwrap().push(i)).unwrap();
        }
        s.post_and_wait(|| ()).unwrap();
        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_result() {
        let s = Scheduler::new().unwrap();
        assert_eq!(s.post_and_wait(|| 2 + 2).unwrap(), 4);
        let on = {
            let s2 = s.clone();
            s.post_and_wait(move || s2.on_worker()).unwrap()
        };
        assert!(on);
        assert!(!s.on_worker());
    }

    #[test]
    fn test_reentrant_wait() {
        let s = Scheduler::new().unwrap();
        let s2 = s.clone();
        let r = s
            .post_and_wait(move || s2.post_and_wait(|| 7).unwrap() * 2)
            .unwrap();
        assert_eq!(r, 14);
    }

    #[test]
    fn test_wait_panic() {
        let s = Scheduler::new().unwrap();
        let err = s.post_and_wait(|| -> u32 { panic!("bad task") }).unwrap_err();
        assert_matches!(err.kind(), ErrorKind::TaskPanicked(m) if m == "bad task");
        // The worker survives.
        assert_eq!(s.post_and_wait(|| 1).unwrap(), 1);
    }

    #[test]
    fn test_post_panic() {
        let s = Scheduler::new().unwrap();
        s.post(|| panic!("fire and forget")).unwrap();
        assert_eq!(s.post_and_wait(|| 3).unwrap(), 3);
    }

    #[test]
    fn test_timer() {
        let s = Scheduler::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        s.post_timer(time::Duration::from_millis(5), move || {
            r.fetch_add(1, Ordering::SeqCst) < 2
        })
        .unwrap();
        thread::sleep(time::Duration::from_millis(200));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_shutdown() {
        let s = Scheduler::new().unwrap();
        s.shutdown();
        assert_matches!(s.post(|| ()).unwrap_err().kind(), ErrorKind::SchedulerClosed);
        assert_matches!(
            s.post_and_wait(|| ()).unwrap_err().kind(),
            ErrorKind::SchedulerClosed
        );
    }
}
