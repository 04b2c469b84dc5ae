//! Fixed-size thread pools, one per inbound message kind.

use log::{trace, warn};
use parking_lot::Mutex;

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn work(name: &str, jobs: &Mutex<Receiver<Job>>) {
    loop {
        // The lock is only held while waiting for the next job.
        let job = match jobs.lock().recv() {
            Ok(job) => job,
            Err(_) => break,
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("{} worker: job panicked", name);
        }
    }
    trace!("{} worker exiting", name);
}

impl WorkerPool {
    pub(crate) fn new(name: &str, size: usize) -> std::io::Result<WorkerPool> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::new();
        for ix in 0..size.max(1) {
            let receiver = receiver.clone();
            let thread_name = format!("{}-{}", name, ix);
            let pool_name = name.to_owned();
            workers.push(
                thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || work(&pool_name, &receiver))?,
            );
        }
        Ok(WorkerPool {
            name: name.to_owned(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queues `job`. Returns false once the pool is shut down.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match &*self.sender.lock() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Lets queued jobs finish, then joins the workers. A worker calling
    /// this on its own pool is not joined.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
        let mut workers = self.workers.lock();
        let current = thread::current().id();
        for worker in workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("{} worker died", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;

    #[test]
    fn runs_jobs_and_survives_panics() -> std::io::Result<()> {
        let pool = WorkerPool::new("test", 2)?;
        let count = Arc::new(AtomicUsize::new(0));
        assert!(pool.execute(|| panic!("boom")));
        for _ in 0..10 {
            let count = count.clone();
            assert!(pool.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(!pool.execute(|| ()));
        Ok(())
    }

    #[test]
    fn slow_job_does_not_block_other_pool() -> std::io::Result<()> {
        let slow = WorkerPool::new("slow", 1)?;
        let fast = WorkerPool::new("fast", 1)?;
        let (release, blocked) = mpsc::channel::<()>();
        slow.execute(move || {
            let _ = blocked.recv();
        });
        let (done, finished) = mpsc::channel();
        fast.execute(move || {
            let _ = done.send(());
        });
        assert!(finished.recv_timeout(Duration::from_secs(5)).is_ok());
        let _ = release.send(());
        slow.shutdown();
        fast.shutdown();
        Ok(())
    }
}
