use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::config::{ShutdownPolicy, WorkerPolicy};

use super::TransportError;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Runs connection jobs either on a fixed set of workers fed through a queue, or on a fresh
/// thread per job.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    cancelled: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    next_id: usize,
}

impl ThreadPool {
    pub fn new(policy: WorkerPolicy) -> Result<Self, TransportError> {
        Self::check_policy(policy)?;
        Ok(match policy {
            WorkerPolicy::Bounded(size) => Self::bounded(size),
            WorkerPolicy::PerConnection => Self::unbounded(),
        })
    }

    /// Fail for a bounded pool without workers.
    pub fn check_policy(policy: WorkerPolicy) -> Result<(), TransportError> {
        match policy {
            WorkerPolicy::Bounded(0) => Err(TransportError::InvalidArgument(
                "worker pool needs at least one worker".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn bounded(size: usize) -> Self {

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::queued(
                i,
                Arc::clone(&receiver),
                Arc::clone(&cancelled),
                Arc::clone(&active),
            ));
        }

        Self {
            workers,
            sender,
            cancelled,
            active,
            next_id: size,
        }
    }

    fn unbounded() -> Self {
        Self {
            workers: Vec::new(),
            sender: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            next_id: 0,
        }
    }

    pub fn execute<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    error!("all workers exited, dropping job");
                }
            }
            None => {
                self.workers.retain(|w| !w.thread.is_finished());
                let id = self.next_id;
                self.next_id += 1;
                self.workers.push(Worker::single(
                    id,
                    job,
                    Arc::clone(&self.cancelled),
                    Arc::clone(&self.active),
                ));
            }
        }
    }

    /// Number of jobs currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop taking jobs. Returns how many jobs were still running when this returned.
    ///
    /// With [`ShutdownPolicy::Join`], jobs that have not started are dropped and running ones
    /// get until `timeout` to finish; whatever is still running afterwards is detached.
    pub fn shutdown(&mut self, policy: ShutdownPolicy) -> usize {
        drop(self.sender.take());

        match policy {
            ShutdownPolicy::Detach => {
                self.workers.clear();
                self.active()
            }
            ShutdownPolicy::Join { timeout } => {
                self.cancelled.store(true, Ordering::SeqCst);
                let deadline = Instant::now() + timeout;
                let mut busy = 0;

                for worker in self.workers.drain(..) {
                    while !worker.thread.is_finished() && Instant::now() < deadline {
                        thread::sleep(JOIN_POLL);
                    }

                    if worker.thread.is_finished() {
                        debug!("shutting down worker {}", worker.id);
                        if worker.thread.join().is_err() {
                            warn!("worker {} panicked", worker.id);
                        }
                    } else {
                        warn!("worker {} still busy after {timeout:?}, detaching", worker.id);
                        busy += 1;
                    }
                }
                busy
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.sender.is_some() || !self.workers.is_empty() {
            self.shutdown(ShutdownPolicy::Detach);
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn queued(
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
        cancelled: Arc<AtomicBool>,
        active: Arc<AtomicUsize>,
    ) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let msg = match receiver.lock() {
                    Ok(rx) => rx.recv(),
                    Err(poisoned) => poisoned.into_inner().recv(),
                };
                match msg {
                    Ok(job) => {
                        if cancelled.load(Ordering::SeqCst) {
                            debug!("worker {id} dropping queued connection");
                            continue;
                        }
                        debug!("worker {id} handling a connection!");
                        run(id, job, &active);
                    }
                    Err(_) => {
                        debug!("worker {id} disconnected!");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }

    fn single(id: usize, job: Job, cancelled: Arc<AtomicBool>, active: Arc<AtomicUsize>) -> Self {
        let thread = thread::spawn(move || {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            debug!("worker {id} handling a connection!");
            run(id, job, &active);
        });

        Self { id, thread }
    }
}

fn run(id: usize, job: Job, active: &AtomicUsize) {
    active.fetch_add(1, Ordering::SeqCst);
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("worker {id}: connection handler panicked");
    }
    active.fetch_sub(1, Ordering::SeqCst);
}
