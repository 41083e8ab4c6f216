//! Worker threads with FIFO job queues
//!
//! Each worker owns a queue guarded by a mutex and two condvars: one wakes the
//! worker when a job arrives, the other wakes `wait` callers once the queue is
//! drained and no job is running. Dropping a worker lets it finish what is
//! queued before it joins.
//!
//! Workers that record commands get a command pool of their own from the
//! context. [`ThreadManager::for_context`] hands those pools back when each
//! worker exits.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::render::RenderContext;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs on a worker thread after its last job, just before the thread exits
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    busy: bool,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    work_available: Condvar,
    drained: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One thread running queued jobs in submission order
pub struct WorkerThread {
    id: usize,
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn a worker
    pub fn new(id: usize) -> io::Result<Self> {
        Self::with_exit_hook(id, None)
    }

    /// Spawn a worker that runs `on_exit` on its own thread when it stops
    pub fn with_exit_hook(id: usize, on_exit: Option<ExitHook>) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new().name(format!("frame-graph-worker-{id}")).spawn(move || {
            Self::run(id, &worker_shared);
            if let Some(on_exit) = on_exit {
                if panic::catch_unwind(AssertUnwindSafe(on_exit.as_ref())).is_err() {
                    log::error!("Exit hook of worker thread {id} panicked");
                }
            }
        })?;
        log::debug!("Worker thread {id} started");
        Ok(Self { id, shared, thread: Some(thread) })
    }

    fn run(id: usize, shared: &Shared) {
        loop {
            let job = {
                let mut state = shared.lock();
                while state.jobs.is_empty() && !state.shutdown {
                    state = shared.work_available.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                let Some(job) = state.jobs.pop_front() else {
                    break;
                };
                state.busy = true;
                job
            };

            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!("Job on worker thread {id} panicked");
            }

            let mut state = shared.lock();
            state.busy = false;
            if state.jobs.is_empty() {
                shared.drained.notify_all();
            }
        }
        log::debug!("Worker thread {id} stopped");
    }

    /// Append a job to this worker's queue
    pub fn queue_job<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.lock().jobs.push_back(Box::new(job));
        self.shared.work_available.notify_one();
    }

    /// Block until every queued job has finished
    pub fn wait(&self) {
        let mut state = self.shared.lock();
        while !state.jobs.is_empty() || state.busy {
            state = self.shared.drained.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Jobs queued and not yet started
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Index of this worker in its manager
    pub const fn id(&self) -> usize {
        self.id
    }
}

impl Drop for WorkerThread {
    /// Finishes the queued jobs, then joins the thread
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.work_available.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Worker thread {} terminated abnormally", self.id);
            }
        }
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread").field("id", &self.id).field("pending", &self.pending()).finish()
    }
}

/// Fixed set of worker threads
///
/// Jobs given to the manager are spread round-robin; jobs queued on a single
/// worker through [`ThreadManager::worker`] keep their relative order.
#[derive(Debug)]
pub struct ThreadManager {
    workers: Vec<WorkerThread>,
    next: AtomicUsize,
}

impl ThreadManager {
    /// Spawn `count` workers, at least one
    pub fn new(count: usize) -> io::Result<Self> {
        Self::spawn(count, None)
    }

    /// Spawn `count` workers that each run `on_exit` when they stop
    pub fn with_exit_hook(count: usize, on_exit: ExitHook) -> io::Result<Self> {
        Self::spawn(count, Some(on_exit))
    }

    /// Spawn `count` workers that return their command pools to `ctx` on exit
    pub fn for_context(count: usize, ctx: &Arc<RenderContext>) -> io::Result<Self> {
        let ctx = Arc::clone(ctx);
        Self::with_exit_hook(count, Arc::new(move || ctx.command_pools().release_thread_pool()))
    }

    fn spawn(count: usize, on_exit: Option<ExitHook>) -> io::Result<Self> {
        let workers = (0..count.max(1))
            .map(|id| WorkerThread::with_exit_hook(id, on_exit.clone()))
            .collect::<io::Result<Vec<_>>>()?;
        log::info!("Thread manager started {} workers", workers.len());
        Ok(Self { workers, next: AtomicUsize::new(0) })
    }

    /// One worker per available core, leaving one for the render thread
    pub fn with_available_parallelism() -> io::Result<Self> {
        let cores = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::new(cores.saturating_sub(1))
    }

    /// Queue a job on the next worker
    pub fn queue_job<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].queue_job(job);
    }

    /// Block until every worker has drained its queue
    pub fn wait(&self) {
        for worker in &self.workers {
            worker.wait();
        }
    }

    /// Worker by index
    pub fn worker(&self, index: usize) -> Option<&WorkerThread> {
        self.workers.get(index)
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Always false; a manager has at least one worker
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
