//! Job system bridge
//!
//! The driver splits each fixed step into jobs and hands them to the
//! engine's [`TaskExecutor`] instead of owning a thread pool of its own.
//! A job carries a dependency counter and is submitted the moment that
//! counter reaches zero; [`Barrier`]s let the engine thread block until a
//! set of jobs has finished.

use crate::error::{PhysicsError, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A unit of work handed to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

// ==================== Executors ====================

/// Completion token for a spawned task.
///
/// The task side holds the matching sender and drops it when the task
/// returns or unwinds, which disconnects the channel.
pub struct TaskHandle {
    done: Receiver<()>,
}

impl TaskHandle {
    /// Create a token pair; drop the [`TaskCompletion`] to signal completion
    pub fn pair() -> (TaskCompletion, TaskHandle) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (TaskCompletion { _done: tx }, TaskHandle { done: rx })
    }

    /// Whether the task has finished
    pub fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block until the task has finished
    pub fn wait(&self) {
        while self.done.recv().is_ok() {}
    }
}

/// Task-side half of a [`TaskHandle`]
pub struct TaskCompletion {
    _done: Sender<()>,
}

/// Parallel task executor the job bridge runs on
pub trait TaskExecutor: Send + Sync {
    /// Run a task, possibly on another thread
    fn spawn(&self, task: Task) -> TaskHandle;

    /// Number of tasks that can run at once
    fn worker_count(&self) -> usize;
}

/// Executor backed by a dedicated rayon thread pool
pub struct RayonExecutor {
    pool: rayon::ThreadPool,
}

impl RayonExecutor {
    /// Create a pool with `threads` workers (0 = one per core)
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("physics-worker-{i}"))
            .build()
            .map_err(|e| PhysicsError::JobSystem(e.to_string()))?;
        log::debug!("Physics thread pool started with {} workers", pool.current_num_threads());
        Ok(Self { pool })
    }
}

impl TaskExecutor for RayonExecutor {
    fn spawn(&self, task: Task) -> TaskHandle {
        let (completion, handle) = TaskHandle::pair();
        self.pool.spawn(move || {
            let _completion = completion;
            task();
        });
        handle
    }

    fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Executor that runs every task immediately on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn spawn(&self, task: Task) -> TaskHandle {
        let (completion, handle) = TaskHandle::pair();
        task();
        drop(completion);
        handle
    }

    fn worker_count(&self) -> usize {
        1
    }
}

// ==================== Jobs ====================

/// Debug color attached to a job for profilers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobColor(pub u32);

impl JobColor {
    pub const STEP: Self = Self(0x00_80_ff);
    pub const CONTACTS: Self = Self(0xff_80_00);
    pub const QUERIES: Self = Self(0x00_c0_40);
}

#[derive(Debug, Clone, PartialEq)]
enum JobStatus {
    Pending,
    Queued,
    Done,
    Failed(String),
}

struct JobState {
    status: JobStatus,
    dependents: Vec<Arc<Job>>,
}

struct Job {
    name: String,
    color: JobColor,
    task: Mutex<Option<Task>>,
    dependencies: AtomicU32,
    poisoned: AtomicBool,
    state: Mutex<JobState>,
    finished: Condvar,
    shared: Weak<Shared>,
}

impl Job {
    fn finish(&self, outcome: std::result::Result<(), String>) {
        let dependents = {
            let mut state = self.state.lock();
            state.status = match &outcome {
                Ok(()) => JobStatus::Done,
                Err(msg) => JobStatus::Failed(msg.clone()),
            };
            self.finished.notify_all();
            std::mem::take(&mut state.dependents)
        };
        for dependent in dependents {
            if outcome.is_err() {
                dependent.poisoned.store(true, Ordering::Release);
            }
            release(&dependent, 1);
        }
    }

    fn wait(&self) -> std::result::Result<(), String> {
        let mut state = self.state.lock();
        loop {
            match &state.status {
                JobStatus::Done => return Ok(()),
                JobStatus::Failed(msg) => return Err(msg.clone()),
                _ => self.finished.wait(&mut state),
            }
        }
    }
}

/// Drop `count` dependencies and submit the job once none remain.
/// Failures here run on worker threads, so they are recorded on the job.
fn release(job: &Arc<Job>, count: u32) {
    let previous = job.dependencies.fetch_sub(count, Ordering::AcqRel);
    if previous < count {
        log::warn!("Job '{}' released more dependencies than it had", job.name);
        job.dependencies.store(0, Ordering::Release);
        return;
    }
    if previous == count {
        let result = match job.shared.upgrade() {
            Some(shared) => shared.submit(Arc::clone(job)),
            None => Err(PhysicsError::MissingDependency("job system")),
        };
        if let Err(e) = result {
            job.finish(Err(e.to_string()));
        }
    }
}

/// Shared handle to a job created by [`JobSystem::create_job`]
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<Job>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn color(&self) -> JobColor {
        self.job.color
    }

    /// Outstanding dependency count
    pub fn dependency_count(&self) -> u32 {
        self.job.dependencies.load(Ordering::Acquire)
    }

    /// Add dependencies; only valid before the job was queued
    pub fn add_dependency(&self, count: u32) -> Result<()> {
        if self.job.state.lock().status != JobStatus::Pending {
            return Err(PhysicsError::JobSystem(format!(
                "job '{}' is already queued",
                self.job.name
            )));
        }
        self.job.dependencies.fetch_add(count, Ordering::AcqRel);
        Ok(())
    }

    /// Remove dependencies, queuing the job when the count reaches zero
    pub fn remove_dependency(&self, count: u32) {
        release(&self.job, count);
    }

    /// Release one dependency of `dependent` when this job finishes.
    /// If this job already finished, the dependency is released now.
    pub fn add_dependent(&self, dependent: &JobHandle) {
        let failed = {
            let mut state = self.job.state.lock();
            match &state.status {
                JobStatus::Pending | JobStatus::Queued => {
                    state.dependents.push(Arc::clone(&dependent.job));
                    return;
                }
                JobStatus::Done => false,
                JobStatus::Failed(_) => true,
            }
        };
        if failed {
            dependent.job.poisoned.store(true, Ordering::Release);
        }
        release(&dependent.job, 1);
    }

    /// Whether the job ran to completion (successfully or not)
    pub fn is_done(&self) -> bool {
        matches!(
            self.job.state.lock().status,
            JobStatus::Done | JobStatus::Failed(_)
        )
    }

    /// Block until the job has finished
    pub fn wait(&self) -> Result<()> {
        self.job.wait().map_err(PhysicsError::JobSystem)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("name", &self.job.name)
            .field("dependencies", &self.dependency_count())
            .field("status", &self.job.state.lock().status)
            .finish()
    }
}

// ==================== Job System ====================

struct Shared {
    executor: Arc<dyn TaskExecutor>,
    accepting: AtomicBool,
    pending: Mutex<Vec<TaskHandle>>,
    live_barriers: AtomicUsize,
    max_barriers: usize,
}

impl Shared {
    fn submit(self: &Arc<Self>, job: Arc<Job>) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PhysicsError::JobSystem(format!(
                "job '{}' queued after shutdown",
                job.name
            )));
        }
        let Some(task) = job.task.lock().take() else {
            return Ok(());
        };
        job.state.lock().status = JobStatus::Queued;
        log::trace!("Queue job '{}'", job.name);

        let runner = Arc::clone(&job);
        let handle = self.executor.spawn(Box::new(move || {
            if runner.poisoned.load(Ordering::Acquire) {
                runner.finish(Err(format!("job '{}' skipped: a dependency failed", runner.name)));
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|_| format!("job '{}' panicked", runner.name));
            runner.finish(outcome);
        }));

        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
        Ok(())
    }
}

/// Bridge between the driver's step jobs and a [`TaskExecutor`]
#[derive(Default)]
pub struct JobSystem {
    shared: Option<Arc<Shared>>,
}

impl JobSystem {
    /// Create an unbound job system
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to an executor; may only happen once
    pub fn init(&mut self, executor: Arc<dyn TaskExecutor>, max_barriers: usize) -> Result<()> {
        if self.shared.is_some() {
            return Err(PhysicsError::AlreadyInitialized("job system"));
        }
        log::debug!(
            "Job system bound to executor with {} workers, {max_barriers} barriers",
            executor.worker_count()
        );
        self.shared = Some(Arc::new(Shared {
            executor,
            accepting: AtomicBool::new(true),
            pending: Mutex::new(Vec::new()),
            live_barriers: AtomicUsize::new(0),
            max_barriers,
        }));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    fn shared(&self) -> Result<&Arc<Shared>> {
        self.shared
            .as_ref()
            .ok_or(PhysicsError::MissingDependency("job system executor"))
    }

    /// Create a job. It is queued immediately when `num_dependencies` is
    /// zero, otherwise once its last dependency is removed.
    pub fn create_job<F>(&self, name: &str, color: JobColor, f: F, num_dependencies: u32) -> Result<JobHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.shared()?;
        let job = Arc::new(Job {
            name: name.to_string(),
            color,
            task: Mutex::new(Some(Box::new(f))),
            dependencies: AtomicU32::new(num_dependencies),
            poisoned: AtomicBool::new(false),
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                dependents: Vec::new(),
            }),
            finished: Condvar::new(),
            shared: Arc::downgrade(shared),
        });
        if num_dependencies == 0 {
            shared.submit(Arc::clone(&job))?;
        }
        Ok(JobHandle { job })
    }

    /// Submit a job whose dependencies are all satisfied
    pub fn queue_job(&self, job: &JobHandle) -> Result<()> {
        let deps = job.dependency_count();
        if deps != 0 {
            return Err(PhysicsError::JobSystem(format!(
                "job '{}' still has {deps} dependencies",
                job.name()
            )));
        }
        self.shared()?.submit(Arc::clone(&job.job))
    }

    /// Submit several ready jobs
    pub fn queue_jobs(&self, jobs: &[JobHandle]) -> Result<()> {
        jobs.iter().try_for_each(|job| self.queue_job(job))
    }

    /// How many jobs may usefully run in parallel
    pub fn max_concurrency(&self) -> usize {
        self.shared
            .as_ref()
            .map(|s| s.executor.worker_count().max(1))
            .unwrap_or(1)
    }

    /// Create a barrier; at most `max_barriers` may be alive at once
    pub fn create_barrier(&self) -> Result<Barrier> {
        let shared = self.shared()?;
        let live = shared.live_barriers.fetch_add(1, Ordering::AcqRel);
        if live >= shared.max_barriers {
            shared.live_barriers.fetch_sub(1, Ordering::AcqRel);
            return Err(PhysicsError::JobSystem(format!(
                "barrier limit {} reached",
                shared.max_barriers
            )));
        }
        Ok(Barrier {
            jobs: Mutex::new(Vec::new()),
            shared: Arc::clone(shared),
        })
    }

    /// Number of submitted tasks that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.shared
            .as_ref()
            .map(|s| s.pending.lock().iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Block until every in-flight job has drained, then release the
    /// executor. Jobs queued afterwards fail.
    pub fn shutdown(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        loop {
            let batch = std::mem::take(&mut *shared.pending.lock());
            if batch.is_empty() {
                break;
            }
            for handle in &batch {
                handle.wait();
            }
        }
        shared.accepting.store(false, Ordering::Release);
        log::debug!("Job system shut down");
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A set of jobs the engine thread can wait on
pub struct Barrier {
    jobs: Mutex<Vec<JobHandle>>,
    shared: Arc<Shared>,
}

impl Barrier {
    pub fn add_job(&self, job: &JobHandle) {
        self.jobs.lock().push(job.clone());
    }

    pub fn add_jobs(&self, jobs: &[JobHandle]) {
        self.jobs.lock().extend(jobs.iter().cloned());
    }

    /// Block until every job in the barrier has finished. Returns the
    /// first failure once all of them are done.
    pub fn wait(&self) -> Result<()> {
        let jobs = std::mem::take(&mut *self.jobs.lock());
        let mut first_error = None;
        for job in &jobs {
            if let Err(e) = job.wait() {
                log::error!("Physics job '{}' failed: {e}", job.name());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        self.shared.live_barriers.fetch_sub(1, Ordering::AcqRel);
    }
}
