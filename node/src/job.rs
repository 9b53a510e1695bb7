//! Cancelable, restartable background jobs with a lifetime.
//!
//! A [`Job`] runs a function until either its timeout elapses or it is
//! stopped, whichever comes first. The function receives the job's
//! [`StopSignal`] and is expected to return once it fires.
//! [`JobSyncer`] keeps at most one job per key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tollgate_utils::StopSignal;

pub type JobFn = Arc<dyn Fn(StopSignal) -> BoxFuture<'static, ()> + Send + Sync>;

struct JobInner {
    run: JobFn,
    timeout: Duration,
    done: StopSignal,
    started: AtomicBool,
}

#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new<F, Fut>(run: F, timeout: Duration) -> Self
    where
        F: Fn(StopSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_fn(Arc::new(move |stop| run(stop).boxed()), timeout)
    }

    fn from_fn(run: JobFn, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(JobInner {
                run,
                timeout,
                done: StopSignal::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Launch the function and its deadline. Only the first call has effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let done = self.inner.done.clone();
        tokio::spawn((self.inner.run)(done.clone()));

        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = done.stopped() => {}
                _ = tokio::time::sleep(timeout) => {
                    done.stop();
                }
            }
        });
    }

    pub fn stop(&self) {
        self.inner.done.stop();
    }

    /// Stop this job and start a fresh one with the same function and timeout.
    pub fn restart(&self) -> Job {
        self.stop();
        let job = Job::from_fn(self.inner.run.clone(), self.inner.timeout);
        job.start();
        job
    }

    /// Resolves once the job timed out or was stopped.
    pub async fn done(&self) {
        self.inner.done.stopped().await
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_stopped()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    fn same(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Registry of keyed jobs. Finished jobs unregister themselves.
#[derive(Clone, Default)]
pub struct JobSyncer {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
}

impl JobSyncer {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a job under `key`, or extend the one already running.
    ///
    /// Returns the running job and whether one already existed for the key.
    pub fn periodicly_sync_balance<F, Fut>(
        &self,
        key: impl Into<String>,
        run: F,
        timeout: Duration,
    ) -> (Job, bool)
    where
        F: Fn(StopSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut jobs = self.jobs();

        let (job, existed) = match jobs.get(&key) {
            Some(existing) => (existing.restart(), true),
            None => {
                let job = Job::new(run, timeout);
                job.start();
                (job, false)
            }
        };
        jobs.insert(key.clone(), job.clone());
        drop(jobs);

        self.remove_when_done(key, job.clone());
        (job, existed)
    }

    fn remove_when_done(&self, key: String, job: Job) {
        let jobs = Arc::downgrade(&self.jobs);
        tokio::spawn(async move {
            job.done().await;
            let Some(jobs) = jobs.upgrade() else {
                return;
            };
            let mut jobs = jobs.lock().unwrap_or_else(PoisonError::into_inner);
            if jobs.get(&key).is_some_and(|current| current.same(&job)) {
                jobs.remove(&key);
            }
        });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.jobs().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop_all(&self) {
        for job in self.jobs().values() {
            job.stop();
        }
    }
}
