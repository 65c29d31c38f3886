//! The bounded keep-alive worker pool.
//!
//! Workers are OS threads fed jobs over per-worker channels. A lease is
//! acquired per request: the free list is popped most-recently-released
//! first, a new worker is spawned while the pool is below `max_threads`,
//! and beyond that acquisition waits asynchronously so the acceptor keeps
//! serving other connections under saturation.
//!
//! The job travels together with its lease; the worker thread releases
//! the lease itself once the job is done. Each release opportunistically
//! reaps workers that have sat idle past `thread_keepalive`, always
//! keeping `min_threads` alive.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::Semaphore;

use crate::Config;


/// A leased worker: the capacity to run exactly one job.
///
/// Dropping a lease terminates its worker thread; the pool does this when
/// reaping. Everywhere else a lease is either dispatched to (which hands
/// it to the worker for self-release) or released explicitly.
#[derive(Debug)]
pub struct Lease<J> {
    id: u64,
    jobs: Sender<(J, Lease<J>)>,
    released_at: Instant,
}

impl<J> Lease<J> {
    /// The pool-unique ID of the leased worker.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}


struct PoolState<J> {
    free: VecDeque<Lease<J>>,
    live: usize,
    next_id: u64,
}

struct Shared<J> {
    semaphore: Semaphore,
    state: Mutex<PoolState<J>>,
    run: Box<dyn Fn(J) + Send + Sync>,
    min_threads: usize,
    thread_keepalive: Duration,
}

impl<J: Send + 'static> Shared<J> {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState<J>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, mut lease: Lease<J>) {
        let id = lease.id;
        lease.released_at = Instant::now();
        {
            let mut state = self.lock();
            state.free.push_back(lease);
            self.reap(&mut state);
        }
        self.semaphore.add_permits(1);
        tracing::trace!(worker = id, "worker released");
    }

    /// Terminates workers idle past the keep-alive, oldest first, while
    /// more than `min_threads` remain on the free list.
    fn reap(&self, state: &mut PoolState<J>) {
        while state.free.len() > self.min_threads {
            let oldest = state.free.front().expect("free list is non-empty");
            if oldest.released_at.elapsed() < self.thread_keepalive {
                break;
            }
            // Dropping the lease closes the job channel; the thread exits
            let lease = state.free.pop_front().expect("free list is non-empty");
            state.live -= 1;
            tracing::debug!(worker = lease.id, live = state.live, "idle worker reclaimed");
        }
    }
}

fn worker_main<J: Send + 'static>(id: u64, rx: Receiver<(J, Lease<J>)>, shared: Arc<Shared<J>>) {
    tracing::debug!(worker = id, "worker thread started");
    while let Ok((job, lease)) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(|| (shared.run)(job))).is_err() {
            tracing::error!(worker = id, "job paniced; worker kept alive");
        }
        shared.release(lease);
    }
    tracing::debug!(worker = id, "worker thread exiting");
}


/// A bounded pool of worker threads executing jobs of type `J`.
///
/// Cloning the pool shares the underlying state.
pub struct Pool<J> {
    shared: Arc<Shared<J>>,
}

impl<J> Clone for Pool<J> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<J: Send + 'static> Pool<J> {
    /// Creates an empty pool; workers spawn on demand up to
    /// `config.max_threads`.
    pub fn new(config: &Config, run: impl Fn(J) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                semaphore: Semaphore::new(config.max_threads),
                state: Mutex::new(PoolState { free: VecDeque::new(), live: 0, next_id: 0 }),
                run: Box::new(run),
                min_threads: config.min_threads,
                thread_keepalive: config.thread_keepalive,
            }),
        }
    }

    /// Leases a worker, waiting while the pool is saturated.
    ///
    /// The most recently released idle worker is preferred; a new worker
    /// thread is spawned only when the free list is empty and the pool is
    /// below its cap.
    pub async fn acquire(&self) -> Lease<J> {
        let permit = self.shared.semaphore.acquire().await;
        permit.expect("pool semaphore is never closed").forget();

        let mut state = self.shared.lock();
        if let Some(lease) = state.free.pop_back() {
            tracing::trace!(worker = lease.id, "idle worker reused");
            return lease;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.live += 1;
        let live = state.live;
        drop(state);

        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("tclscgi-worker-{id}"))
            .spawn(move || worker_main(id, rx, shared))
            .expect("spawning a worker thread");
        tracing::debug!(worker = id, live, "worker created");

        Lease { id, jobs: tx, released_at: Instant::now() }
    }

    /// Hands a job to the leased worker. The worker runs the job and then
    /// releases the lease back to the pool on its own.
    pub fn dispatch(&self, lease: Lease<J>, job: J) {
        let jobs = lease.jobs.clone();
        if jobs.send((job, lease)).is_err() {
            // The worker's receiver only closes when its lease is dropped,
            // which cannot happen while the caller holds it
            tracing::error!("dispatch to a terminated worker");
        }
    }

    /// Returns the leased worker without running a job.
    pub fn release(&self, lease: Lease<J>) {
        self.shared.release(lease);
    }

    /// The number of live workers, leased or idle.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.lock().live
    }

    /// The number of idle workers on the free list.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.shared.lock().free.len()
    }
}
