//! Parallel block verification worker pool.
//!
//! The block validator fans one batch out across `N` worker threads. The
//! shared slot holds the current job and a generation counter; flipping
//! the counter with `^= 2` publishes a new batch (so it never collides
//! with the previous value), and a counter of zero tells workers to exit.
//! Each worker validates its partition on a clone of the job and merges
//! its partial summary back under the lock; any failure flags the whole
//! batch. The caller blocks on `task_finished` until `remaining == 0`.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// One batch's partitioned validation work.
///
/// `validate(index, total)` checks the partition `index` of `total` and
/// returns its partial summary, or `None` when the partition is invalid.
pub trait VerifyJob: Send + Sync {
    fn validate(&self, index: u32, total: u32) -> Option<Summary>;
}

/// Partial validation result, merged across workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub fees: u64,
    pub kernels: u64,
}

impl Summary {
    pub fn merge(&mut self, other: Summary) {
        self.fees += other.fees;
        self.kernels += other.kernels;
    }
}

struct Shared {
    /// Generation counter; flipped with `^= 2` per batch, 0 = exit.
    i_task: u32,
    job: Option<Arc<dyn VerifyJob>>,
    /// Partition indices handed out so far in this batch.
    claimed: u32,
    remaining: u32,
    n_verifiers: u32,
    fail: bool,
    summary: Summary,
}

pub struct VerifierPool {
    shared: Arc<(Mutex<Shared>, Condvar, Condvar)>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    n_threads: u32,
}

impl VerifierPool {
    /// Resolve the configured thread count: negative = auto
    /// (`cores - mining_threads - 1`, floored at 0 = inline).
    pub fn resolve_threads(configured: i32, mining_threads: usize) -> u32 {
        if configured >= 0 {
            return configured as u32;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.saturating_sub(mining_threads + 1) as u32
    }

    pub fn new(n_threads: u32) -> Self {
        let shared = Arc::new((
            Mutex::new(Shared {
                i_task: 1,
                job: None,
                claimed: 0,
                remaining: 0,
                n_verifiers: 0,
                fail: false,
                summary: Summary::default(),
            }),
            Condvar::new(), // task_new
            Condvar::new(), // task_finished
        ));

        let mut threads = Vec::new();
        for _ in 0..n_threads {
            let shared = Arc::clone(&shared);
            threads.push(std::thread::spawn(move || worker_loop(shared)));
        }

        Self {
            shared,
            threads: Mutex::new(threads),
            n_threads,
        }
    }

    pub fn thread_count(&self) -> u32 {
        self.n_threads
    }

    /// Run one batch. Returns the merged summary, or `None` when any
    /// partition failed. With zero threads the job runs inline on the
    /// caller thread.
    pub fn verify(&self, job: Arc<dyn VerifyJob>) -> Option<Summary> {
        if self.n_threads == 0 {
            return job.validate(0, 1);
        }

        let (lock, task_new, task_finished) = &*self.shared;
        let mut shared = lock.lock().expect("verifier mutex poisoned");

        shared.i_task ^= 2;
        shared.job = Some(job);
        shared.claimed = 0;
        shared.remaining = self.n_threads;
        shared.n_verifiers = self.n_threads;
        shared.fail = false;
        shared.summary = Summary::default();

        task_new.notify_all();

        while shared.remaining > 0 {
            shared = task_finished
                .wait(shared)
                .expect("verifier mutex poisoned");
        }

        shared.job = None;
        if shared.fail {
            None
        } else {
            Some(shared.summary)
        }
    }

    /// Stop and join every worker.
    pub fn shutdown(&self) {
        let mut threads = self.threads.lock().expect("verifier mutex poisoned");
        if threads.is_empty() {
            return;
        }
        {
            let (lock, task_new, _) = &*self.shared;
            let mut shared = lock.lock().expect("verifier mutex poisoned");
            shared.i_task = 0;
            task_new.notify_all();
        }
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for VerifierPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<(Mutex<Shared>, Condvar, Condvar)>) {
    let (lock, task_new, task_finished) = &*shared;
    let mut seen_task = 1u32;

    loop {
        let (job, total, my_index) = {
            let mut guard = lock.lock().expect("verifier mutex poisoned");
            while guard.i_task == seen_task {
                guard = task_new.wait(guard).expect("verifier mutex poisoned");
            }
            if guard.i_task == 0 {
                return;
            }
            seen_task = guard.i_task;

            let my_index = guard.claimed;
            guard.claimed += 1;
            let job = guard.job.clone().expect("batch published without a job");
            (job, guard.n_verifiers, my_index)
        };

        let result = job.validate(my_index, total);

        let mut guard = lock.lock().expect("verifier mutex poisoned");
        debug_assert!(guard.remaining > 0);
        guard.remaining -= 1;
        match result {
            Some(partial) if !guard.fail => guard.summary.merge(partial),
            _ => guard.fail = true,
        }
        if guard.remaining == 0 {
            task_finished.notify_one();
        }
    }
}
