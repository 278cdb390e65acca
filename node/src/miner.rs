//! Multi-threaded proof-of-work orchestrator.
//!
//! Workers share one task slot guarded by a mutex. Every task carries a
//! `stop` cell that flips from false to true exactly once, set by the
//! winner or a hard abort (a soft restart installs a new task that *reuses*
//! the old cell, so running searches notice the swap through the
//! `retrying` cancel probe instead). Solutions are posted back to the
//! core's event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use shroud_types::{PeerId, StateDescriptor, Timestamp};

use crate::node::NodeCore;
use crate::processor::{BlockPlan, DataStatus};

/// A block being mined.
pub struct MinerTask {
    pub hdr: StateDescriptor,
    pub body: Vec<u8>,
    pub fees: u64,
    pub stop: Arc<AtomicBool>,
}

/// A solved block, posted from a worker thread to the core.
#[derive(Debug)]
pub struct MinedSolution {
    pub hdr: StateDescriptor,
    pub body: Vec<u8>,
    pub fees: u64,
}

struct Worker {
    wake: std::sync::mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

pub struct Miner {
    current: Arc<Mutex<Option<Arc<MinerTask>>>>,
    workers: Vec<Worker>,
}

impl Miner {
    pub fn new(
        threads: usize,
        my_id: PeerId,
        fake_pow_solve_time_ms: Option<u64>,
        solutions: UnboundedSender<MinedSolution>,
    ) -> Self {
        let current: Arc<Mutex<Option<Arc<MinerTask>>>> = Arc::new(Mutex::new(None));

        let mut workers = Vec::new();
        for idx in 0..threads {
            let (wake_tx, wake_rx) = std::sync::mpsc::channel::<()>();
            let current = Arc::clone(&current);
            let solutions = solutions.clone();
            let thread = std::thread::spawn(move || {
                while wake_rx.recv().is_ok() {
                    mine_round(
                        &current,
                        idx as u32,
                        &my_id,
                        fake_pow_solve_time_ms,
                        &solutions,
                    );
                }
            });
            workers.push(Worker {
                wake: wake_tx,
                thread,
            });
        }

        Self { current, workers }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Install a freshly constructed block as the mining task.
    ///
    /// If the previous task was already solved (`stop == true`) the new
    /// one is abandoned; the solution notification is on its way. A
    /// still-running task hands its stop cell to the replacement so the
    /// soft restart doesn't abort the workers, only redirects them.
    pub fn install(&self, plan: BlockPlan) -> bool {
        {
            let mut current = self.current.lock().expect("miner mutex poisoned");

            let stop = match current.as_ref() {
                Some(task) => {
                    if task.stop.load(Ordering::SeqCst) {
                        return false; // block already mined
                    }
                    Arc::clone(&task.stop)
                }
                None => Arc::new(AtomicBool::new(false)),
            };

            *current = Some(Arc::new(MinerTask {
                hdr: plan.hdr,
                body: plan.body,
                fees: plan.fees,
                stop,
            }));
        }

        for worker in &self.workers {
            let _ = worker.wake.send(());
        }
        true
    }

    /// Stop the current task outright (shutdown, or a new tip arrived).
    pub fn hard_abort(&self) {
        let mut current = self.current.lock().expect("miner mutex poisoned");
        if let Some(task) = current.take() {
            task.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Abort and join every worker.
    pub fn shutdown(&mut self) {
        self.hard_abort();
        for worker in self.workers.drain(..) {
            drop(worker.wake);
            let _ = worker.thread.join();
        }
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One wakeup's worth of mining: keep solving until the task is stopped
/// or replaced-and-solved.
fn mine_round(
    current: &Mutex<Option<Arc<MinerTask>>>,
    worker_idx: u32,
    my_id: &PeerId,
    fake_pow_solve_time_ms: Option<u64>,
    solutions: &UnboundedSender<MinedSolution>,
) {
    loop {
        let task = {
            let guard = current.lock().expect("miner mutex poisoned");
            match guard.as_ref() {
                Some(task) if !task.stop.load(Ordering::SeqCst) => Arc::clone(task),
                _ => break,
            }
        };

        let mut hdr = task.hdr.clone();

        // Pseudo-random initial nonce, distinct per worker and height.
        let seed_hash = shroud_crypto::blake2b_256_multi(&[
            my_id.as_bytes(),
            &worker_idx.to_be_bytes(),
            &hdr.height.to_be_bytes(),
        ]);
        let nonce0 = u64::from_be_bytes(seed_hash[..8].try_into().expect("8 bytes"));

        let cancel_task = Arc::clone(&task);
        let cancel = |retrying: bool| {
            if cancel_task.stop.load(Ordering::SeqCst) {
                return true;
            }
            if retrying {
                let guard = current.lock().expect("miner mutex poisoned");
                match guard.as_ref() {
                    Some(active) => !Arc::ptr_eq(active, &cancel_task), // soft restart
                    None => true,
                }
            } else {
                false
            }
        };

        let solved = match fake_pow_solve_time_ms {
            Some(solve_ms) => fake_solve(&mut hdr, nonce0, solve_ms, &cancel),
            None => shroud_work::solve(&mut hdr, nonce0, cancel).is_ok(),
        };
        if !solved {
            continue; // cancelled; reload the task
        }

        let mut guard = current.lock().expect("miner mutex poisoned");
        if task.stop.load(Ordering::SeqCst) {
            continue; // aborted, or another worker was faster
        }
        task.stop.store(true, Ordering::SeqCst);
        // A soft restart may have swapped the slot; restore the task that
        // actually got mined.
        *guard = Some(Arc::clone(&task));
        drop(guard);

        let _ = solutions.send(MinedSolution {
            hdr,
            body: task.body.clone(),
            fees: task.fees,
        });
        break;
    }
}

/// Test-mode "search": wait out the configured solve time, honouring
/// both cancellation probes, then accept the seed nonce as the solution.
fn fake_solve(
    hdr: &mut StateDescriptor,
    nonce0: u64,
    solve_ms: u64,
    cancel: &dyn Fn(bool) -> bool,
) -> bool {
    hdr.nonce = nonce0;
    let started = Instant::now();
    loop {
        if cancel(false) || cancel(true) {
            return false;
        }
        if started.elapsed() >= Duration::from_millis(solve_ms) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50.min(solve_ms.max(1))));
    }
}

// ---------------------------------------------------------------------------
// Core-side driver
// ---------------------------------------------------------------------------

impl NodeCore {
    /// Arm the miner restart timer. A pending soft timer is not moved;
    /// `hard` reschedules unconditionally.
    pub fn set_miner_timer(&mut self, delay_ms: u64, hard: bool) {
        if self.miner_timer_pending && !hard {
            return;
        }
        self.miner_restart_at = Some(self.now_ms + delay_ms);
        self.miner_timer_pending = true;
    }

    pub(crate) fn on_miner_timer(&mut self) {
        if let Some(at) = self.miner_restart_at {
            if self.now_ms >= at {
                self.miner_restart_at = None;
                self.miner_timer_pending = false;
                self.restart_mining();
            }
        }
    }

    /// Construct the next block and hand it to the workers.
    pub fn restart_mining(&mut self) -> bool {
        if self.miner.thread_count() == 0 {
            return false; // n/a
        }

        // While the treasury subsidy is open each height consumes its
        // slice; past the end there is nothing to mine with.
        let treasury_slice = if self.cfg.treasury.is_empty() {
            None
        } else {
            let dh = self.processor.cursor().height as usize;
            match self.cfg.treasury.get(dh) {
                Some(slice) => Some(slice.clone()),
                None => return false,
            }
        };

        let txs = self.fluff.txs_by_profit();
        let txs_owned: Vec<shroud_types::Transaction> =
            txs.into_iter().cloned().collect();
        let tx_refs: Vec<&shroud_types::Transaction> = txs_owned.iter().collect();

        let plan = match self.processor.generate_block(
            &tx_refs,
            treasury_slice.as_deref(),
            Timestamp::new(self.now_ms / 1000),
        ) {
            Some(plan) => plan,
            None => {
                tracing::warn!("block generation failed, can't mine");
                return false;
            }
        };

        tracing::info!(
            height = plan.hdr.height,
            fees = plan.fees,
            size = plan.body.len(),
            "block generated"
        );

        self.miner.install(plan)
    }

    /// A worker solved the current task.
    pub fn on_mined(&mut self, solution: MinedSolution) {
        let id = solution.hdr.id();
        tracing::info!(%id, "new block mined");

        let my_id = self.my_public_id;
        match self.feed_header(&solution.hdr, &my_id) {
            DataStatus::Accepted => {}
            DataStatus::Rejected => {
                // Someone else mined exactly the same block.
                tracing::warn!("mined block duplicated");
                return;
            }
            _ => {
                tracing::warn!("mined block rejected as invalid");
                return;
            }
        }

        if let Err(e) = self.stores.mined.insert(&id, solution.fees) {
            tracing::warn!(error = %e, "mined log write failed");
        }

        // Will advance the state and spread the block to the network.
        let status = self.feed_block(&id, &solution.body, &my_id);
        if status != DataStatus::Accepted {
            tracing::warn!(?status, "mined block body not accepted");
        }
    }
}
