use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::ArrayQueue;
use log::{info, warn};
use parking_lot::Mutex;

use ndnfw_core::buf::PoolCounters;
use ndnfw_core::name::Name;
use ndnfw_core::packets::FaceId;
use ndnfw_core::{BufferPool, FwdError, TscTime};
use ndnfw_tables::epoch::Quiescence;
use ndnfw_tables::fib::{Fib, StrategyKind};
use ndnfw_tables::ndt::Ndt;
use ndnfw_tables::pcct::{PcctCounters, PcctCountersSnapshot, PcctShard};

use crate::config::Config;
use crate::face::{FaceCountersSnapshot, FaceDriver, FaceTable};
use crate::fwd::{FwdCommand, FwdCounters, FwdCountersSnapshot, FwdThread};
use crate::input::{FwdQueues, InputCounters, InputCountersSnapshot, InputThread};
use crate::latency::{Clock, RunningStat};
use crate::output::OutputThread;
use crate::ring::PktQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPlaneState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Latency running-stat snapshot, nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_ns: f64,
    pub variance: f64,
    pub min_ns: u64,
    pub max_ns: u64,
}

/// Aggregated read-only counters of the whole data plane.
#[derive(Debug, Clone)]
pub struct DataPlaneCounters {
    pub faces: Vec<(FaceId, FaceCountersSnapshot)>,
    pub inputs: Vec<InputCountersSnapshot>,
    pub fwds: Vec<FwdCountersSnapshot>,
    pub pcct: Vec<PcctCountersSnapshot>,
    pub latency: Vec<LatencySnapshot>,
    pub pools: Vec<PoolCounters>,
}

/// The forwarder data plane: buffer pools, tables, faces, and the
/// input / forwarding / output workers.
///
/// Everything is built eagerly in [`DataPlane::new`] in a fixed order and
/// torn down deterministically in [`DataPlane::stop`]; there is no lazy
/// initialization. Management calls run on the caller's thread and reach
/// worker-owned state only through RCU publication, atomics, or the
/// per-forwarder command queues.
pub struct DataPlane {
    cfg: Config,
    clock: Clock,
    pools: Vec<BufferPool>,
    ndt: Arc<Ndt>,
    fib: Arc<Fib>,
    faces: Arc<FaceTable>,
    quiescence: Arc<Quiescence>,
    fwd_queues: Vec<Arc<FwdQueues>>,
    cmd_queues: Vec<Arc<ArrayQueue<FwdCommand>>>,
    input_counters: Vec<Arc<InputCounters>>,
    fwd_counters: Vec<Arc<FwdCounters>>,
    pcct_counters: Vec<Arc<PcctCounters>>,
    latencies: Vec<Arc<Mutex<RunningStat>>>,
    // stage state lives here until launch() moves it onto worker threads
    inputs: Vec<InputThread>,
    fwds: Vec<FwdThread>,
    outputs: Vec<OutputThread>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    state: DataPlaneState,
}

impl DataPlane {
    pub fn new(mut cfg: Config) -> Self {
        cfg.validate();
        let n_inputs = cfg.fwd.n_inputs;
        let n_fwds = cfg.fwd.n_forwarders;
        let n_outputs = cfg.fwd.n_outputs;

        let pools: Vec<BufferPool> = cfg
            .pool
            .sockets
            .iter()
            .map(|&socket| BufferPool::new(cfg.pool.seg_size, cfg.pool.n_segs, socket))
            .collect();

        let ndt = Arc::new(Ndt::new(cfg.ndt_config()));
        ndt.randomize(n_fwds);

        let quiescence = Arc::new(Quiescence::new(n_inputs + n_fwds + n_outputs));
        let fib = Arc::new(Fib::new(cfg.fib_config(), n_fwds));
        let faces = Arc::new(FaceTable::new());

        let fwd_queues: Vec<Arc<FwdQueues>> = (0..n_fwds)
            .map(|_| {
                Arc::new(FwdQueues {
                    interest: PktQueue::new(
                        cfg.fwd.interest_queue_size,
                        cfg.interest_dequeue_burst(),
                    ),
                    data: PktQueue::new(cfg.fwd.data_queue_size, cfg.fwd.data_dequeue_burst),
                    nack: PktQueue::new(cfg.fwd.nack_queue_size, cfg.nack_dequeue_burst()),
                })
            })
            .collect();
        let cmd_queues: Vec<Arc<ArrayQueue<FwdCommand>>> =
            (0..n_fwds).map(|_| Arc::new(ArrayQueue::new(16))).collect();

        let inputs: Vec<InputThread> = (0..n_inputs)
            .map(|i| {
                InputThread::new(
                    i,
                    n_inputs,
                    faces.clone(),
                    ndt.querier(),
                    fwd_queues.clone(),
                    cfg.face.reassembler_capacity,
                    cfg.fwd.burst_size,
                    quiescence.handle(i),
                )
            })
            .collect();

        let fwds: Vec<FwdThread> = (0..n_fwds)
            .map(|j| {
                let shard = PcctShard::new(
                    j as u8,
                    cfg.pcct_config(),
                    cfg.suppress_config(),
                    0,
                );
                FwdThread::new(
                    j as u8,
                    shard,
                    fib.clone(),
                    faces.clone(),
                    fwd_queues[j].clone(),
                    cfg.fwd.latency_sample_freq,
                    cmd_queues[j].clone(),
                    quiescence.handle(n_inputs + j),
                )
            })
            .collect();

        let outputs: Vec<OutputThread> = (0..n_outputs)
            .map(|k| {
                OutputThread::new(
                    k,
                    n_outputs,
                    faces.clone(),
                    pools[0].clone(),
                    cfg.fwd.burst_size,
                    quiescence.handle(n_inputs + n_fwds + k),
                )
            })
            .collect();

        let input_counters = inputs.iter().map(InputThread::counters).collect();
        let fwd_counters = fwds.iter().map(FwdThread::counters).collect();
        let pcct_counters = fwds.iter().map(FwdThread::pcct_counters).collect();
        let latencies = fwds.iter().map(FwdThread::latency).collect();

        info!(
            "data plane created: {} inputs, {} forwarders, {} outputs",
            n_inputs, n_fwds, n_outputs
        );
        Self {
            cfg,
            clock: Clock::new(),
            pools,
            ndt,
            fib,
            faces,
            quiescence,
            fwd_queues,
            cmd_queues,
            input_counters,
            fwd_counters,
            pcct_counters,
            latencies,
            inputs,
            fwds,
            outputs,
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            state: DataPlaneState::Created,
        }
    }

    pub fn state(&self) -> DataPlaneState {
        self.state
    }

    /// Launch the busy-poll workers, one pinned thread per stage instance.
    pub fn launch(&mut self) -> Result<(), FwdError> {
        if self.state != DataPlaneState::Created {
            return Err(FwdError::InvalidArgument("already launched".into()));
        }
        self.running.store(true, Ordering::Release);
        self.quiescence.activate();
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        let mut core_iter = 0usize;
        let mut pick_core = move || {
            if cores.is_empty() {
                None
            } else {
                let core = cores[core_iter % cores.len()];
                core_iter += 1;
                Some(core)
            }
        };

        for (i, mut stage) in self.inputs.drain(..).enumerate() {
            let running = self.running.clone();
            let clock = self.clock.clone();
            let core = pick_core();
            let handle = std::thread::Builder::new()
                .name(format!("input-{}", i))
                .spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    while running.load(Ordering::Acquire) {
                        if stage.run_once(clock.now()) == 0 {
                            std::thread::yield_now();
                        }
                    }
                    stage.retire();
                })
                .map_err(|e| FwdError::Internal(e.to_string()))?;
            self.threads.push(handle);
        }

        for (j, mut stage) in self.fwds.drain(..).enumerate() {
            let running = self.running.clone();
            let clock = self.clock.clone();
            let core = pick_core();
            let handle = std::thread::Builder::new()
                .name(format!("fwd-{}", j))
                .spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    while running.load(Ordering::Acquire) {
                        if stage.run_once(clock.now()) == 0 {
                            std::thread::yield_now();
                        }
                    }
                    stage.retire();
                })
                .map_err(|e| FwdError::Internal(e.to_string()))?;
            self.threads.push(handle);
        }

        for (k, mut stage) in self.outputs.drain(..).enumerate() {
            let running = self.running.clone();
            let clock = self.clock.clone();
            let core = pick_core();
            let handle = std::thread::Builder::new()
                .name(format!("output-{}", k))
                .spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    while running.load(Ordering::Acquire) {
                        if stage.run_once(clock.now()) == 0 {
                            std::thread::yield_now();
                        }
                    }
                    stage.retire();
                })
                .map_err(|e| FwdError::Internal(e.to_string()))?;
            self.threads.push(handle);
        }

        self.state = DataPlaneState::Running;
        info!("data plane running ({} workers)", self.threads.len());
        Ok(())
    }

    /// Stop the workers: clear the run flag (observed within one burst),
    /// join, then drain whatever was still queued.
    pub fn stop(&mut self) {
        if self.state == DataPlaneState::Stopped {
            return;
        }
        self.state = DataPlaneState::Stopping;
        self.running.store(false, Ordering::Release);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("worker panicked during shutdown");
            }
        }
        // every worker has retired, so this returns at once; the shards are
        // freed with their stage state after it
        self.quiescence.wait_quiescent();
        self.quiescence.deactivate();
        let mut drained = 0usize;
        let mut scratch = Vec::new();
        for queues in &self.fwd_queues {
            loop {
                scratch.clear();
                if queues.interest.pop_burst(&mut scratch) == 0
                    && queues.data.pop_burst(&mut scratch) == 0
                    && queues.nack.pop_burst(&mut scratch) == 0
                {
                    break;
                }
                drained += scratch.len();
            }
        }
        if drained > 0 {
            info!("dropped {} queued packets on stop", drained);
        }
        self.state = DataPlaneState::Stopped;
        info!("data plane stopped");
    }

    /// Drive every stage once on the calling thread. Deterministic
    /// single-threaded execution for tests and tooling; worker threads run
    /// the same per-stage function in a loop.
    pub fn step(&mut self, now: TscTime) {
        for input in &mut self.inputs {
            input.run_once(now);
        }
        for fwd in &mut self.fwds {
            fwd.run_once(now);
        }
        for output in &mut self.outputs {
            output.run_once(now);
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    // ---- management surface ----

    pub fn open_face(&self, driver: Box<dyn FaceDriver>, socket: u32) -> Result<FaceId, FwdError> {
        self.faces
            .open(
                driver,
                socket,
                self.cfg.face.mtu,
                self.cfg.face.output_queue_size,
                self.cfg.cong_threshold(),
            )
            .map(|face| face.id)
    }

    pub fn close_face(&self, id: FaceId) -> Result<(), FwdError> {
        self.faces.close(id, &self.quiescence)
    }

    pub fn fib_insert(
        &self,
        name: &Name,
        nexthops: &[FaceId],
        strategy: StrategyKind,
    ) -> Result<(), FwdError> {
        self.fib.insert(name, nexthops, strategy, &self.quiescence)
    }

    pub fn fib_erase(&self, name: &Name) -> Result<(), FwdError> {
        self.fib.erase(name, &self.quiescence)
    }

    pub fn ndt_update(&self, index: usize, value: u8) -> Result<(), FwdError> {
        if (value as usize) >= self.cfg.fwd.n_forwarders {
            return Err(FwdError::InvalidArgument(format!(
                "forwarder index {} out of range",
                value
            )));
        }
        self.ndt.update(index, value)
    }

    pub fn ndt(&self) -> &Arc<Ndt> {
        &self.ndt
    }

    pub fn fib(&self) -> &Arc<Fib> {
        &self.fib
    }

    pub fn faces(&self) -> &Arc<FaceTable> {
        &self.faces
    }

    /// Ask every forwarder to drop its CS contents.
    pub fn clear_cs(&self) {
        for cmd in &self.cmd_queues {
            let _ = cmd.push(FwdCommand::ClearCs);
        }
    }

    pub fn set_cs_capacities(&self, direct: usize, indirect: usize) {
        for cmd in &self.cmd_queues {
            let _ = cmd.push(FwdCommand::SetCsCapacities { direct, indirect });
        }
    }

    pub fn counters(&self) -> DataPlaneCounters {
        DataPlaneCounters {
            faces: self
                .faces
                .iter()
                .into_iter()
                .map(|f| (f.id, f.counters.snapshot()))
                .collect(),
            inputs: self.input_counters.iter().map(|c| c.snapshot()).collect(),
            fwds: self.fwd_counters.iter().map(|c| c.snapshot()).collect(),
            pcct: self.pcct_counters.iter().map(|c| c.snapshot()).collect(),
            latency: self
                .latencies
                .iter()
                .map(|l| {
                    let stat = l.lock();
                    LatencySnapshot {
                        count: stat.count(),
                        mean_ns: stat.mean(),
                        variance: stat.variance(),
                        min_ns: stat.min(),
                        max_ns: stat.max(),
                    }
                })
                .collect(),
            pools: self.pools.iter().map(BufferPool::counters).collect(),
        }
    }
}

impl Drop for DataPlane {
    fn drop(&mut self) {
        self.stop();
    }
}
