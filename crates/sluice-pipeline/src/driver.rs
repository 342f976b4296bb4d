//! Per-partition state machine.
//!
//! Producers only record contributions and enqueue tasks; workers run one
//! stage of one partition per task and enqueue the follow-on. A partition
//! enters a stage only after the ready table confirms the announcements for
//! it. The driver itself is the single announcer (`ContributorId::DRIVER`)
//! for every stage after the local reduction.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use sluice_compress::TensorCompressor;
use sluice_types::{
    ContributorId, EngineConfig, Partition, PartitionId, Stage, TensorRole, TensorSpec,
};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Backends, DeviceBuffer};
use crate::error::{EngineError, Result};
use crate::queue::{Task, TaskQueue};
use crate::ready_table::ReadyTable;
use crate::registry::PartitionRegistry;

/// Waiters re-check the engine-wide fatal state at least this often.
const WAIT_SLICE: Duration = Duration::from_millis(100);

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// Idle → Running → Done | Failed, once per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorOutcome {
    /// Declared; no step started yet.
    Idle,
    /// At least one partition is not terminal.
    Running,
    /// Every partition reached `DONE`.
    Done,
    /// Every partition is terminal and at least one `FAILED`.
    Failed,
}

impl fmt::Display for TensorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle    => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Done    => write!(f, "Done"),
            Self::Failed  => write!(f, "Failed"),
        }
    }
}

/// First failure recorded for a tensor's step.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionFailure {
    pub partition: PartitionId,
    pub stage: Stage,
    pub reason: String,
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorStatus {
    pub key: String,
    pub generation: u64,
    pub outcome: TensorOutcome,
    pub aborted: bool,
    /// Current stage of every partition, in partition order.
    pub stages: Vec<Stage>,
    pub failure: Option<PartitionFailure>,
}

/// Passed to the completion hook when a tensor's step finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub tensor: String,
    pub generation: u64,
    pub outcome: TensorOutcome,
    pub failure: Option<PartitionFailure>,
}

pub type CompletionHook = Arc<dyn Fn(&Completion) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub tensors: usize,
    pub queued_tasks: usize,
    pub tasks_executed: u64,
    pub partitions_done: u64,
    pub partitions_failed: u64,
    pub steps_done: u64,
    pub steps_failed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Counters {
    tasks_executed: AtomicU64,
    partitions_done: AtomicU64,
    partitions_failed: AtomicU64,
    steps_done: AtomicU64,
    steps_failed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

// ── Per-tensor state ──────────────────────────────────────────────────────────

struct Slot {
    stage: Stage,
    in_flight: bool,
    /// Device contributions awaiting local reduction.
    inputs: Vec<DeviceBuffer>,
    /// Working buffer handed from one stage to the next.
    buffer: Vec<u8>,
}

impl Slot {
    fn init() -> Self {
        Self {
            stage: Stage::Init,
            in_flight: false,
            inputs: Vec::new(),
            buffer: Vec::new(),
        }
    }
}

struct Run {
    generation: u64,
    outcome: TensorOutcome,
    aborted: bool,
    contributors: HashSet<ContributorId>,
    slots: Vec<Slot>,
    /// Partitions not yet terminal.
    remaining: usize,
    output: Vec<u8>,
    failure: Option<PartitionFailure>,
}

impl Run {
    fn error(&self, tensor: &str) -> EngineError {
        match &self.failure {
            Some(f) if !self.aborted => EngineError::TensorFailed {
                tensor: tensor.to_string(),
                partition: f.partition,
                stage: f.stage,
                reason: f.reason.clone(),
            },
            _ => EngineError::Aborted {
                tensor: tensor.to_string(),
            },
        }
    }
}

struct TensorState {
    spec: TensorSpec,
    priority: i64,
    partitions: Vec<Partition>,
    compressor: TensorCompressor,
    run: Mutex<Run>,
    finished: Condvar,
}

// ── Driver ────────────────────────────────────────────────────────────────────

pub struct PipelineDriver {
    config: EngineConfig,
    registry: PartitionRegistry,
    ready: ReadyTable,
    queue: Arc<TaskQueue>,
    backends: Backends,
    tensors: RwLock<HashMap<String, Arc<TensorState>>>,
    fatal: Mutex<Option<EngineError>>,
    closed: AtomicBool,
    hook: RwLock<Option<CompletionHook>>,
    counters: Counters,
}

impl PipelineDriver {
    pub fn new(config: EngineConfig, backends: Backends, queue: Arc<TaskQueue>) -> Self {
        Self {
            registry: PartitionRegistry::new(config.min_merge_bytes),
            ready: ReadyTable::new(config.local_size),
            queue,
            backends,
            tensors: RwLock::new(HashMap::new()),
            fatal: Mutex::new(None),
            closed: AtomicBool::new(false),
            hook: RwLock::new(None),
            counters: Counters::default(),
            config,
        }
    }

    pub fn registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    /// `ShutDown` after shutdown, the latched invariant violation if any.
    pub fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        match &*self.fatal.lock() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record a contract violation as the engine's fatal error and wake
    /// every waiter. Must not be called with a tensor lock held.
    fn latch(&self, err: EngineError) -> EngineError {
        let latched = {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                error!(error = %err, "scheduling invariant violated; engine halted");
                *fatal = Some(err.clone());
            }
            fatal.clone().unwrap_or(err)
        };
        for tensor in self.tensors.read().values() {
            tensor.finished.notify_all();
        }
        latched
    }

    fn tensor(&self, key: &str) -> Result<Arc<TensorState>> {
        self.tensors
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTensor(key.to_string()))
    }

    pub fn set_hook(&self, hook: CompletionHook) {
        *self.hook.write() = Some(hook);
    }

    // ── Entry points ──────────────────────────────────────────────────────

    pub fn declare(&self, spec: TensorSpec) -> Result<Vec<Partition>> {
        self.check()?;

        let codec = spec
            .codec
            .clone()
            .unwrap_or_else(|| self.config.codec_for(&spec.key).clone());
        codec.validate()?;

        let mut tensors = self.tensors.write();
        let partitions = self.registry.register(&spec, self.config.partition_bytes)?;
        if tensors.contains_key(&spec.key) {
            return Ok(partitions);
        }

        let priority = self
            .registry
            .priority(&spec.key)
            .ok_or_else(|| EngineError::UnknownTensor(spec.key.clone()))?;
        let compressor = TensorCompressor::new(
            spec.key.clone(),
            spec.dtype,
            spec.role,
            &partitions,
            &codec,
            self.config.min_compress_bytes,
        );

        info!(
            tensor = %spec.key,
            role = ?spec.role,
            dtype = %spec.dtype,
            codec = %codec,
            priority,
            partitions = partitions.len(),
            "declared tensor"
        );

        let run = Run {
            generation: 0,
            outcome: TensorOutcome::Idle,
            aborted: false,
            contributors: HashSet::new(),
            slots: partitions.iter().map(|_| Slot::init()).collect(),
            remaining: 0,
            output: Vec::new(),
            failure: None,
        };
        tensors.insert(
            spec.key.clone(),
            Arc::new(TensorState {
                spec,
                priority,
                partitions: partitions.clone(),
                compressor,
                run: Mutex::new(run),
                finished: Condvar::new(),
            }),
        );
        Ok(partitions)
    }

    /// Contribute one local device's gradient for the current step.
    pub fn push_pull(&self, key: &str, contributor: ContributorId, bytes: &[u8]) -> Result<()> {
        self.check()?;
        let tensor = self.tensor(key)?;
        if tensor.spec.role != TensorRole::Gradient {
            return Err(EngineError::Configuration(format!(
                "tensor {key} is a parameter; use pull"
            )));
        }
        if bytes.len() != tensor.spec.num_bytes {
            return Err(EngineError::Configuration(format!(
                "tensor {key} expects {} bytes, got {}",
                tensor.spec.num_bytes,
                bytes.len()
            )));
        }

        let mut ready = Vec::new();
        let mut violation = None;
        {
            let mut guard = tensor.run.lock();
            let run = &mut *guard;
            if run.outcome != TensorOutcome::Running {
                self.begin_step(&tensor, run);
            }

            if run.contributors.contains(&contributor) {
                warn!(tensor = %key, %contributor, generation = run.generation, "duplicate contribution rejected");
                return Err(EngineError::DuplicateContribution {
                    tensor: key.to_string(),
                    contributor,
                    generation: run.generation,
                });
            }
            let entry = Stage::entry(TensorRole::Gradient);
            let required = self.ready.required(entry);
            if run.contributors.len() >= required {
                violation = Some(EngineError::SchedulingInvariant {
                    partition: tensor.partitions[0].id,
                    stage: entry,
                    detail: format!(
                        "{contributor} is contributor {} of {required}",
                        run.contributors.len() + 1
                    ),
                });
            } else {
                run.contributors.insert(contributor);
                for p in &tensor.partitions {
                    let slot = &mut run.slots[p.id.partition_index() as usize];
                    if slot.stage.is_terminal() {
                        continue;
                    }
                    slot.inputs.push(DeviceBuffer {
                        contributor,
                        bytes: bytes[p.range()].to_vec(),
                    });
                    match self.ready.add_ready(p.id, entry, contributor) {
                        Ok(true) => {
                            slot.stage = entry;
                            ready.push(self.task(&tensor, p.id, entry, run.generation));
                        }
                        Ok(false) => {}
                        Err(e) => {
                            violation = Some(e);
                            break;
                        }
                    }
                }
            }
            debug!(tensor = %key, %contributor, generation = run.generation, ready = ready.len(), "contribution recorded");
        }

        if let Some(e) = violation {
            return Err(self.latch(e));
        }
        self.enqueue(ready)
    }

    /// Start pulling a parameter tensor. A pull already in flight is joined.
    pub fn pull(&self, key: &str) -> Result<()> {
        self.check()?;
        let tensor = self.tensor(key)?;
        if tensor.spec.role != TensorRole::Parameter {
            return Err(EngineError::Configuration(format!(
                "tensor {key} is a gradient; use push_pull"
            )));
        }

        let mut ready = Vec::new();
        let mut violation = None;
        {
            let mut guard = tensor.run.lock();
            let run = &mut *guard;
            if run.outcome == TensorOutcome::Running {
                return Ok(());
            }
            self.begin_step(&tensor, run);
            let entry = Stage::entry(TensorRole::Parameter);
            for p in &tensor.partitions {
                match self.ready.add_ready(p.id, entry, ContributorId::DRIVER) {
                    Ok(true) => {
                        run.slots[p.id.partition_index() as usize].stage = entry;
                        ready.push(self.task(&tensor, p.id, entry, run.generation));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        violation = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(e) = violation {
            return Err(self.latch(e));
        }
        self.enqueue(ready)
    }

    /// Block until the current step of `key` finishes; returns the tensor's
    /// output bytes.
    pub fn wait(&self, key: &str) -> Result<Vec<u8>> {
        let tensor = self.tensor(key)?;
        let mut run = tensor.run.lock();
        loop {
            self.check()?;
            match run.outcome {
                TensorOutcome::Idle => {
                    return Err(EngineError::Configuration(format!(
                        "tensor {key} has no step to wait for"
                    )))
                }
                TensorOutcome::Running => {
                    tensor.finished.wait_for(&mut run, WAIT_SLICE);
                }
                TensorOutcome::Done => return Ok(run.output.clone()),
                TensorOutcome::Failed => return Err(run.error(key)),
            }
        }
    }

    /// Cancel the current step of `key`. Queued tasks are drained and their
    /// partitions fail; tasks already on a worker finish their stage but do
    /// not advance. The tensor's compressor state is reset when its next
    /// step begins.
    pub fn abort(&self, key: &str) -> Result<()> {
        let tensor = self.tensor(key)?;

        let (generation, failed, completed) = {
            let mut guard = tensor.run.lock();
            let run = &mut *guard;
            if run.outcome != TensorOutcome::Running {
                return Ok(());
            }
            run.aborted = true;
            let mut failed = 0;
            for slot in run.slots.iter_mut() {
                if !slot.in_flight && !slot.stage.is_terminal() {
                    slot.stage = Stage::Failed;
                    slot.inputs.clear();
                    slot.buffer = Vec::new();
                    failed += 1;
                }
            }
            run.remaining -= failed;
            bump(&self.counters.partitions_failed, failed as u64);
            (run.generation, failed, self.settle(&tensor, run))
        };

        let drained = self
            .queue
            .drain(|t| t.tensor_key == key && t.generation == generation);
        warn!(tensor = %key, generation, failed, drained = drained.len(), "tensor aborted");

        if let Some(completion) = completed {
            self.complete(&tensor, completion);
        }
        Ok(())
    }

    pub fn status(&self, key: &str) -> Result<TensorStatus> {
        let tensor = self.tensor(key)?;
        let run = tensor.run.lock();
        Ok(TensorStatus {
            key: key.to_string(),
            generation: run.generation,
            outcome: run.outcome,
            aborted: run.aborted,
            stages: run.slots.iter().map(|s| s.stage).collect(),
            failure: run.failure.clone(),
        })
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            tensors: self.tensors.read().len(),
            queued_tasks: self.queue.size(),
            tasks_executed: c.tasks_executed.load(Ordering::Relaxed),
            partitions_done: c.partitions_done.load(Ordering::Relaxed),
            partitions_failed: c.partitions_failed.load(Ordering::Relaxed),
            steps_done: c.steps_done.load(Ordering::Relaxed),
            steps_failed: c.steps_failed.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Refuse new work, abort every running tensor, stop the queue and
    /// release workers blocked in the transport. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<String> = self.tensors.read().keys().cloned().collect();
        for key in keys {
            let _ = self.abort(&key);
        }
        self.queue.shutdown();
        self.backends.transport.close();
        for tensor in self.tensors.read().values() {
            tensor.finished.notify_all();
        }
    }

    // ── Step lifecycle ────────────────────────────────────────────────────

    fn begin_step(&self, tensor: &TensorState, run: &mut Run) {
        // An aborted step may have left half-applied residuals behind.
        if run.aborted {
            tensor.compressor.reset();
        }
        run.generation += 1;
        run.outcome = TensorOutcome::Running;
        run.aborted = false;
        run.failure = None;
        run.contributors.clear();
        run.remaining = tensor.partitions.len();
        run.output = vec![0; tensor.spec.num_bytes];
        for slot in run.slots.iter_mut() {
            *slot = Slot::init();
        }
        for p in &tensor.partitions {
            self.ready.reset_partition(p.id, tensor.spec.role);
        }
        debug!(tensor = %tensor.spec.key, generation = run.generation, "step started");
    }

    /// Mark the step finished once no partition is left running.
    fn settle(&self, tensor: &TensorState, run: &mut Run) -> Option<Completion> {
        if run.outcome != TensorOutcome::Running || run.remaining > 0 {
            return None;
        }
        let outcome = if run.failure.is_some() || run.aborted {
            bump(&self.counters.steps_failed, 1);
            TensorOutcome::Failed
        } else {
            bump(&self.counters.steps_done, 1);
            TensorOutcome::Done
        };
        run.outcome = outcome;
        Some(Completion {
            tensor: tensor.spec.key.clone(),
            generation: run.generation,
            outcome,
            failure: run.failure.clone(),
        })
    }

    /// Wake waiters and run the hook. Called without the tensor lock.
    fn complete(&self, tensor: &TensorState, completion: Completion) {
        tensor.finished.notify_all();
        match &completion.failure {
            None if completion.outcome == TensorOutcome::Done => info!(
                tensor = %completion.tensor,
                generation = completion.generation,
                "step complete"
            ),
            failure => warn!(
                tensor = %completion.tensor,
                generation = completion.generation,
                partition = ?failure.as_ref().map(|f| f.partition.to_string()),
                "step failed"
            ),
        }
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(&completion);
        }
    }

    fn task(&self, tensor: &TensorState, partition: PartitionId, stage: Stage, generation: u64) -> Task {
        Task {
            partition_id: partition,
            tensor_key: tensor.spec.key.clone(),
            stage,
            priority: tensor.priority,
            generation,
        }
    }

    fn enqueue(&self, tasks: Vec<Task>) -> Result<()> {
        for task in tasks {
            if !self.queue.push(task) {
                return Err(EngineError::ShutDown);
            }
        }
        Ok(())
    }

    // ── Worker side ───────────────────────────────────────────────────────

    /// Run one stage of one partition, then announce and enqueue the next.
    pub fn execute(&self, task: Task) {
        if self.check().is_err() {
            trace!(partition = %task.partition_id, stage = %task.stage, "engine halted; task dropped");
            return;
        }
        let Ok(tensor) = self.tensor(&task.tensor_key) else {
            warn!(tensor = %task.tensor_key, "task for unknown tensor dropped");
            return;
        };
        let pid = task.partition_id;
        let index = pid.partition_index() as usize;
        let Some(partition) = tensor.partitions.get(index) else {
            self.latch(EngineError::SchedulingInvariant {
                partition: pid,
                stage: task.stage,
                detail: format!("tensor {} has no partition {index}", task.tensor_key),
            });
            return;
        };

        // Claim.
        let (inputs, buffer) = {
            let mut guard = tensor.run.lock();
            let run = &mut *guard;
            if run.generation != task.generation {
                debug!(partition = %pid, stage = %task.stage, task_generation = task.generation, generation = run.generation, "stale task dropped");
                return;
            }
            let slot = &mut run.slots[index];
            if slot.stage == Stage::Failed {
                trace!(partition = %pid, stage = %task.stage, "task for failed partition dropped");
                return;
            }
            if slot.stage != task.stage || slot.in_flight {
                let detail = format!(
                    "task for {} found partition at {}{}",
                    task.stage,
                    slot.stage,
                    if slot.in_flight { " (in flight)" } else { "" }
                );
                drop(guard);
                self.latch(EngineError::SchedulingInvariant {
                    partition: pid,
                    stage: task.stage,
                    detail,
                });
                return;
            }
            slot.in_flight = true;
            (mem::take(&mut slot.inputs), mem::take(&mut slot.buffer))
        };

        trace!(tensor = %task.tensor_key, partition = %pid, stage = %task.stage, "stage started");
        let result = self.perform(&tensor, partition, task.stage, inputs, buffer);
        bump(&self.counters.tasks_executed, 1);

        // Advance.
        let mut follow_on = None;
        let mut violation = None;
        let completed = {
            let mut guard = tensor.run.lock();
            let run = &mut *guard;
            let aborted = run.aborted;
            let slot = &mut run.slots[index];
            slot.in_flight = false;

            match result {
                Err(err) => {
                    warn!(
                        tensor = %task.tensor_key,
                        partition = %pid,
                        stage = %task.stage,
                        error = %err,
                        "partition failed"
                    );
                    slot.stage = Stage::Failed;
                    run.remaining -= 1;
                    bump(&self.counters.partitions_failed, 1);
                    run.failure.get_or_insert(PartitionFailure {
                        partition: pid,
                        stage: task.stage,
                        reason: err.to_string(),
                    });
                }
                Ok(_) if aborted => {
                    debug!(partition = %pid, stage = %task.stage, "partition stopped by abort");
                    slot.stage = Stage::Failed;
                    run.remaining -= 1;
                    bump(&self.counters.partitions_failed, 1);
                }
                Ok(bytes) => {
                    self.ready.reset(pid, task.stage);
                    let next = task.stage.next(tensor.spec.role).unwrap_or(Stage::Done);
                    if next == Stage::Done {
                        run.output[partition.range()].copy_from_slice(&bytes);
                        slot.stage = Stage::Done;
                        run.remaining -= 1;
                        bump(&self.counters.partitions_done, 1);
                        debug!(tensor = %task.tensor_key, partition = %pid, "partition done");
                    } else {
                        slot.buffer = bytes;
                        match self.ready.add_ready(pid, next, ContributorId::DRIVER) {
                            Ok(true) => {
                                slot.stage = next;
                                debug!(partition = %pid, from = %task.stage, to = %next, "stage transition");
                                follow_on = Some(self.task(&tensor, pid, next, task.generation));
                            }
                            Ok(false) => {
                                violation = Some(EngineError::SchedulingInvariant {
                                    partition: pid,
                                    stage: next,
                                    detail: "stage announced twice".into(),
                                });
                            }
                            Err(e) => violation = Some(e),
                        }
                    }
                }
            }
            self.settle(&tensor, run)
        };

        if let Some(e) = violation {
            self.latch(e);
            return;
        }
        if let Some(next) = follow_on {
            if !self.queue.push_follow_on(next) {
                debug!(partition = %pid, "queue shut down; follow-on dropped");
            }
        }
        if let Some(completion) = completed {
            self.complete(&tensor, completion);
        }
    }

    /// The work of one stage. Runs without any tensor lock held.
    fn perform(
        &self,
        tensor: &TensorState,
        partition: &Partition,
        stage: Stage,
        mut inputs: Vec<DeviceBuffer>,
        buffer: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let key = &tensor.spec.key;
        let pid = partition.id;
        let transport_err = |e: crate::error::BackendError| EngineError::Transport {
            partition: pid,
            stage,
            reason: e.to_string(),
        };
        let compress_err = |source| EngineError::Compression {
            tensor: key.clone(),
            source,
        };

        match stage {
            Stage::LocalReduceWait => {
                let reduced = if inputs.len() == 1 {
                    inputs.pop().map(|d| d.bytes).unwrap_or_default()
                } else {
                    self.backends
                        .reducer
                        .reduce_local(key, partition, tensor.spec.dtype, &inputs)
                        .map_err(transport_err)?
                };
                if reduced.len() != partition.length {
                    return Err(EngineError::Transport {
                        partition: pid,
                        stage,
                        reason: format!(
                            "reduction produced {} bytes, expected {}",
                            reduced.len(),
                            partition.length
                        ),
                    });
                }
                Ok(reduced)
            }
            Stage::Compress => tensor.compressor.encode(pid, &buffer).map_err(compress_err),
            Stage::Transmit => match tensor.spec.role {
                TensorRole::Gradient => {
                    let len = buffer.len() as u64;
                    let destination = (pid.as_u64() % self.config.num_servers as u64) as usize;
                    self.backends
                        .transport
                        .send(pid, buffer, destination)
                        .map_err(transport_err)?;
                    bump(&self.counters.bytes_sent, len);
                    Ok(Vec::new())
                }
                TensorRole::Parameter => self.receive(pid, stage),
            },
            Stage::ServerAggregate => self.receive(pid, stage),
            Stage::Decompress => tensor.compressor.decode(pid, &buffer).map_err(compress_err),
            Stage::BroadcastWait => {
                if let Some(shm) = &self.backends.shm {
                    shm.publish(pid, &buffer).map_err(transport_err)?;
                }
                Ok(buffer)
            }
            Stage::Init | Stage::Done | Stage::Failed => Err(EngineError::SchedulingInvariant {
                partition: pid,
                stage,
                detail: "no work is defined for this stage".into(),
            }),
        }
    }

    fn receive(&self, pid: PartitionId, stage: Stage) -> Result<Vec<u8>> {
        let bytes = self
            .backends
            .transport
            .receive(pid)
            .map_err(|e| EngineError::Transport {
                partition: pid,
                stage,
                reason: e.to_string(),
            })?;
        bump(&self.counters.bytes_received, bytes.len() as u64);
        Ok(bytes)
    }
}

impl fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("tensors", &self.tensors.read().len())
            .field("queued", &self.queue.size())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
