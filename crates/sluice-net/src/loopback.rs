//! In-process aggregation server and the worker-side transport bound to it.
//!
//! Each partition advances in rounds. A round completes once every one of the
//! server's `num_workers` has pushed; the decoded pushes are summed and the
//! result published as an uncompressed payload. Pulls block until the round
//! they ask for is published. Every request and response goes through the
//! [`wire`](crate::wire) framing, so the byte path matches a socket transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sluice_compress::Payload;
use sluice_pipeline::backend::sum_buffers;
use sluice_pipeline::{Ack, BackendError, Transport};
use sluice_types::{DataType, PartitionId};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::wire::{self, PartitionRequest, PartitionResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ── Server ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Round {
    /// Rounds published so far; `aggregate` belongs to the latest one.
    completed: u64,
    aggregate: Option<Vec<u8>>,
    dtype: Option<DataType>,
    pending: Vec<Vec<u8>>,
    contributors: HashSet<u32>,
}

#[derive(Default)]
struct ServerState {
    rounds: HashMap<PartitionId, Round>,
    closed: bool,
}

pub struct LoopbackServer {
    num_workers: usize,
    timeout: Duration,
    state: Mutex<ServerState>,
    published: Condvar,
}

impl LoopbackServer {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            timeout: DEFAULT_TIMEOUT,
            state: Mutex::new(ServerState::default()),
            published: Condvar::new(),
        }
    }

    /// How long a pull waits for its round before giving up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Seed `partition` with `bytes` as a new round, e.g. initial parameters.
    /// Returns the round number.
    pub fn publish(&self, partition: PartitionId, dtype: DataType, bytes: Vec<u8>) -> Result<u64> {
        let payload = Payload::raw(dtype, bytes).to_bytes()?;
        let mut state = self.state.lock();
        let round = state.rounds.entry(partition).or_default();
        round.completed += 1;
        round.aggregate = Some(payload);
        let completed = round.completed;
        self.published.notify_all();
        debug!(partition = %partition, round = completed, "published");
        Ok(completed)
    }

    /// Latest published round of `partition` and its native bytes.
    pub fn latest(&self, partition: PartitionId) -> Option<(u64, Vec<u8>)> {
        let state = self.state.lock();
        let round = state.rounds.get(&partition)?;
        let payload = Payload::from_bytes(round.aggregate.as_deref()?).ok()?;
        let bytes = payload.decode_bytes().ok()?;
        Some((round.completed, bytes))
    }

    /// Fail every blocked and future pull.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.published.notify_all();
        info!(workers = self.num_workers, "loopback server closed");
    }

    /// Wake blocked pulls so they re-check their cancel flag.
    fn wake(&self) {
        let _guard = self.state.lock();
        self.published.notify_all();
    }

    /// Serve one request. `cancel` is the caller's shutdown flag; a pull
    /// blocked on it returns `Closed` once the flag is set.
    pub fn handle(&self, request: PartitionRequest, cancel: &AtomicBool) -> PartitionResponse {
        match request {
            PartitionRequest::Push {
                worker,
                partition,
                payload,
            } => self.push(worker, partition, &payload),
            PartitionRequest::Pull {
                partition,
                min_round,
                ..
            } => self.pull(partition, min_round, cancel),
        }
    }

    fn push(&self, worker: u32, raw: u64, payload: &[u8]) -> PartitionResponse {
        let partition = PartitionId::from_raw(raw);
        let rejected = |reason: String| {
            warn!(partition = %partition, worker, %reason, "push rejected");
            PartitionResponse::Rejected {
                partition: raw,
                reason,
            }
        };

        let (dtype, bytes) = match Payload::from_bytes(payload)
            .and_then(|p| Ok((p.dtype, p.decode_bytes()?)))
        {
            Ok(decoded) => decoded,
            Err(e) => return rejected(format!("undecodable payload: {e}")),
        };

        let mut state = self.state.lock();
        if state.closed {
            return PartitionResponse::Closed { partition: raw };
        }
        let round = state.rounds.entry(partition).or_default();
        let target = round.completed + 1;

        if round.contributors.contains(&worker) {
            return rejected(format!("worker {worker} already pushed round {target}"));
        }
        if let Some(expected) = round.dtype {
            if expected != dtype {
                return rejected(format!("dtype {dtype} differs from round dtype {expected}"));
            }
        }
        if let Some(first) = round.pending.first() {
            if first.len() != bytes.len() {
                return rejected(format!(
                    "{} bytes differs from round length {}",
                    bytes.len(),
                    first.len()
                ));
            }
        }

        round.dtype = Some(dtype);
        round.contributors.insert(worker);
        round.pending.push(bytes);

        if round.pending.len() < self.num_workers {
            return PartitionResponse::Accepted {
                partition: raw,
                round: target,
            };
        }

        let inputs: Vec<&[u8]> = round.pending.iter().map(Vec::as_slice).collect();
        let summed = sum_buffers(dtype, &inputs)
            .map_err(NetError::Rejected)
            .and_then(|sum| Ok(Payload::raw(dtype, sum).to_bytes()?));
        round.pending.clear();
        round.contributors.clear();
        round.dtype = None;

        match summed {
            Ok(aggregate) => {
                round.completed = target;
                round.aggregate = Some(aggregate);
                self.published.notify_all();
                debug!(partition = %partition, round = target, workers = self.num_workers, "round aggregated");
                PartitionResponse::Accepted {
                    partition: raw,
                    round: target,
                }
            }
            Err(e) => rejected(format!("aggregation failed: {e}")),
        }
    }

    fn pull(&self, raw: u64, min_round: u64, cancel: &AtomicBool) -> PartitionResponse {
        let partition = PartitionId::from_raw(raw);
        let wanted = min_round.max(1);
        let deadline = Instant::now() + self.timeout;

        let mut state = self.state.lock();
        loop {
            if state.closed || cancel.load(Ordering::Acquire) {
                return PartitionResponse::Closed { partition: raw };
            }
            let ready = state
                .rounds
                .get(&partition)
                .filter(|r| r.completed >= wanted)
                .and_then(|r| r.aggregate.clone().map(|p| (r.completed, p)));
            if let Some((round, payload)) = ready {
                return PartitionResponse::Aggregate {
                    partition: raw,
                    round,
                    payload,
                };
            }
            if self.published.wait_until(&mut state, deadline).timed_out() {
                warn!(partition = %partition, min_round = wanted, "pull timed out");
                return PartitionResponse::TimedOut {
                    partition: raw,
                    min_round: wanted,
                };
            }
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// One worker's connection to a [`LoopbackServer`].
pub struct LoopbackTransport {
    server: Arc<LoopbackServer>,
    worker: u32,
    /// Round each pushed partition joined, consumed by the matching receive.
    awaiting: Mutex<HashMap<PartitionId, u64>>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(server: Arc<LoopbackServer>, worker: u32) -> Self {
        Self {
            server,
            worker,
            awaiting: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn worker(&self) -> u32 {
        self.worker
    }

    fn call(&self, request: PartitionRequest) -> Result<PartitionResponse> {
        let request = wire::through_frame(&request)?;
        let response = self.server.handle(request, &self.closed);
        wire::through_frame(&response)
    }
}

impl Transport for LoopbackTransport {
    fn send(
        &self,
        partition: PartitionId,
        payload: Vec<u8>,
        destination: usize,
    ) -> std::result::Result<Ack, BackendError> {
        let response = self.call(PartitionRequest::Push {
            worker: self.worker,
            partition: partition.as_u64(),
            payload,
        })?;
        match response {
            PartitionResponse::Accepted { round, .. } => {
                self.awaiting.lock().insert(partition, round);
                Ok(Ack {
                    partition,
                    destination,
                })
            }
            PartitionResponse::Rejected { reason, .. } => Err(BackendError::Transport(reason)),
            PartitionResponse::Closed { .. } => Err(BackendError::Closed),
            other => Err(BackendError::Transport(format!(
                "unexpected response to push: {other:?}"
            ))),
        }
    }

    fn receive(&self, partition: PartitionId) -> std::result::Result<Vec<u8>, BackendError> {
        // Pulls without a preceding push (parameters) take any published round.
        let min_round = self.awaiting.lock().remove(&partition).unwrap_or(1);
        let response = self.call(PartitionRequest::Pull {
            worker: self.worker,
            partition: partition.as_u64(),
            min_round,
        })?;
        match response {
            PartitionResponse::Aggregate { payload, .. } => Ok(payload),
            PartitionResponse::TimedOut { .. } => Err(BackendError::Timeout(partition)),
            PartitionResponse::Closed { .. } => Err(BackendError::Closed),
            PartitionResponse::Rejected { reason, .. } => Err(BackendError::Transport(reason)),
            other => Err(BackendError::Transport(format!(
                "unexpected response to pull: {other:?}"
            ))),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.server.wake();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::thread;

    use sluice_pipeline::{Backends, Engine, EngineError, SharedMemory, TensorOutcome};
    use sluice_types::{CodecConfig, CodecKind, ContributorId, EngineConfig, Stage, TensorSpec};

    use super::*;
    use crate::shm::MmapSharedMemory;

    fn config(local_size: usize) -> EngineConfig {
        EngineConfig {
            partition_bytes: 1024,
            min_merge_bytes: 16,
            worker_threads: 2,
            local_size,
            ..EngineConfig::default()
        }
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    fn as_f32(bytes: &[u8]) -> Vec<f32> {
        bytemuck::pod_collect_to_vec(bytes)
    }

    fn push(server: &LoopbackServer, worker: u32, pid: PartitionId, values: &[f32]) -> PartitionResponse {
        let payload = Payload::raw(DataType::Float32, f32_bytes(values))
            .to_bytes()
            .unwrap();
        server.handle(
            PartitionRequest::Push {
                worker,
                partition: pid.as_u64(),
                payload,
            },
            &AtomicBool::new(false),
        )
    }

    /// Fails every push of one partition index.
    struct Flaky {
        inner: LoopbackTransport,
        fail_on: u32,
    }

    impl Transport for Flaky {
        fn send(&self, partition: PartitionId, payload: Vec<u8>, destination: usize) -> std::result::Result<Ack, BackendError> {
            if partition.partition_index() == self.fail_on {
                return Err(BackendError::Transport("connection reset by peer".into()));
            }
            self.inner.send(partition, payload, destination)
        }

        fn receive(&self, partition: PartitionId) -> std::result::Result<Vec<u8>, BackendError> {
            self.inner.receive(partition)
        }
    }

    #[test]
    fn onebit_gradient_step_end_to_end() {
        let server = Arc::new(LoopbackServer::new(1));
        let shm = Arc::new(MmapSharedMemory::new());
        let cfg = EngineConfig {
            default_codec: CodecConfig::new(CodecKind::OneBit),
            ..config(2)
        };
        let backends = Backends::new(Arc::new(LoopbackTransport::new(server.clone(), 0)))
            .with_shared_memory(shm.clone());
        let engine = Engine::init(cfg, backends).unwrap();

        let parts = engine
            .declare(TensorSpec::gradient("layer0.weight", 4096, DataType::Float32))
            .unwrap();
        assert_eq!(parts.len(), 4);

        let grad: Vec<f32> = (0..1024).map(|i| if i % 3 == 0 { 0.75 } else { -0.25 }).collect();
        engine.push_pull("layer0.weight", ContributorId(0), &f32_bytes(&grad)).unwrap();
        engine.push_pull("layer0.weight", ContributorId(1), &f32_bytes(&grad)).unwrap();

        let out = as_f32(&engine.wait("layer0.weight").unwrap());
        assert_eq!(out.len(), 1024);
        for (o, g) in out.iter().zip(&grad) {
            assert_eq!(o.signum(), g.signum());
        }

        // Each compressed push is a fraction of the 1024-byte partition.
        let stats = engine.stats();
        assert!(stats.bytes_sent < 4 * 1024 / 4, "sent {}", stats.bytes_sent);

        for part in &parts {
            assert_eq!(shm.acquire(part.id).unwrap().len(), 1024);
            assert_eq!(server.latest(part.id).unwrap().0, 1);
        }
    }

    #[test]
    fn failed_push_fails_only_its_partition() {
        let server = Arc::new(LoopbackServer::new(1));
        let flaky = Flaky {
            inner: LoopbackTransport::new(server, 0),
            fail_on: 1,
        };
        let engine = Engine::init(config(1), Backends::new(Arc::new(flaky))).unwrap();
        engine
            .declare(TensorSpec::gradient("layer0.weight", 4096, DataType::Float32))
            .unwrap();
        engine
            .push_pull("layer0.weight", ContributorId(0), &vec![0u8; 4096])
            .unwrap();

        match engine.wait("layer0.weight").unwrap_err() {
            EngineError::TensorFailed { partition, stage, .. } => {
                assert_eq!(partition.partition_index(), 1);
                assert_eq!(stage, Stage::Transmit);
            }
            other => panic!("unexpected error: {other}"),
        }
        let status = engine.status("layer0.weight").unwrap();
        assert_eq!(status.outcome, TensorOutcome::Failed);
        assert_eq!(
            status.stages,
            vec![Stage::Done, Stage::Failed, Stage::Done, Stage::Done]
        );
    }

    #[test]
    fn two_workers_sum_over_several_rounds() {
        let server = Arc::new(LoopbackServer::new(2));
        let engines: Vec<Engine> = (0..2)
            .map(|w| {
                let transport = LoopbackTransport::new(server.clone(), w);
                Engine::init(config(1), Backends::new(Arc::new(transport))).unwrap()
            })
            .collect();
        let spec = TensorSpec::gradient("w", 2048, DataType::Float32);
        let parts = engines[0].declare(spec.clone()).unwrap();
        assert_eq!(engines[1].declare(spec).unwrap(), parts);

        for step in 1..=3u32 {
            let mine = vec![step as f32; 512];
            let theirs = vec![1.0f32; 512];
            engines[0].push_pull("w", ContributorId(0), &f32_bytes(&mine)).unwrap();
            engines[1].push_pull("w", ContributorId(0), &f32_bytes(&theirs)).unwrap();
            for engine in &engines {
                assert_eq!(as_f32(&engine.wait("w").unwrap()), vec![step as f32 + 1.0; 512]);
            }
        }
        for part in &parts {
            assert_eq!(server.latest(part.id).unwrap().0, 3);
        }
    }

    #[test]
    fn parameter_pull_reads_published_values() {
        let server = Arc::new(LoopbackServer::new(1));
        let engine = Engine::init(
            config(1),
            Backends::new(Arc::new(LoopbackTransport::new(server.clone(), 0))),
        )
        .unwrap();
        let parts = engine
            .declare(TensorSpec::parameter("embed", 2048, DataType::Float32))
            .unwrap();

        let values: Vec<f32> = (0..512).map(|i| i as f32 * 0.5).collect();
        let bytes = f32_bytes(&values);
        for part in &parts {
            server
                .publish(part.id, DataType::Float32, bytes[part.range()].to_vec())
                .unwrap();
        }

        engine.pull("embed").unwrap();
        assert_eq!(as_f32(&engine.wait("embed").unwrap()), values);
    }

    #[test]
    fn unpublished_parameter_times_out() {
        let server = Arc::new(LoopbackServer::new(1).with_timeout(Duration::from_millis(30)));
        let engine = Engine::init(
            config(1),
            Backends::new(Arc::new(LoopbackTransport::new(server, 0))),
        )
        .unwrap();
        engine
            .declare(TensorSpec::parameter("embed", 64, DataType::Float32))
            .unwrap();
        engine.pull("embed").unwrap();
        assert!(matches!(
            engine.wait("embed"),
            Err(EngineError::TensorFailed { stage: Stage::Transmit, .. })
        ));
    }

    #[test]
    fn server_rejects_inconsistent_pushes() {
        let server = LoopbackServer::new(2);
        let pid = PartitionId::new(0, 0);

        assert_eq!(
            push(&server, 0, pid, &[1.0, 2.0]),
            PartitionResponse::Accepted { partition: pid.as_u64(), round: 1 }
        );
        assert!(matches!(push(&server, 0, pid, &[1.0, 2.0]), PartitionResponse::Rejected { .. }));
        assert!(matches!(push(&server, 1, pid, &[1.0]), PartitionResponse::Rejected { .. }));

        let garbage = PartitionRequest::Push {
            worker: 1,
            partition: pid.as_u64(),
            payload: vec![0xff; 3],
        };
        assert!(matches!(
            server.handle(garbage, &AtomicBool::new(false)),
            PartitionResponse::Rejected { .. }
        ));

        assert_eq!(
            push(&server, 1, pid, &[0.5, 0.5]),
            PartitionResponse::Accepted { partition: pid.as_u64(), round: 1 }
        );
        let (round, bytes) = server.latest(pid).unwrap();
        assert_eq!(round, 1);
        assert_eq!(as_f32(&bytes), vec![1.5, 2.5]);
    }

    #[test]
    fn close_releases_blocked_receive() {
        let server = Arc::new(LoopbackServer::new(1));
        let transport = Arc::new(LoopbackTransport::new(server, 0));
        let receiver = {
            let transport = transport.clone();
            thread::spawn(move || transport.receive(PartitionId::new(0, 0)))
        };
        thread::sleep(Duration::from_millis(20));
        transport.close();
        assert_eq!(receiver.join().unwrap(), Err(BackendError::Closed));
    }
}
