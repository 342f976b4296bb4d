//! Explicit engine context: one per process, created by `Engine::init` and
//! torn down by `Engine::shutdown` (or drop).

use std::sync::Arc;

use parking_lot::Mutex;
use sluice_types::{ContributorId, EngineConfig, Partition, PartitionId, TensorSpec};
use tracing::info;
use uuid::Uuid;

use crate::backend::Backends;
use crate::driver::{Completion, EngineStats, PipelineDriver, TensorStatus};
use crate::error::{EngineError, Result};
use crate::pool::WorkerPool;
use crate::queue::TaskQueue;

pub struct Engine {
    id: Uuid,
    driver: Arc<PipelineDriver>,
    pool: Mutex<Option<WorkerPool>>,
}

impl Engine {
    /// Validate `config`, start the worker pool and return the running engine.
    pub fn init(config: EngineConfig, backends: Backends) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let queue = Arc::new(TaskQueue::new(config.queue_bound));
        let driver = Arc::new(PipelineDriver::new(config.clone(), backends, queue.clone()));

        let worker_driver = driver.clone();
        let pool = WorkerPool::spawn(config.worker_threads, queue, move |task| {
            worker_driver.execute(task)
        })
        .map_err(|e| EngineError::Configuration(format!("failed to spawn workers: {e}")))?;

        info!(
            engine = %id,
            workers = pool.len(),
            partition_bytes = config.partition_bytes,
            local_size = config.local_size,
            num_servers = config.num_servers,
            codec = %config.default_codec,
            "engine started"
        );

        Ok(Self {
            id,
            driver,
            pool: Mutex::new(Some(pool)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register a tensor. Idempotent for the same key and size.
    pub fn declare(&self, spec: TensorSpec) -> Result<Vec<Partition>> {
        self.driver.declare(spec)
    }

    /// Contribute `bytes` from one local device to the current step of a
    /// gradient tensor. Returns once the work is queued.
    pub fn push_pull(&self, key: &str, contributor: ContributorId, bytes: &[u8]) -> Result<()> {
        self.driver.push_pull(key, contributor, bytes)
    }

    /// Start fetching a parameter tensor from the servers.
    pub fn pull(&self, key: &str) -> Result<()> {
        self.driver.pull(key)
    }

    /// Block until the tensor's current step finishes and return its bytes.
    pub fn wait(&self, key: &str) -> Result<Vec<u8>> {
        self.driver.wait(key)
    }

    pub fn abort(&self, key: &str) -> Result<()> {
        self.driver.abort(key)
    }

    pub fn status(&self, key: &str) -> Result<TensorStatus> {
        self.driver.status(key)
    }

    pub fn stats(&self) -> EngineStats {
        self.driver.stats()
    }

    pub fn partitions(&self, key: &str) -> Result<Vec<Partition>> {
        self.driver
            .registry()
            .partitions(key)
            .ok_or_else(|| EngineError::UnknownTensor(key.to_string()))
    }

    pub fn lookup(&self, id: PartitionId) -> Option<Partition> {
        self.driver.registry().lookup(id)
    }

    /// Install a hook run on a worker thread whenever a tensor's step ends.
    pub fn on_complete<F>(&self, hook: F)
    where
        F: Fn(&Completion) + Send + Sync + 'static,
    {
        self.driver.set_hook(Arc::new(hook));
    }

    /// Abort in-flight steps, stop the queue and join every worker.
    pub fn shutdown(&self) {
        self.driver.shutdown();
        if let Some(pool) = self.pool.lock().take() {
            pool.join();
            info!(engine = %self.id, "engine stopped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use parking_lot::Condvar;
    use sluice_compress::Payload;
    use sluice_types::{CodecConfig, CodecKind, DataType, Stage};

    use super::*;
    use crate::backend::{Ack, DeviceBuffer, ReductionBackend, Transport};
    use crate::driver::TensorOutcome;
    use crate::error::BackendError;
    use crate::queue::Task;

    // ── Mock transports ───────────────────────────────────────────────────

    /// Single-worker server: hands back exactly what was pushed.
    #[derive(Default)]
    struct Echo {
        pushed: Mutex<HashMap<PartitionId, Vec<u8>>>,
        fail_on: Option<u32>,
    }

    impl Transport for Echo {
        fn send(&self, partition: PartitionId, payload: Vec<u8>, destination: usize) -> std::result::Result<Ack, BackendError> {
            if self.fail_on == Some(partition.partition_index()) {
                return Err(BackendError::Transport("connection reset".into()));
            }
            self.pushed.lock().insert(partition, payload);
            Ok(Ack { partition, destination })
        }

        fn receive(&self, partition: PartitionId) -> std::result::Result<Vec<u8>, BackendError> {
            self.pushed
                .lock()
                .remove(&partition)
                .ok_or(BackendError::Timeout(partition))
        }
    }

    /// Parameter store: every receive returns a raw payload of `value`s.
    struct Params {
        value: f32,
        elements: usize,
    }

    impl Transport for Params {
        fn send(&self, partition: PartitionId, _: Vec<u8>, destination: usize) -> std::result::Result<Ack, BackendError> {
            Ok(Ack { partition, destination })
        }

        fn receive(&self, _: PartitionId) -> std::result::Result<Vec<u8>, BackendError> {
            let values = vec![self.value; self.elements];
            Payload::raw(DataType::Float32, bytemuck::cast_slice(&values).to_vec())
                .to_bytes()
                .map_err(|e| BackendError::Transport(e.to_string()))
        }
    }

    /// Accepts every push and answers every receive with undecodable bytes.
    struct Garbage;

    impl Transport for Garbage {
        fn send(&self, partition: PartitionId, _: Vec<u8>, destination: usize) -> std::result::Result<Ack, BackendError> {
            Ok(Ack { partition, destination })
        }

        fn receive(&self, _: PartitionId) -> std::result::Result<Vec<u8>, BackendError> {
            Ok(vec![0xff; 3])
        }
    }

    /// Reducer whose device is gone.
    struct LostDevice;

    impl ReductionBackend for LostDevice {
        fn reduce_local(
            &self,
            _: &str,
            _: &Partition,
            _: DataType,
            _: &[DeviceBuffer],
        ) -> std::result::Result<Vec<u8>, BackendError> {
            Err(BackendError::Reduction("device 1 lost".into()))
        }
    }

    /// Echo whose `send` blocks until the gate opens.
    #[derive(Default)]
    struct Gated {
        inner: Echo,
        open: Mutex<bool>,
        cv: Condvar,
        waiting: AtomicUsize,
    }

    impl Gated {
        fn open(&self) {
            *self.open.lock() = true;
            self.cv.notify_all();
        }

        fn wait_for_blocked(&self) {
            while self.waiting.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(2));
            }
        }
    }

    impl Transport for Gated {
        fn send(&self, partition: PartitionId, payload: Vec<u8>, destination: usize) -> std::result::Result<Ack, BackendError> {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock();
            while !*open {
                self.cv.wait(&mut open);
            }
            drop(open);
            self.inner.send(partition, payload, destination)
        }

        fn receive(&self, partition: PartitionId) -> std::result::Result<Vec<u8>, BackendError> {
            self.inner.receive(partition)
        }

        fn close(&self) {
            self.open();
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

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

    // ── Tests ─────────────────────────────────────────────────────────────

    #[test]
    fn gradient_step_sums_local_devices() {
        let engine = Engine::init(config(2), Backends::new(Arc::new(Echo::default()))).unwrap();
        let parts = engine
            .declare(TensorSpec::gradient("layer0.weight", 4096, DataType::Float32))
            .unwrap();
        assert_eq!(parts.len(), 4);

        let a: Vec<f32> = (0..1024).map(|i| i as f32).collect();
        let b = vec![0.5f32; 1024];
        engine.push_pull("layer0.weight", ContributorId(0), &f32_bytes(&a)).unwrap();
        engine.push_pull("layer0.weight", ContributorId(1), &f32_bytes(&b)).unwrap();

        let out = as_f32(&engine.wait("layer0.weight").unwrap());
        assert_eq!(out.len(), 1024);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i as f32 + 0.5);
        }

        let status = engine.status("layer0.weight").unwrap();
        assert_eq!(status.outcome, TensorOutcome::Done);
        assert!(status.stages.iter().all(|s| *s == Stage::Done));

        let stats = engine.stats();
        assert_eq!(stats.partitions_done, 4);
        assert_eq!(stats.steps_done, 1);
        // Seven stages minus INIT and DONE, per partition.
        assert_eq!(stats.tasks_executed, 4 * 6);
    }

    #[test]
    fn transport_failure_fails_one_partition() {
        let echo = Echo {
            fail_on: Some(2),
            ..Echo::default()
        };
        let engine = Engine::init(config(1), Backends::new(Arc::new(echo))).unwrap();
        engine
            .declare(TensorSpec::gradient("w", 4096, DataType::Float32))
            .unwrap();
        engine.push_pull("w", ContributorId(0), &vec![0u8; 4096]).unwrap();

        let err = engine.wait("w").unwrap_err();
        match err {
            EngineError::TensorFailed { tensor, partition, stage, .. } => {
                assert_eq!(tensor, "w");
                assert_eq!(partition.partition_index(), 2);
                assert_eq!(stage, Stage::Transmit);
            }
            other => panic!("unexpected error: {other}"),
        }

        let status = engine.status("w").unwrap();
        assert_eq!(status.outcome, TensorOutcome::Failed);
        assert_eq!(
            status.stages,
            vec![Stage::Done, Stage::Done, Stage::Failed, Stage::Done]
        );
    }

    #[test]
    fn onebit_steps_repeat_across_generations() {
        let cfg = EngineConfig {
            default_codec: CodecConfig::new(CodecKind::OneBit),
            ..config(1)
        };
        let engine = Engine::init(cfg, Backends::new(Arc::new(Echo::default()))).unwrap();
        engine
            .declare(TensorSpec::gradient("g", 2048, DataType::Float32))
            .unwrap();

        let grad: Vec<f32> = (0..512).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        for step in 1..=3u64 {
            engine.push_pull("g", ContributorId(0), &f32_bytes(&grad)).unwrap();
            let out = as_f32(&engine.wait("g").unwrap());
            // Unit magnitudes survive one-bit with scaling off exactly.
            assert_eq!(out, grad);
            assert_eq!(engine.status("g").unwrap().generation, step);
        }
        // One-bit of 256 values per partition is far below raw size.
        let stats = engine.stats();
        assert!(stats.bytes_sent < 2048 * 3 / 4, "sent {}", stats.bytes_sent);
    }

    #[test]
    fn push_pull_on_parameter_is_rejected() {
        let transport = Params { value: 2.5, elements: 32 };
        let engine = Engine::init(config(1), Backends::new(Arc::new(transport))).unwrap();
        engine
            .declare(TensorSpec::parameter("p", 128, DataType::Float32))
            .unwrap();
        assert!(matches!(
            engine.push_pull("p", ContributorId(0), &[0u8; 128]),
            Err(EngineError::Configuration(_))
        ));
        assert_eq!(engine.partitions("p").unwrap().len(), 1);
    }

    #[test]
    fn parameter_pull_round_trip() {
        let transport = Params { value: 2.5, elements: 256 };
        let engine = Engine::init(config(1), Backends::new(Arc::new(transport))).unwrap();
        engine
            .declare(TensorSpec::parameter("p", 2048, DataType::Float32))
            .unwrap();
        engine.pull("p").unwrap();
        let out = as_f32(&engine.wait("p").unwrap());
        assert_eq!(out, vec![2.5; 512]);
    }

    #[test]
    fn parameter_pulls_ignore_momentum() {
        let transport = Params { value: 2.5, elements: 256 };
        let engine = Engine::init(config(1), Backends::new(Arc::new(transport))).unwrap();
        let codec = CodecConfig::new(CodecKind::TopK).with_momentum(0.9);
        engine
            .declare(TensorSpec::parameter("p", 1024, DataType::Float32).with_codec(codec))
            .unwrap();
        for _ in 0..3 {
            engine.pull("p").unwrap();
            assert_eq!(as_f32(&engine.wait("p").unwrap()), vec![2.5; 256]);
        }
    }

    #[test]
    fn undecodable_aggregate_fails_at_decompress() {
        let engine = Engine::init(config(1), Backends::new(Arc::new(Garbage))).unwrap();
        engine
            .declare(TensorSpec::gradient("w", 64, DataType::Float32))
            .unwrap();
        engine.push_pull("w", ContributorId(0), &[0u8; 64]).unwrap();

        match engine.wait("w").unwrap_err() {
            EngineError::TensorFailed { tensor, stage, .. } => {
                assert_eq!(tensor, "w");
                assert_eq!(stage, Stage::Decompress);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.status("w").unwrap().stages, vec![Stage::Failed]);
    }

    #[test]
    fn reducer_failure_fails_at_local_reduce() {
        let backends = Backends::new(Arc::new(Echo::default())).with_reducer(Arc::new(LostDevice));
        let engine = Engine::init(config(2), backends).unwrap();
        engine
            .declare(TensorSpec::gradient("w", 64, DataType::Float32))
            .unwrap();
        engine.push_pull("w", ContributorId(0), &[0u8; 64]).unwrap();
        engine.push_pull("w", ContributorId(1), &[0u8; 64]).unwrap();

        match engine.wait("w").unwrap_err() {
            EngineError::TensorFailed { stage, reason, .. } => {
                assert_eq!(stage, Stage::LocalReduceWait);
                assert!(reason.contains("device 1 lost"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Per-partition failure only; the engine keeps serving.
        engine
            .declare(TensorSpec::gradient("v", 64, DataType::Float32))
            .unwrap();
    }

    #[test]
    fn step_after_abort_starts_from_clean_residuals() {
        let codec = CodecConfig::new(CodecKind::TopK).with_k(0.25);
        let grad: Vec<f32> = (1..=16).map(|v| v as f32).collect();

        let fresh = Engine::init(config(1), Backends::new(Arc::new(Echo::default()))).unwrap();
        fresh
            .declare(TensorSpec::gradient("w", 64, DataType::Float32).with_codec(codec.clone()))
            .unwrap();
        fresh.push_pull("w", ContributorId(0), &f32_bytes(&grad)).unwrap();
        let expected = fresh.wait("w").unwrap();

        let gated = Arc::new(Gated::default());
        let engine = Engine::init(config(1), Backends::new(gated.clone())).unwrap();
        engine
            .declare(TensorSpec::gradient("w", 64, DataType::Float32).with_codec(codec))
            .unwrap();
        // The first step compresses (leaving a residual) and is aborted mid-send.
        engine.push_pull("w", ContributorId(0), &f32_bytes(&grad)).unwrap();
        gated.wait_for_blocked();
        engine.abort("w").unwrap();
        gated.open();
        assert!(matches!(engine.wait("w"), Err(EngineError::Aborted { .. })));

        engine.push_pull("w", ContributorId(0), &f32_bytes(&grad)).unwrap();
        assert_eq!(engine.wait("w").unwrap(), expected);
    }

    #[test]
    fn abort_drains_queued_work() {
        let gated = Arc::new(Gated::default());
        let cfg = EngineConfig {
            worker_threads: 1,
            ..config(1)
        };
        let engine = Engine::init(cfg, Backends::new(gated.clone())).unwrap();
        engine
            .declare(TensorSpec::gradient("w", 4096, DataType::Float32))
            .unwrap();
        engine.push_pull("w", ContributorId(0), &vec![0u8; 4096]).unwrap();

        gated.wait_for_blocked();
        engine.abort("w").unwrap();
        assert_eq!(engine.stats().queued_tasks, 0);

        let status = engine.status("w").unwrap();
        assert!(status.aborted);
        let in_flight = status.stages.iter().filter(|s| **s == Stage::Transmit).count();
        assert_eq!(in_flight, 1);
        assert_eq!(status.stages.iter().filter(|s| **s == Stage::Failed).count(), 3);

        gated.open();
        assert_eq!(
            engine.wait("w").unwrap_err(),
            EngineError::Aborted { tensor: "w".into() }
        );
        assert_eq!(engine.stats().partitions_failed, 4);
    }

    #[test]
    fn extra_contributor_halts_engine() {
        let gated = Arc::new(Gated::default());
        let engine = Engine::init(config(1), Backends::new(gated.clone())).unwrap();
        engine
            .declare(TensorSpec::gradient("w", 64, DataType::Float32))
            .unwrap();
        engine.push_pull("w", ContributorId(0), &[0u8; 64]).unwrap();
        gated.wait_for_blocked();

        let err = engine.push_pull("w", ContributorId(1), &[0u8; 64]).unwrap_err();
        assert!(matches!(err, EngineError::SchedulingInvariant { .. }));

        // Latched: every later call reports the same violation.
        let again = engine
            .declare(TensorSpec::gradient("v", 64, DataType::Float32))
            .unwrap_err();
        assert_eq!(again, err);
        assert_eq!(engine.wait("w").unwrap_err(), err);
        gated.open();
    }

    #[test]
    fn task_for_done_partition_is_a_violation() {
        let engine = Engine::init(config(1), Backends::new(Arc::new(Echo::default()))).unwrap();
        let parts = engine
            .declare(TensorSpec::gradient("w", 64, DataType::Float32))
            .unwrap();
        engine.push_pull("w", ContributorId(0), &[0u8; 64]).unwrap();
        engine.wait("w").unwrap();

        engine.driver.execute(Task {
            partition_id: parts[0].id,
            tensor_key: "w".into(),
            stage: Stage::Compress,
            priority: 0,
            generation: 1,
        });
        assert!(matches!(
            engine.declare(TensorSpec::gradient("v", 64, DataType::Float32)),
            Err(EngineError::SchedulingInvariant { stage: Stage::Compress, .. })
        ));
    }

    #[test]
    fn duplicate_contribution_is_rejected() {
        let engine = Engine::init(config(2), Backends::new(Arc::new(Echo::default()))).unwrap();
        engine
            .declare(TensorSpec::gradient("w", 64, DataType::Float32))
            .unwrap();
        let ones = f32_bytes(&[1.0; 16]);
        engine.push_pull("w", ContributorId(0), &ones).unwrap();
        assert_eq!(
            engine.push_pull("w", ContributorId(0), &ones).unwrap_err(),
            EngineError::DuplicateContribution {
                tensor: "w".into(),
                contributor: ContributorId(0),
                generation: 1,
            }
        );
        assert_eq!(engine.status("w").unwrap().stages, vec![Stage::Init]);

        engine.push_pull("w", ContributorId(1), &ones).unwrap();
        assert_eq!(as_f32(&engine.wait("w").unwrap()), vec![2.0; 16]);
    }

    #[test]
    fn completion_hook_sees_every_step() {
        let engine = Engine::init(config(1), Backends::new(Arc::new(Echo::default()))).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            engine.on_complete(move |c| seen.lock().push((c.tensor.clone(), c.outcome)));
        }
        engine
            .declare(TensorSpec::gradient("a", 64, DataType::Float32))
            .unwrap();
        engine.push_pull("a", ContributorId(0), &[0u8; 64]).unwrap();
        engine.wait("a").unwrap();

        // The hook runs after waiters are woken; give it a moment.
        for _ in 0..100 {
            if !seen.lock().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.lock().as_slice(), &[("a".to_string(), TensorOutcome::Done)]);
    }

    #[test]
    fn rejects_bad_calls() {
        let engine = Engine::init(config(1), Backends::new(Arc::new(Echo::default()))).unwrap();
        assert!(matches!(
            engine.push_pull("missing", ContributorId(0), &[]),
            Err(EngineError::UnknownTensor(_))
        ));
        engine
            .declare(TensorSpec::gradient("w", 64, DataType::Float32))
            .unwrap();
        assert!(matches!(
            engine.push_pull("w", ContributorId(0), &[0u8; 8]),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(engine.wait("w"), Err(EngineError::Configuration(_))));
        assert!(matches!(
            engine.declare(TensorSpec::gradient("w", 128, DataType::Float32)),
            Err(EngineError::Configuration(_))
        ));

        let bad = EngineConfig {
            worker_threads: 0,
            ..EngineConfig::default()
        };
        assert!(Engine::init(bad, Backends::new(Arc::new(Echo::default()))).is_err());
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let engine = Engine::init(config(1), Backends::new(Arc::new(Echo::default()))).unwrap();
        engine
            .declare(TensorSpec::gradient("w", 64, DataType::Float32))
            .unwrap();
        engine.shutdown();
        assert_eq!(
            engine.push_pull("w", ContributorId(0), &[0u8; 64]).unwrap_err(),
            EngineError::ShutDown
        );
        // Second shutdown (and the drop after it) is a no-op.
        engine.shutdown();
    }
}
