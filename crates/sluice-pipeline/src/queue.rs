//! Priority task queue feeding the worker pool.
//!
//! Tasks pop in ascending `(priority, insertion sequence)` order. An optional
//! bound blocks producer pushes while the queue is full; follow-on pushes
//! issued by workers bypass it so the pool can never wedge on its own queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::{Condvar, Mutex};
use sluice_types::{PartitionId, Stage};

// ── Task ──────────────────────────────────────────────────────────────────────

/// One `(partition, stage)` work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub partition_id: PartitionId,
    pub tensor_key: String,
    pub stage: Stage,
    pub priority: i64,
    /// Step generation of the owning tensor when the task was created.
    pub generation: u64,
}

struct Queued {
    seq: u64,
    task: Task,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; lowest (priority, seq) must come out first.
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

struct State {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    shutdown: bool,
}

pub struct TaskQueue {
    bound: Option<usize>,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    pub fn new(bound: Option<usize>) -> Self {
        Self {
            bound: bound.map(|b| b.max(1)),
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Producer-side push. Blocks while the queue holds `bound` tasks.
    /// Returns `false` once the queue has been shut down.
    pub fn push(&self, task: Task) -> bool {
        let mut state = self.state.lock();
        if let Some(bound) = self.bound {
            while state.heap.len() >= bound && !state.shutdown {
                self.not_full.wait(&mut state);
            }
        }
        self.enqueue(&mut state, task)
    }

    /// Worker-side push for the next stage of a partition; never blocks.
    pub fn push_follow_on(&self, task: Task) -> bool {
        let mut state = self.state.lock();
        self.enqueue(&mut state, task)
    }

    fn enqueue(&self, state: &mut State, task: Task) -> bool {
        if state.shutdown {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Queued { seq, task });
        self.not_empty.notify_one();
        true
    }

    /// Block until a task is available. `None` after shutdown.
    pub fn pop_next(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(queued) = state.heap.pop() {
                self.not_full.notify_one();
                return Some(queued.task);
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Remove and return every queued task matching `pred`.
    pub fn drain<F>(&self, pred: F) -> Vec<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let mut state = self.state.lock();
        let (drained, kept): (Vec<Queued>, Vec<Queued>) =
            std::mem::take(&mut state.heap)
                .into_vec()
                .into_iter()
                .partition(|q| pred(&q.task));
        state.heap = BinaryHeap::from(kept);
        if !drained.is_empty() {
            self.not_full.notify_all();
        }

        let mut drained = drained;
        drained.sort_by_key(|q| q.seq);
        drained.into_iter().map(|q| q.task).collect()
    }

    /// Wake every waiter; later pushes are refused and pops return `None`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
