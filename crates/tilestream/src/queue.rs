//! Priority-ordered async job queues.
//!
//! A [`JobQueue`] holds at most one job per tile. Pending jobs are ranked by a
//! replaceable priority callback every time the queue schedules, and at most
//! `max_jobs` of them run at once. Running jobs report back over an
//! `async_channel`; their results are only observed when the owner calls
//! [`JobQueue::poll_completed`], which keeps all state changes on the
//! owner's thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::TileId;
use crate::error::{Error, Result};
use crate::runtime::{JobFuture, TaskSpawner};

/// Inputs available to a priority callback.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PriorityInfo {
    /// The tile the job loads.
    pub tile: TileId,
    /// Distance from the camera to the tile's bounding volume.
    pub distance_to_camera: f64,
    /// Screen-space error of the tile at the last traversal.
    pub screen_space_error: f64,
    /// Depth of the tile in the tree.
    pub depth: u32,
    /// Whether the tile was active at the last traversal (as opposed to
    /// being prefetched as a sibling).
    pub active: bool,
}

/// Ranks pending jobs; higher values start first.
pub type PriorityCallback = Arc<dyn Fn(&PriorityInfo) -> f64 + Send + Sync>;

/// Nearer tiles first.
#[must_use]
pub fn default_priority(info: &PriorityInfo) -> f64 {
    1.0 / info.distance_to_camera
}

/// Creates the future for a job when it starts.
pub type Producer<T> = Box<dyn FnOnce() -> JobFuture<T> + Send>;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for a scheduling pass.
    Pending,
    /// Started and not yet reported back.
    Running,
    /// Finished successfully.
    Done,
    /// Cancelled before it could apply its result.
    Cancelled,
    /// Finished with an error.
    Failed,
}

/// A finished job, as reported by [`JobQueue::poll_completed`].
#[derive(Debug)]
pub enum Completion<T> {
    /// The job produced a value.
    Done {
        /// The job's tile.
        tile: TileId,
        /// The produced value.
        value: T,
    },
    /// The job failed.
    Failed {
        /// The job's tile.
        tile: TileId,
        /// Why it failed.
        error: Error,
    },
    /// The job was cancelled while running; its result was dropped.
    Discarded {
        /// The job's tile.
        tile: TileId,
    },
}

impl<T> Completion<T> {
    /// The tile the job belonged to.
    pub fn tile(&self) -> TileId {
        match self {
            Completion::Done { tile, .. }
            | Completion::Failed { tile, .. }
            | Completion::Discarded { tile } => *tile,
        }
    }

    /// Final state of the job.
    pub fn state(&self) -> JobState {
        match self {
            Completion::Done { .. } => JobState::Done,
            Completion::Failed { .. } => JobState::Failed,
            Completion::Discarded { .. } => JobState::Cancelled,
        }
    }
}

struct PendingJob<T> {
    tile: TileId,
    seq: u64,
    info: PriorityInfo,
    priority: f64,
    producer: Producer<T>,
}

#[derive(Debug, Clone, Copy)]
struct RunningJob {
    seq: u64,
    cancelled: bool,
}

type Report<T> = (TileId, u64, Result<T>);

/// A priority scheduler for one kind of background work.
pub struct JobQueue<T> {
    name: &'static str,
    pending: Vec<PendingJob<T>>,
    running: HashMap<TileId, RunningJob>,
    max_jobs: usize,
    auto_update: bool,
    priority_callback: PriorityCallback,
    next_seq: u64,
    spawner: TaskSpawner,
    report_tx: async_channel::Sender<Report<T>>,
    report_rx: async_channel::Receiver<Report<T>>,
    ready: VecDeque<Report<T>>,
}

impl<T> fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .field("running", &self.running.len())
            .field("max_jobs", &self.max_jobs)
            .field("auto_update", &self.auto_update)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> JobQueue<T> {
    /// Create a queue that runs up to `max_jobs` jobs at once.
    #[must_use]
    pub fn new(name: &'static str, max_jobs: usize, spawner: TaskSpawner) -> Self {
        let (report_tx, report_rx) = async_channel::unbounded();
        Self {
            name,
            pending: Vec::new(),
            running: HashMap::new(),
            max_jobs,
            auto_update: true,
            priority_callback: Arc::new(default_priority),
            next_seq: 0,
            spawner,
            report_tx,
            report_rx,
            ready: VecDeque::new(),
        }
    }

    /// Add a job for `tile`. Returns `false` if the tile already has a
    /// pending or running job. A running job that was cancelled is revived
    /// so its result will be applied after all.
    pub fn enqueue(&mut self, tile: TileId, info: PriorityInfo, producer: Producer<T>) -> bool {
        if self.revive(tile) {
            return true;
        }
        if self.running.contains_key(&tile) || self.pending.iter().any(|j| j.tile == tile) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(PendingJob {
            tile,
            seq,
            info,
            priority: 0.0,
            producer,
        });
        true
    }

    /// Clear the cancellation flag of a running job so its result is
    /// applied. Returns `false` unless such a job exists.
    pub fn revive(&mut self, tile: TileId) -> bool {
        match self.running.get_mut(&tile) {
            Some(running) if running.cancelled => {
                running.cancelled = false;
                tracing::debug!(queue = self.name, %tile, "revived cancelled job");
                true
            }
            _ => false,
        }
    }

    /// Cancel the job for `tile`. A pending job is dropped and never starts;
    /// a running job finishes but its result is discarded. Returns whether a
    /// job was found.
    pub fn cancel(&mut self, tile: TileId) -> bool {
        if let Some(index) = self.pending.iter().position(|j| j.tile == tile) {
            self.pending.remove(index);
            tracing::debug!(queue = self.name, %tile, "cancelled pending job");
            return true;
        }
        if let Some(running) = self.running.get_mut(&tile) {
            running.cancelled = true;
            tracing::debug!(queue = self.name, %tile, "flagged running job as cancelled");
            return true;
        }
        false
    }

    /// Refresh the priority inputs of a pending job.
    pub fn update_info(&mut self, tile: TileId, info: PriorityInfo) -> bool {
        match self.pending.iter_mut().find(|j| j.tile == tile) {
            Some(job) => {
                job.info = info;
                true
            }
            None => false,
        }
    }

    /// Replace the function used to rank pending jobs. Takes effect at the
    /// next scheduling pass.
    pub fn set_priority_callback<F>(&mut self, callback: F)
    where
        F: Fn(&PriorityInfo) -> f64 + Send + Sync + 'static,
    {
        self.priority_callback = Arc::new(callback);
    }

    /// Whether scheduling happens on every [`auto_schedule`](Self::auto_schedule).
    #[must_use]
    pub fn auto_update(&self) -> bool {
        self.auto_update
    }

    /// Enable or disable automatic scheduling.
    pub fn set_auto_update(&mut self, auto_update: bool) {
        self.auto_update = auto_update;
    }

    /// Maximum number of simultaneously running jobs.
    #[must_use]
    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Change the concurrency limit. Running jobs above the new limit finish
    /// normally.
    pub fn set_max_jobs(&mut self, max_jobs: usize) {
        self.max_jobs = max_jobs;
    }

    /// Rank pending jobs and start as many as the concurrency limit allows.
    /// Returns the number of jobs started.
    pub fn schedule_job_run(&mut self) -> usize {
        for job in &mut self.pending {
            job.priority = (self.priority_callback)(&job.info);
        }
        self.pending.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.seq.cmp(&b.seq))
        });

        let slots = self.max_jobs.saturating_sub(self.running.len());
        let count = slots.min(self.pending.len());
        let starting: Vec<PendingJob<T>> = self.pending.drain(..count).collect();
        for job in starting {
            self.start(job);
        }
        count
    }

    /// Scheduling pass run once per tick; does nothing unless
    /// [`auto_update`](Self::auto_update) is set.
    pub fn auto_schedule(&mut self) -> usize {
        if self.auto_update {
            self.schedule_job_run()
        } else {
            0
        }
    }

    fn start(&mut self, job: PendingJob<T>) {
        let PendingJob {
            tile,
            seq,
            producer,
            priority,
            ..
        } = job;
        tracing::trace!(queue = self.name, %tile, priority, "starting job");

        self.running.insert(
            tile,
            RunningJob {
                seq,
                cancelled: false,
            },
        );

        // A panicking job still reports back, so its slot is freed.
        let job = self.spawner.spawn_job(producer());
        let tx = self.report_tx.clone();
        self.spawner.spawn(async move {
            let result = job.await;
            let _ = tx.send((tile, seq, result)).await;
        });
    }

    /// Collect every job that finished since the last call.
    pub fn poll_completed(&mut self) -> Vec<Completion<T>> {
        while let Ok(report) = self.report_rx.try_recv() {
            self.ready.push_back(report);
        }

        let mut completions = Vec::with_capacity(self.ready.len());
        while let Some((tile, seq, result)) = self.ready.pop_front() {
            let Some(running) = self.running.get(&tile).copied() else {
                continue;
            };
            if running.seq != seq {
                continue;
            }
            self.running.remove(&tile);

            let completion = if running.cancelled {
                tracing::debug!(queue = self.name, %tile, "discarding result of cancelled job");
                Completion::Discarded { tile }
            } else {
                match result {
                    Ok(value) => Completion::Done { tile, value },
                    Err(error) => Completion::Failed { tile, error },
                }
            };
            completions.push(completion);
        }
        completions
    }

    /// Wait until every running job has reported back. Results are buffered
    /// for the next [`poll_completed`](Self::poll_completed).
    pub async fn wait_idle(&mut self) {
        while self.ready.len() < self.running.len() {
            match self.report_rx.recv().await {
                Ok(report) => self.ready.push_back(report),
                Err(_) => break,
            }
        }
    }

    /// State of the job for `tile`, if the queue holds one.
    #[must_use]
    pub fn job_state(&self, tile: TileId) -> Option<JobState> {
        if self.pending.iter().any(|j| j.tile == tile) {
            return Some(JobState::Pending);
        }
        self.running.get(&tile).map(|r| {
            if r.cancelled {
                JobState::Cancelled
            } else {
                JobState::Running
            }
        })
    }

    /// Tiles with pending jobs, in the order of the last scheduling pass.
    pub fn pending_tiles(&self) -> impl Iterator<Item = TileId> + '_ {
        self.pending.iter().map(|j| j.tile)
    }

    /// Number of pending jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of running jobs.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Whether nothing is pending or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    type StartLog = Arc<Mutex<Vec<TileId>>>;

    fn ready_job(log: &StartLog, tile: TileId, value: u32) -> Producer<u32> {
        let log = Arc::clone(log);
        Box::new(move || -> JobFuture<u32> {
            log.lock().unwrap().push(tile);
            Box::pin(async move { Ok(value) })
        })
    }

    fn failing_job() -> Producer<u32> {
        Box::new(|| -> JobFuture<u32> {
            Box::pin(async {
                Err(Error::NotFound {
                    uri: "x".to_string(),
                })
            })
        })
    }

    fn explode() -> u32 {
        panic!("job blew up")
    }

    fn panicking_job() -> Producer<u32> {
        Box::new(|| -> JobFuture<u32> { Box::pin(async { Ok(explode()) }) })
    }

    fn info(tile: u32, distance: f64) -> PriorityInfo {
        PriorityInfo {
            tile: TileId(tile),
            distance_to_camera: distance,
            ..PriorityInfo::default()
        }
    }

    fn queue(max_jobs: usize) -> JobQueue<u32> {
        JobQueue::new("test", max_jobs, TaskSpawner::current())
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let log = StartLog::default();
        let mut q = queue(1);
        assert!(q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 1)));
        assert!(!q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 1)));
        assert_eq!(q.pending_count(), 1);

        q.schedule_job_run();
        assert_eq!(q.job_state(TileId(1)), Some(JobState::Running));
        assert!(!q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 1)));
        assert_eq!(q.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_higher_priority_starts_first() {
        let log = StartLog::default();
        let mut q = queue(1);
        q.enqueue(TileId(1), info(1, 100.0), ready_job(&log, TileId(1), 1));
        q.enqueue(TileId(2), info(2, 10.0), ready_job(&log, TileId(2), 2));
        q.enqueue(TileId(3), info(3, 1.0), ready_job(&log, TileId(3), 3));

        for _ in 0..3 {
            assert_eq!(q.schedule_job_run(), 1);
            q.wait_idle().await;
            assert_eq!(q.poll_completed().len(), 1);
        }
        assert_eq!(*log.lock().unwrap(), vec![TileId(3), TileId(2), TileId(1)]);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_enqueue_order() {
        let log = StartLog::default();
        let mut q = queue(4);
        q.set_priority_callback(|_| 1.0);
        for tile in [5, 2, 9, 1] {
            q.enqueue(TileId(tile), info(tile, 1.0), ready_job(&log, TileId(tile), tile));
        }
        assert_eq!(q.schedule_job_run(), 4);
        assert_eq!(
            *log.lock().unwrap(),
            vec![TileId(5), TileId(2), TileId(9), TileId(1)]
        );
    }

    #[tokio::test]
    async fn test_priority_callback_and_info_refresh() {
        let log = StartLog::default();
        let mut q = queue(1);
        q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 1));
        q.enqueue(TileId(2), info(2, 50.0), ready_job(&log, TileId(2), 2));

        // Farthest first.
        q.set_priority_callback(|i| i.distance_to_camera);
        // The camera moved: tile 1 is now the farther one.
        assert!(q.update_info(TileId(1), info(1, 500.0)));
        q.schedule_job_run();
        assert_eq!(*log.lock().unwrap(), vec![TileId(1)]);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let log = StartLog::default();
        let mut q = queue(2);
        for tile in 0..5 {
            q.enqueue(TileId(tile), info(tile, 1.0), ready_job(&log, TileId(tile), tile));
        }
        assert_eq!(q.schedule_job_run(), 2);
        assert_eq!(q.running_count(), 2);
        assert_eq!(q.pending_count(), 3);

        // Nothing finished yet, so no slots free up.
        assert_eq!(q.schedule_job_run(), 0);

        q.wait_idle().await;
        assert_eq!(q.poll_completed().len(), 2);
        assert_eq!(q.schedule_job_run(), 2);
    }

    #[tokio::test]
    async fn test_auto_update_gates_auto_schedule() {
        let log = StartLog::default();
        let mut q = queue(1);
        q.set_auto_update(false);
        q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 1));
        assert_eq!(q.auto_schedule(), 0);
        assert_eq!(q.pending_count(), 1);

        // Explicit passes still run.
        assert_eq!(q.schedule_job_run(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_never_starts() {
        let log = StartLog::default();
        let mut q = queue(1);
        q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 1));
        assert!(q.cancel(TileId(1)));
        assert_eq!(q.schedule_job_run(), 0);
        assert!(log.lock().unwrap().is_empty());
        assert!(q.is_idle());
        assert!(!q.cancel(TileId(1)));
    }

    #[tokio::test]
    async fn test_cancelled_running_job_is_discarded() {
        let log = StartLog::default();
        let mut q = queue(1);
        q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 1));
        q.schedule_job_run();
        assert!(q.cancel(TileId(1)));
        assert_eq!(q.job_state(TileId(1)), Some(JobState::Cancelled));

        q.wait_idle().await;
        let completions = q.poll_completed();
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0], Completion::Discarded { tile } if tile == TileId(1)));
        assert!(q.is_idle());
    }

    #[tokio::test]
    async fn test_reenqueue_revives_cancelled_running_job() {
        let log = StartLog::default();
        let mut q = queue(1);
        q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 7));
        q.schedule_job_run();
        q.cancel(TileId(1));
        assert!(q.enqueue(TileId(1), info(1, 1.0), ready_job(&log, TileId(1), 7)));
        assert_eq!(q.pending_count(), 0);

        q.wait_idle().await;
        let completions = q.poll_completed();
        assert!(matches!(completions[0], Completion::Done { value: 7, .. }));
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let mut q = queue(1);
        q.enqueue(TileId(4), info(4, 1.0), failing_job());
        q.schedule_job_run();
        q.wait_idle().await;
        let completions = q.poll_completed();
        assert_eq!(completions[0].state(), JobState::Failed);
        assert_eq!(completions[0].tile(), TileId(4));
        assert_eq!(q.running_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_frees_its_slot() {
        let log = StartLog::default();
        let mut q = queue(1);
        q.enqueue(TileId(1), info(1, 1.0), panicking_job());
        q.enqueue(TileId(2), info(2, 2.0), ready_job(&log, TileId(2), 2));

        assert_eq!(q.schedule_job_run(), 1);
        q.wait_idle().await;
        let completions = q.poll_completed();
        assert!(matches!(
            &completions[0],
            Completion::Failed { tile, error: Error::TaskFailed { .. } } if *tile == TileId(1)
        ));
        assert_eq!(q.running_count(), 0);

        assert_eq!(q.schedule_job_run(), 1);
        q.wait_idle().await;
        assert!(matches!(q.poll_completed()[0], Completion::Done { value: 2, .. }));
        assert!(q.is_idle());
    }

    #[test]
    fn test_default_priority_prefers_near_tiles() {
        assert!(default_priority(&info(0, 1.0)) > default_priority(&info(0, 10.0)));
        assert!(default_priority(&info(0, 0.0)).is_infinite());
    }
}
