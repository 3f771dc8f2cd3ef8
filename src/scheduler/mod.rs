use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};
use crate::session::Session;
use crate::table::PackLevel;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

impl Context {
    /// True once the scheduler has started shutting down.
    pub fn is_shutting_down(&mut self) -> bool {
        !matches!(self.shutdown.try_recv(), Err(TryRecvError::Empty))
    }
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.handles().push(handle);
        self
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `task` on its interval until shutdown. Ticks missed while a
    /// run is still going are skipped, not replayed.
    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            for run_id in 1u64.. {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                    shutdown: shutdown_rx.resubscribe(),
                };
                if let Err(e) = task.execute(ctx).await {
                    tracing::error!(task = task.name(), run_id, error = %e, "task run failed");
                }
            }
            tracing::info!(task = task.name(), "task stopped");
        })
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        let handles: Vec<JoinHandle<()>> = self.handles().drain(..).collect();
        for task in handles {
            task.await
                .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically bucketizes a set of tables and clears out orphaned buckets
/// older than the configured grace period.
pub struct BucketizeTask {
    session: Session,
    tables: Vec<PathBuf>,
    pack_level: PackLevel,
    max_new_buckets: usize,
}

impl BucketizeTask {
    /// Uses the pack level and bucket limit from the session's bucket
    /// configuration.
    pub fn new(session: Session, tables: Vec<PathBuf>) -> Self {
        let bucket = &session.config().bucket;
        let pack_level = bucket.pack_level;
        let max_new_buckets = bucket.max_new_buckets;
        Self {
            session,
            tables,
            pack_level,
            max_new_buckets,
        }
    }

    pub fn pack_level(mut self, level: PackLevel) -> Self {
        self.pack_level = level;
        self
    }

    async fn run_table(&self, table: PathBuf) -> Result<usize> {
        let session = self.session.clone();
        let pack_level = self.pack_level;
        let max_new_buckets = self.max_new_buckets;
        tokio::task::spawn_blocking(move || {
            let manager = session.bucket_manager();
            let created = manager.bucketize(&table, pack_level, max_new_buckets)?;
            manager.delete_orphan_buckets(&table, manager.config().orphan_grace)?;
            Ok(created)
        })
        .await
        .map_err(|e| Error::InvalidState(format!("bucketize join error: {}", e)))?
    }
}

#[async_trait::async_trait]
impl BackgroundTask for BucketizeTask {
    fn name(&self) -> &'static str {
        "bucketize"
    }

    fn interval(&self) -> Duration {
        self.session.config().scheduler.bucketize_interval
    }

    async fn execute(&self, mut ctx: Context) -> Result<()> {
        let mut created = 0;
        for table in &self.tables {
            if ctx.is_shutting_down() {
                tracing::info!(task = ctx.task_name, run_id = ctx.run_id, "stopping between tables");
                break;
            }
            // One failing table must not starve the others.
            match self.run_table(table.clone()).await {
                Ok(n) => created += n,
                Err(e) => tracing::warn!(
                    task = ctx.task_name,
                    table = %table.display(),
                    error = %e,
                    "bucketize failed"
                ),
            }
        }
        tracing::debug!(task = ctx.task_name, run_id = ctx.run_id, created, "bucketize run finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketConfig, EngineConfig, SchedulerConfig};
    use crate::table::DictionaryTable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts runs and fails every one of them when `fail` is set.
    struct CountingTask {
        interval: Duration,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidState("run failed".to_string()));
            }
            Ok(())
        }
    }

    fn write_table(dir: &std::path::Path, n: usize) -> PathBuf {
        let mut dict = String::new();
        for i in 1..=n {
            std::fs::write(
                dir.join(format!("pn{}.gor", i)),
                format!("Chrom\tPos\tData\nchr1\t{i}\tv{i}\n"),
            )
            .unwrap();
            dict.push_str(&format!("pn{}.gor\tpn{}\n", i, i));
        }
        let path = dir.join("t.gord");
        std::fs::write(&path, dict).unwrap();
        path
    }

    fn session(interval: Duration) -> Session {
        Session::new(
            EngineConfig::new()
                .bucket(BucketConfig::default().bucket_size(2))
                .scheduler(SchedulerConfig::default().bucketize_interval(interval)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failing_task_keeps_its_schedule() -> Result<()> {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            runs: runs.clone(),
            fail: true,
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown().await?;
        assert!(runs.load(Ordering::SeqCst) > 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_long_interval() -> Result<()> {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_secs(3600),
            runs: runs.clone(),
            fail: false,
        }));

        // The first tick fires immediately; the next is an hour away.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bucketize_task_runs_on_schedule() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let table = write_table(dir.path(), 3);
        let scheduler = Scheduler::new();
        let task = Arc::new(BucketizeTask::new(
            session(Duration::from_millis(10)),
            vec![table.clone()],
        ));
        assert_eq!(task.name(), "bucketize");
        assert_eq!(task.interval(), Duration::from_millis(10));

        scheduler.register(task);
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await?;

        let loaded = DictionaryTable::load(&table)?;
        assert!(loaded.entries().iter().all(|e| e.is_bucketed()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bucketize_task_skips_broken_tables() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let good = write_table(dir.path(), 2);
        let missing = dir.path().join("missing.gord");
        let task = BucketizeTask::new(session(Duration::from_secs(60)), vec![missing, good.clone()]);

        let (_tx, rx) = broadcast::channel(1);
        task.execute(Context {
            task_name: "bucketize",
            run_id: 1,
            shutdown: rx,
        })
        .await?;

        let loaded = DictionaryTable::load(&good)?;
        assert!(loaded.entries().iter().all(|e| e.is_bucketed()));
        Ok(())
    }

    #[tokio::test]
    async fn test_bucketize_task_stops_on_shutdown() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let table = write_table(dir.path(), 2);
        let task = BucketizeTask::new(session(Duration::from_secs(60)), vec![table.clone()])
            .pack_level(PackLevel::Full);

        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        task.execute(Context {
            task_name: "bucketize",
            run_id: 1,
            shutdown: rx,
        })
        .await?;

        let loaded = DictionaryTable::load(&table)?;
        assert!(loaded.entries().iter().all(|e| !e.is_bucketed()));
        Ok(())
    }
}
