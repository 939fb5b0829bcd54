//! In-process work queue and worker pool.
//!
//! Producers hold a cloneable [`WorkQueue`]; workers share one receiver and
//! each processes a run end to end before taking the next id. The pool stops
//! once every producer handle is dropped and the queue is drained.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::error::{EngineError, Result};
use crate::executor::{RunExecutor, RunOutcome};

/// Anything that can process a run by id
#[async_trait]
pub trait RunProcessor: Send + Sync {
    async fn process(&self, run_id: &str) -> Result<RunOutcome>;
}

#[async_trait]
impl RunProcessor for RunExecutor {
    async fn process(&self, run_id: &str) -> Result<RunOutcome> {
        RunExecutor::process(self, run_id).await
    }
}

#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug)]
pub struct WorkReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
}

/// Create a connected queue/receiver pair
pub fn work_queue() -> (WorkQueue, WorkReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        WorkQueue { tx },
        WorkReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl WorkQueue {
    pub fn enqueue(&self, run_id: &str) -> Result<()> {
        self.tx
            .send(run_id.to_string())
            .map_err(|_| EngineError::Store("work queue is closed".to_string()))?;
        log::debug!("Enqueued run {}", run_id);
        Ok(())
    }
}

impl WorkReceiver {
    async fn next(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

/// Tally of what the workers did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub reviewing: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl PoolReport {
    pub fn processed(&self) -> usize {
        self.reviewing + self.failed + self.skipped + self.errors
    }

    fn record(&mut self, result: &Result<RunOutcome>) {
        match result {
            Ok(RunOutcome::Reviewing { .. }) => self.reviewing += 1,
            Ok(RunOutcome::Failed(_)) => self.failed += 1,
            Ok(RunOutcome::Skipped(_)) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }

    fn merge(mut self, other: PoolReport) -> Self {
        self.reviewing += other.reviewing;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self
    }
}

pub struct WorkerPool {
    processor: Arc<dyn RunProcessor>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(processor: Arc<dyn RunProcessor>, workers: usize) -> Self {
        Self {
            processor,
            workers: workers.max(1),
        }
    }

    /// Run the workers until the queue closes and drains
    pub async fn run(&self, receiver: WorkReceiver) -> PoolReport {
        let receiver = Arc::new(receiver);
        let handles: Vec<_> = (0..self.workers)
            .map(|worker| {
                let processor = Arc::clone(&self.processor);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move { Self::work(worker, processor, receiver).await })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .fold(PoolReport::default(), |acc, joined| match joined {
                Ok(report) => acc.merge(report),
                Err(e) => {
                    log::error!("Worker task panicked: {}", e);
                    acc
                }
            })
    }

    async fn work(worker: usize, processor: Arc<dyn RunProcessor>, receiver: Arc<WorkReceiver>) -> PoolReport {
        let mut report = PoolReport::default();
        while let Some(run_id) = receiver.next().await {
            log::info!("Worker {} processing run {}", worker, run_id);
            let result = processor.process(&run_id).await;
            match &result {
                Ok(RunOutcome::Reviewing { iteration }) => {
                    log::info!("Run {} reached REVIEWING (iteration {})", run_id, iteration.index)
                }
                Ok(RunOutcome::Failed(reason)) => log::error!("Run {} failed: {}", run_id, reason),
                Ok(RunOutcome::Skipped(why)) => log::info!("Run {} skipped: {}", run_id, why),
                Err(e) => log::error!("Run {} errored: {}", run_id, e),
            }
            report.record(&result);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use std::sync::Mutex as StdMutex;

    struct FakeProcessor {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl RunProcessor for FakeProcessor {
        async fn process(&self, run_id: &str) -> Result<RunOutcome> {
            self.seen.lock().unwrap().push(run_id.to_string());
            match run_id {
                "fail" => Ok(RunOutcome::Failed(FailureReason::ApplyFailed)),
                "skip" => Ok(RunOutcome::Skipped("locked".to_string())),
                "missing" => Err(EngineError::RunNotFound(run_id.to_string())),
                _ => Ok(RunOutcome::Skipped("noop".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let processor = Arc::new(FakeProcessor {
            seen: StdMutex::new(Vec::new()),
        });
        let (queue, receiver) = work_queue();
        for id in ["fail", "skip", "missing", "other"] {
            queue.enqueue(id).unwrap();
        }
        drop(queue);

        let report = WorkerPool::new(processor.clone(), 3).run(receiver).await;
        assert_eq!(report.processed(), 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.errors, 1);

        let mut seen = processor.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["fail", "missing", "other", "skip"]);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let (queue, receiver) = work_queue();
        drop(receiver);
        assert!(queue.enqueue("x").is_err());
    }

    #[tokio::test]
    async fn test_empty_queue_finishes() {
        let processor = Arc::new(FakeProcessor {
            seen: StdMutex::new(Vec::new()),
        });
        let (queue, receiver) = work_queue();
        drop(queue);
        let report = WorkerPool::new(processor, 0).run(receiver).await;
        assert_eq!(report, PoolReport::default());
    }
}
