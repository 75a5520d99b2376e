//! Lifecycle, task tracking, and handler dispatch shared by every driver.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DriverKind;
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::message::{Job, Message};
use crate::messaging::retry::RetryPolicy;
use crate::messaging::stats::AtomicBrokerStats;
use crate::messaging::subscription::SubscriptionHandle;
use crate::messaging::traits::{JobHandler, MessageHandler};

/// Fires when either the consumer's own token or the driver shuts down
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    token: CancellationToken,
    shutdown: CancellationToken,
}

impl StopSignal {
    pub async fn wait(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled() || self.shutdown.is_cancelled()
    }

    /// Sleep for `duration`; false if stopped first
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// What a consumer should do after its handler ran
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Handled,
    Retry(T, Duration),
    Dropped,
}

#[derive(Debug)]
pub(crate) struct DriverCore {
    kind: DriverKind,
    closed: AtomicBool,
    shutdown: CancellationToken,
    pub stats: AtomicBrokerStats,
    pub retry: RetryPolicy,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl DriverCore {
    pub fn new(kind: DriverKind, retry: RetryPolicy) -> Self {
        Self {
            kind,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            stats: AtomicBrokerStats::new(),
            retry,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            Err(BrokerError::closed(self.name()))
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Signal for tasks that live as long as the driver
    pub fn lifetime(&self) -> StopSignal {
        StopSignal {
            token: self.shutdown.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Spawn a consumer bound to a child of `parent`
    pub fn spawn_consumer<F, Fut>(
        &self,
        target: &str,
        group: Option<&str>,
        parent: &CancellationToken,
        run: F,
    ) -> SubscriptionHandle
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let stop = StopSignal {
            token: token.clone(),
            shutdown: self.shutdown.clone(),
        };
        let task = tokio::spawn(run(stop));
        self.track(task.abort_handle());
        SubscriptionHandle::new(target, group.map(str::to_string), token, task)
    }

    /// Spawn a driver-lifetime task such as a dispatcher or watcher
    pub fn spawn_background<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(fut);
        self.track(task.abort_handle());
    }

    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Flip to closed; true only for the first caller
    pub fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        debug!(driver = self.name(), tasks = tasks.len(), "Stopping background tasks");
        for task in tasks {
            task.abort();
        }
        self.stats.set_active_connections(0);
        true
    }

    /// Run a message handler and decide whether to retry
    pub async fn dispatch_message(
        &self,
        handler: &dyn MessageHandler,
        message: Message,
    ) -> Outcome<Message> {
        self.stats.record_consumed();
        let result = {
            let _in_flight = self.stats.in_flight();
            handler.handle(message.clone()).await
        };

        match result {
            Ok(()) => Outcome::Handled,
            Err(err) => {
                self.stats.record_failed();
                warn!(
                    driver = self.name(),
                    topic = %message.topic,
                    message_id = %message.id,
                    retry_count = message.retry_count,
                    error = %err,
                    "Message handler failed"
                );
                match message.next_retry() {
                    Some(retry) => {
                        let delay = self.retry.delay_for(retry.retry_count);
                        Outcome::Retry(retry, delay)
                    }
                    None => {
                        let exhausted = BrokerError::MaxRetriesExceeded {
                            message_id: message.id.clone(),
                            retries: message.retry_count,
                        };
                        warn!(driver = self.name(), topic = %message.topic, error = %exhausted, "Dropping message");
                        Outcome::Dropped
                    }
                }
            }
        }
    }

    /// Claim a job, run its handler, and decide whether to re-enqueue
    pub async fn dispatch_job(&self, handler: &dyn JobHandler, mut job: Job) -> Outcome<Job> {
        job.begin_attempt();
        let result = {
            let _in_flight = self.stats.in_flight();
            handler.handle(job.clone()).await
        };

        match result {
            Ok(()) => {
                self.stats.record_job_processed();
                Outcome::Handled
            }
            Err(err) => {
                self.stats.record_job_failed();
                warn!(
                    driver = self.name(),
                    queue = %job.queue,
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %err,
                    "Job handler failed"
                );
                if job.can_retry() {
                    let delay = self.retry.delay_for(job.attempts);
                    job.delay = delay;
                    Outcome::Retry(job, delay)
                } else {
                    warn!(driver = self.name(), queue = %job.queue, job_id = %job.id, "Dropping job after final attempt");
                    Outcome::Dropped
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn core() -> DriverCore {
        DriverCore::new(DriverKind::Memory, RetryPolicy::immediate(2))
    }

    #[test]
    fn test_close_is_idempotent() {
        let core = core();
        assert!(core.ensure_open().is_ok());
        assert!(core.begin_close());
        assert!(!core.begin_close());
        assert!(matches!(
            core.ensure_open(),
            Err(BrokerError::BrokerClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_message_outcomes() {
        let core = core();
        let handler = |_msg: Message| async { Err::<(), _>(anyhow::anyhow!("boom")) };

        let msg = Message::new("t", Vec::new()).with_max_retries(1);
        let retry = match core.dispatch_message(&handler, msg).await {
            Outcome::Retry(retry, _) => retry,
            other => panic!("expected retry, got {other:?}"),
        };
        assert_eq!(retry.retry_count, 1);
        assert!(matches!(
            core.dispatch_message(&handler, retry).await,
            Outcome::Dropped
        ));

        let snap = core.stats.snapshot("memory", 0, 0, Default::default());
        assert_eq!(snap.messages_consumed, 2);
        assert_eq!(snap.messages_failed, 2);
    }

    #[tokio::test]
    async fn test_dispatch_job_marks_attempt() {
        let core = core();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let handler = move |job: Job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.store(job.attempts, Ordering::SeqCst);
                assert!(job.processed_at.is_some());
                Ok::<(), anyhow::Error>(())
            }
        };

        let outcome = core.dispatch_job(&handler, Job::new("q", "h", Vec::new())).await;
        assert!(matches!(outcome, Outcome::Handled));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consumer_stops_on_shutdown() {
        let core = core();
        let parent = CancellationToken::new();
        let handle = core.spawn_consumer("t", None, &parent, |stop| async move {
            stop.wait().await;
        });
        core.begin_close();
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }
}
