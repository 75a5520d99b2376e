//! Handle for a running consumer task.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Returned by subscribe and process-jobs calls
///
/// Cancelling stops the consumer within one receive interval. Dropping the
/// handle leaves the consumer running until its parent token or the driver
/// is shut down.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: Uuid,
    target: String,
    group: Option<String>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        target: impl Into<String>,
        group: Option<String>,
        token: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            group,
            token,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Topic or queue this consumer reads
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit without cancelling it
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Cancel and wait for the task to exit
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}
