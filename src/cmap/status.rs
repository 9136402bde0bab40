use tokio::sync::watch;

use super::{conn::pooled::PooledConnection, PoolGeneration};
use crate::error::Error;

/// What the pool worker shares with everything outside its task.
#[derive(Clone, Debug)]
struct PoolStatus {
    generation: PoolGeneration,

    /// The error that caused the most recent clear, if the pool was ever cleared.
    clear_cause: Option<Error>,
}

pub(super) fn channel(init: PoolGeneration) -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = watch::channel(PoolStatus {
        generation: init,
        clear_cause: None,
    });
    (
        PoolGenerationPublisher { sender },
        PoolGenerationSubscriber { receiver },
    )
}

/// Held by the pool worker, which is the only writer of the status.
#[derive(Debug)]
pub(super) struct PoolGenerationPublisher {
    sender: watch::Sender<PoolStatus>,
}

impl PoolGenerationPublisher {
    /// Publish the generation a clear moved the pool to, together with what caused the clear.
    pub(super) fn publish_clear(&self, generation: PoolGeneration, cause: Error) {
        self.sender.send_replace(PoolStatus {
            generation,
            clear_cause: Some(cause),
        });
    }

    pub(super) fn subscribe(&self) -> PoolGenerationSubscriber {
        PoolGenerationSubscriber {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Read side of the pool status.
#[derive(Clone, Debug)]
pub(crate) struct PoolGenerationSubscriber {
    receiver: watch::Receiver<PoolStatus>,
}

impl PoolGenerationSubscriber {
    pub(crate) fn generation(&self) -> PoolGeneration {
        self.receiver.borrow().generation.clone()
    }

    /// If the pool was cleared after `connection` started establishing, the cause of that clear.
    pub(super) fn cleared_since(&self, connection: &PooledConnection) -> Option<Error> {
        let status = self.receiver.borrow();
        if !connection.is_stale(&status.generation) {
            return None;
        }
        Some(
            status
                .clear_cause
                .clone()
                .unwrap_or_else(|| Error::internal("the connection pool was cleared")),
        )
    }
}
