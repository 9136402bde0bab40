use tokio::sync::oneshot;

/// A request sent to a worker task together with a channel for the worker's answer. The
/// requester learns that the request was dropped unanswered when the worker discards it.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    message: M,
    acknowledger: AcknowledgmentSender<R>,
}

impl<M, R> AcknowledgedMessage<M, R> {
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message,
                acknowledger: AcknowledgmentSender { sender },
            },
            AcknowledgmentReceiver { receiver },
        )
    }

    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        self.acknowledger.acknowledge(result)
    }

    /// Split the request from its acknowledger so the worker can answer after handling it.
    pub(crate) fn into_parts(self) -> (M, AcknowledgmentSender<R>) {
        (self.message, self.acknowledger)
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentSender<R> {
    sender: oneshot::Sender<R>,
}

impl<R> AcknowledgmentSender<R> {
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        // The requester may have stopped waiting, e.g. after its own timeout.
        let _: std::result::Result<_, _> = self.sender.send(result.into());
    }
}

pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// The worker's answer, or `None` if it dropped the request without answering.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
