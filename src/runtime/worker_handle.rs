use tokio::sync::mpsc;

/// Keeps a worker task alive. The worker stops once every clone has been dropped.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _sender: mpsc::Sender<()>,
}

impl WorkerHandle {
    #[cfg(test)]
    pub(crate) fn new_mocked() -> Self {
        WorkerHandleListener::channel().0
    }
}

/// The worker's side of its handles.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        // Nothing is ever sent; the channel only reports when the last sender is gone.
        let (sender, receiver) = mpsc::channel(1);
        (
            WorkerHandle { _sender: sender },
            WorkerHandleListener { receiver },
        )
    }

    /// Resolves once every handle is gone. Only meant to be raced in a `select!`.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.receiver.recv().await;
    }
}
