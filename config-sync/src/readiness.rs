use tokio::sync::watch;

/// One-shot gate opened when bootstrap completes. It never closes again and waiting on
/// it never fails.
pub struct ReadinessGate {
    tx: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        ReadinessGate { tx }
    }

    /// Opens the gate. Returns false if it was already open.
    pub fn set_ready(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        ReadinessGate::new()
    }
}
