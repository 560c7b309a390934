use tokio::sync::watch;

/// Sending half of a cooperative shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }
}

/// Receiving half; cheap to clone into every task that must stop cooperatively
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> ShutdownSignal {
        let (_, signal) = Self::new();
        signal
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered; pends forever if the trigger is dropped first
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (trigger, signal) = ShutdownSignal::new();
        let mut waiter = signal.clone();

        let handle = tokio::spawn(async move { waiter.wait().await });
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_wait_pends_until_triggered() {
        let (trigger, mut signal) = ShutdownSignal::new();
        let mut wait = tokio_test::task::spawn(signal.wait());

        tokio_test::assert_pending!(wait.poll());
        trigger.trigger();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let mut signal = ShutdownSignal::never();
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.wait()).await;

        assert!(fired.is_err());
        assert!(!signal.is_triggered());
    }
}
