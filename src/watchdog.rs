use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Restartable one-shot timer: the handler runs once, `timeout` after the
/// most recent arm/reset, unless stopped first.
///
/// The handler must be cheap and non-blocking; it runs on the runtime.
pub struct Watchdog {
    timeout: Duration,
    handler: Arc<dyn Fn() + Send + Sync>,
    timer: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Create the watchdog already armed.
    pub fn new(
        timeout: Duration,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let mut watchdog = Self {
            timeout,
            handler: Arc::new(handler),
            timer: None,
        };
        watchdog.arm();
        watchdog
    }

    fn arm(&mut self) {
        let timeout = self.timeout;
        let handler = Arc::clone(&self.handler);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handler();
        }));
    }

    /// Push the expiry out by a full timeout from now.
    pub fn reset(&mut self) {
        self.stop();
        self.arm();
    }

    /// Cancel the timer; the handler will not run.
    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
