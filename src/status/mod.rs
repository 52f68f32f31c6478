use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_CLEAR_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Busy,
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub level: StatusLevel,
    pub text: String,
}

/// Transient pipeline/dispatcher status with a debounced auto-clear: every
/// `set` replaces the current status and re-arms a single clear timer, so a
/// burst of updates ends with one clear after the last of them.
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<Mutex<StatusInner>>,
    clear_after: Duration,
}

struct StatusInner {
    current: Option<Status>,
    epoch: u64,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::with_clear_after(DEFAULT_CLEAR_AFTER)
    }

    pub fn with_clear_after(clear_after: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusInner {
                current: None,
                epoch: 0,
            })),
            clear_after,
        }
    }

    pub fn set(&self, level: StatusLevel, text: impl Into<String>) {
        let text = text.into();
        let epoch = {
            let mut inner = self.inner.lock().unwrap();
            inner.epoch += 1;
            inner.current = Some(Status { level, text });
            inner.epoch
        };
        let this = self.inner.clone();
        let clear_after = self.clear_after;
        tokio::spawn(async move {
            tokio::time::sleep(clear_after).await;
            let mut inner = this.lock().unwrap();
            // A later set supersedes this timer.
            if inner.epoch == epoch {
                inner.current = None;
            }
        });
    }

    pub fn current(&self) -> Option<Status> {
        self.inner.lock().unwrap().current.clone()
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn status_clears_after_the_configured_delay() {
        let reporter = StatusReporter::with_clear_after(Duration::from_secs(5));
        reporter.set(StatusLevel::Ok, "result code: I0");
        assert_eq!(
            reporter.current().unwrap().text,
            "result code: I0".to_string()
        );
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(reporter.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_newer_status_cancels_the_pending_clear() {
        let reporter = StatusReporter::with_clear_after(Duration::from_secs(5));
        reporter.set(StatusLevel::Busy, "first");
        tokio::time::sleep(Duration::from_secs(3)).await;
        reporter.set(StatusLevel::Ok, "second");
        // The first timer firing at t=5 must not clear the second status.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(reporter.current().unwrap().text, "second".to_string());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(reporter.current().is_none());
    }
}
